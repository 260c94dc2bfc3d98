//! Field-name mapping for payload keys.
//!
//! The gateway exchanges payloads with short keys by default (`"s"` for
//! `"service"`, `"T"` for `"transport"`, ...). [`Naming`] picks the form used
//! when encoding; decoding accepts either.

use super::value::{Map, Value};

/// Long name to compact name.
const FIELD_NAMES: &[(&str, &str)] = &[
    ("action", "a"),
    ("arguments", "ar"),
    ("body", "b"),
    ("call", "c"),
    ("calls", "C"),
    ("caller", "cl"),
    ("code", "cd"),
    ("command", "cm"),
    ("command_reply", "cr"),
    ("data", "d"),
    ("datetime", "dt"),
    ("duration", "du"),
    ("errors", "e"),
    ("error", "E"),
    ("files", "f"),
    ("filename", "fn"),
    ("gateway", "g"),
    ("headers", "h"),
    ("id", "i"),
    ("level", "l"),
    ("links", "L"),
    ("message", "m"),
    ("meta", "M"),
    ("method", "mt"),
    ("mime", "mi"),
    ("name", "n"),
    ("origin", "o"),
    ("params", "p"),
    ("path", "pa"),
    ("properties", "pr"),
    ("relations", "r"),
    ("request", "rq"),
    ("response", "R"),
    ("result", "rs"),
    ("return", "rv"),
    ("scope", "sc"),
    ("service", "s"),
    ("size", "sz"),
    ("status", "st"),
    ("timeout", "x"),
    ("token", "tk"),
    ("transactions", "t"),
    ("transport", "T"),
    ("type", "ty"),
    ("uri", "u"),
    ("url", "ur"),
    ("value", "v"),
    ("version", "vr"),
];

/// Which key form to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Naming {
    #[default]
    Compact,
    Full,
}

impl Naming {
    /// Key to write for a long field name.
    ///
    /// Names without a compact form are returned unchanged.
    pub fn key(self, full: &'static str) -> &'static str {
        match self {
            Naming::Full => full,
            Naming::Compact => compact_name(full).unwrap_or(full),
        }
    }

    /// Insert `value` under the key for `full`.
    pub fn insert(self, map: &mut Map, full: &'static str, value: Value) {
        map.insert(self.key(full).to_string(), value);
    }
}

/// Compact form of a long field name.
pub fn compact_name(full: &str) -> Option<&'static str> {
    FIELD_NAMES
        .iter()
        .find(|(long, _)| *long == full)
        .map(|(_, short)| *short)
}

/// Long form of a compact field name.
pub fn full_name(compact: &str) -> Option<&'static str> {
    FIELD_NAMES
        .iter()
        .find(|(_, short)| *short == compact)
        .map(|(long, _)| *long)
}

/// Read a field from a map under either key form.
pub fn field<'a>(map: &'a Map, full: &'static str) -> Option<&'a Value> {
    map.get(full)
        .or_else(|| compact_name(full).and_then(|short| map.get(short)))
}

/// Read a field from a map value under either key form.
pub fn field_of<'a>(value: &'a Value, full: &'static str) -> Option<&'a Value> {
    value.as_map().and_then(|map| field(map, full))
}

/// Read a string field, defaulting to empty.
pub fn str_field(map: &Map, full: &'static str) -> String {
    field(map, full)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_mapping_is_bijective() {
        let longs: HashSet<_> = FIELD_NAMES.iter().map(|(l, _)| l).collect();
        let shorts: HashSet<_> = FIELD_NAMES.iter().map(|(_, s)| s).collect();
        assert_eq!(longs.len(), FIELD_NAMES.len());
        assert_eq!(shorts.len(), FIELD_NAMES.len());
    }

    #[test]
    fn test_key_forms() {
        assert_eq!(Naming::Compact.key("transport"), "T");
        assert_eq!(Naming::Full.key("transport"), "transport");
        assert_eq!(Naming::Compact.key("unmapped"), "unmapped");
        assert_eq!(full_name("cr"), Some("command_reply"));
    }

    #[test]
    fn test_field_reads_either_form() {
        let mut map = Map::new();
        map.insert("s".into(), Value::from("users"));
        map.insert("version".into(), Value::from("1.0"));
        assert_eq!(str_field(&map, "service"), "users");
        assert_eq!(str_field(&map, "version"), "1.0");
        assert_eq!(str_field(&map, "action"), "");
    }
}
