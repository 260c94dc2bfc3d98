//! Version pattern resolution.
//!
//! A pattern is a dotted version where a segment may be a lone `*` (any value
//! at that position) or end in `*` (prefix match within the segment). A bare
//! `*` pattern matches every version. Among matching versions the highest one
//! wins.
//!
//! # Example
//!
//! ```
//! use callmesh::version::resolve;
//!
//! let picked = resolve("users", "1.*", ["1.0", "1.2", "2.0"]).unwrap();
//! assert_eq!(picked, "1.2");
//! ```

use std::cmp::Ordering;

use crate::error::{CallmeshError, Result};

/// One segment of a version pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Any,
    Prefix(String),
    Exact(String),
}

impl Segment {
    fn matches(&self, value: &str) -> bool {
        match self {
            Segment::Any => true,
            Segment::Prefix(prefix) => value.starts_with(prefix.as_str()),
            Segment::Exact(exact) => value == exact,
        }
    }
}

/// A parsed version pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPattern {
    source: String,
    /// `None` for the bare `*` pattern.
    segments: Option<Vec<Segment>>,
}

impl VersionPattern {
    pub fn parse(pattern: &str) -> Self {
        let source = collapse_wildcards(pattern.trim());

        if source == "*" {
            return Self {
                source,
                segments: None,
            };
        }

        let segments = source
            .split('.')
            .map(|part| {
                if part == "*" {
                    Segment::Any
                } else if let Some(prefix) = part.strip_suffix('*') {
                    Segment::Prefix(prefix.to_string())
                } else {
                    Segment::Exact(part.to_string())
                }
            })
            .collect();

        Self {
            source,
            segments: Some(segments),
        }
    }

    /// The normalized pattern text.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// True when the pattern has no wildcard segments.
    pub fn is_static(&self) -> bool {
        self.segments
            .as_ref()
            .is_some_and(|s| s.iter().all(|seg| matches!(seg, Segment::Exact(_))))
    }

    /// Check a concrete version against the pattern.
    pub fn matches(&self, version: &str) -> bool {
        let Some(segments) = &self.segments else {
            return true;
        };
        let parts: Vec<&str> = version.split('.').collect();
        parts.len() == segments.len()
            && segments
                .iter()
                .zip(parts)
                .all(|(segment, part)| segment.matches(part))
    }

    /// Pick the highest matching candidate.
    pub fn best_match<'a, I>(&self, candidates: I) -> Option<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        candidates
            .into_iter()
            .filter(|v| self.matches(v))
            .max_by(|a, b| compare_versions(a, b))
    }
}

/// Replace runs of `*` with a single `*`.
fn collapse_wildcards(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut previous_star = false;
    for c in pattern.chars() {
        if c == '*' && previous_star {
            continue;
        }
        previous_star = c == '*';
        out.push(c);
    }
    out
}

/// Compare two versions segment by segment.
///
/// Segments that are both numeric compare as numbers, anything else compares
/// as text. The first difference decides; on a shared prefix the version with
/// more segments is higher.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Resolve `pattern` against candidate versions of `service`.
///
/// # Errors
///
/// `NoVersionMatch` when no candidate satisfies the pattern (including an
/// empty candidate set).
pub fn resolve<'a, I>(service: &str, pattern: &str, candidates: I) -> Result<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let parsed = VersionPattern::parse(pattern);
    parsed
        .best_match(candidates)
        .map(str::to_string)
        .ok_or_else(|| CallmeshError::NoVersionMatch {
            service: service.to_string(),
            pattern: parsed.as_str().to_string(),
        })
}
