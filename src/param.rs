//! Action parameters and their validation against an [`ActionSchema`].

use crate::codec::names::{field, str_field};
use crate::codec::{Map, Naming, Value};
use crate::error::{CallmeshError, Result};
use crate::schema::{ActionSchema, ParamType};

/// A named, typed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub value: Value,
    pub param_type: ParamType,
}

impl Param {
    /// Create a parameter whose type is taken from the value.
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        Self {
            name: name.into(),
            param_type: ParamType::of(&value),
            value,
        }
    }

    pub fn to_value(&self, naming: Naming) -> Value {
        let mut map = Map::new();
        naming.insert(&mut map, "name", Value::from(self.name.as_str()));
        naming.insert(&mut map, "value", self.value.clone());
        naming.insert(&mut map, "type", Value::from(self.param_type.as_str()));
        Value::Map(map)
    }

    /// Read a parameter from its wire form.
    ///
    /// A missing type is inferred from the value; a missing value is null.
    ///
    /// # Errors
    ///
    /// `InvalidParam` when the name is missing or the type name is unknown.
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = value.as_map().ok_or_else(|| CallmeshError::InvalidParam {
            name: String::new(),
            reason: format!("expected object, got {}", value.type_name()),
        })?;

        let name = str_field(map, "name");
        if name.is_empty() {
            return Err(CallmeshError::InvalidParam {
                name,
                reason: "missing name".to_string(),
            });
        }

        let value = field(map, "value").cloned().unwrap_or_default();
        let param_type = match field(map, "type").and_then(Value::as_str) {
            Some(type_name) => {
                ParamType::from_name(type_name).ok_or_else(|| CallmeshError::InvalidParam {
                    name: name.clone(),
                    reason: format!("unknown type \"{}\"", type_name),
                })?
            }
            None => ParamType::of(&value),
        };

        Ok(Self {
            name,
            value,
            param_type,
        })
    }
}

/// Encode a parameter list.
pub fn params_to_value(params: &[Param], naming: Naming) -> Value {
    Value::Array(params.iter().map(|p| p.to_value(naming)).collect())
}

/// Decode a parameter list. Absent or null lists are empty.
pub fn params_from_value(value: Option<&Value>) -> Result<Vec<Param>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items.iter().map(Param::from_value).collect(),
        Some(other) => Err(CallmeshError::InvalidParam {
            name: String::new(),
            reason: format!("expected parameter list, got {}", other.type_name()),
        }),
    }
}

/// Check parameters against the declared schema and fill in defaults.
///
/// Declared parameters must carry a value of the declared type. Required
/// parameters must be present; optional ones with a default get it when
/// absent. Undeclared parameters pass through.
pub fn validate_params(schema: &ActionSchema, mut params: Vec<Param>) -> Result<Vec<Param>> {
    for param in &params {
        if let Some(declared) = schema.get_param(&param.name) {
            if !declared.param_type.accepts(&param.value) {
                return Err(CallmeshError::InvalidParam {
                    name: param.name.clone(),
                    reason: format!(
                        "expected {}, got {}",
                        declared.param_type,
                        param.value.type_name()
                    ),
                });
            }
        }
    }

    for declared in &schema.params {
        if params.iter().any(|p| p.name == declared.name) {
            continue;
        }
        if declared.required {
            return Err(CallmeshError::InvalidParam {
                name: declared.name.clone(),
                reason: "required parameter is missing".to_string(),
            });
        }
        if let Some(default) = &declared.default {
            params.push(Param {
                name: declared.name.clone(),
                value: default.clone(),
                param_type: declared.param_type,
            });
        }
    }

    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ParamSchema;

    fn schema() -> ActionSchema {
        ActionSchema::new("list")
            .param(ParamSchema::new("id", ParamType::Integer).required())
            .param(ParamSchema::new("limit", ParamType::Integer).default_value(20))
            .param(ParamSchema::new("ratio", ParamType::Float))
    }

    #[test]
    fn test_wire_roundtrip() {
        let param = Param::new("id", 42);
        let back = Param::from_value(&param.to_value(Naming::Compact)).unwrap();
        assert_eq!(back, param);
        assert_eq!(back.param_type, ParamType::Integer);
    }

    #[test]
    fn test_from_value_defaults() {
        let value = Value::from_pairs([("name", Value::from("flag"))]);
        let param = Param::from_value(&value).unwrap();
        assert_eq!(param.value, Value::Null);
        assert_eq!(param.param_type, ParamType::Null);
    }

    #[test]
    fn test_from_value_rejects_unknown_type() {
        let value = Value::from_pairs([
            ("n", Value::from("x")),
            ("ty", Value::from("decimal")),
        ]);
        assert!(Param::from_value(&value).is_err());
        assert!(Param::from_value(&Value::Int(1)).is_err());
    }

    #[test]
    fn test_default_filled() {
        let params = validate_params(&schema(), vec![Param::new("id", 1)]).unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[1], Param::new("limit", 20));
    }

    #[test]
    fn test_required_missing() {
        let err = validate_params(&schema(), vec![]).unwrap_err();
        assert!(matches!(err, CallmeshError::InvalidParam { ref name, .. } if name == "id"));
    }

    #[test]
    fn test_type_mismatch() {
        let err = validate_params(&schema(), vec![Param::new("id", "one")]).unwrap_err();
        assert!(err.to_string().contains("expected integer, got string"));
    }

    #[test]
    fn test_int_accepted_for_float_and_undeclared_passes() {
        let params = validate_params(
            &schema(),
            vec![Param::new("id", 1), Param::new("ratio", 2), Param::new("extra", true)],
        )
        .unwrap();
        assert!(params.iter().any(|p| p.name == "extra"));
    }

    #[test]
    fn test_params_from_value() {
        assert!(params_from_value(None).unwrap().is_empty());
        let list = params_to_value(&[Param::new("a", 1), Param::new("b", "x")], Naming::Full);
        assert_eq!(params_from_value(Some(&list)).unwrap().len(), 2);
        assert!(params_from_value(Some(&Value::Int(3))).is_err());
    }
}
