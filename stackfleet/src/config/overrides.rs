//! Parameter override files.
//!
//! Accepts a flat `key: value` map or the legacy list form
//! `[{ParameterKey: k, ParameterValue: v}, ...]`.

use crate::errors::ConfigError;
use serde_json::{Map, Value};
use std::path::Path;

/// Ordered parameter overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterOverrides {
    values: Map<String, Value>,
}

impl ParameterOverrides {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads an overrides file. A missing file yields no overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            tracing::debug!(path = %path.display(), "No parameter overrides file");
            return Ok(Self::new());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::file_read(path, e))?;
        if raw.trim().is_empty() {
            return Ok(Self::new());
        }
        let value: Value = serde_yaml::from_str(&raw).map_err(|e| ConfigError::parse(path, e))?;
        Self::from_value(value).map_err(|e| match e {
            ConfigError::InvalidValue { reason, .. } => ConfigError::parse(path, reason),
            other => other,
        })
    }

    /// Normalises either accepted shape.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        match value {
            Value::Null => Ok(Self::new()),
            Value::Object(values) => Ok(Self { values }),
            Value::Array(items) => {
                tracing::warn!("Parameter overrides use the legacy list format");
                let mut values = Map::new();
                for item in items {
                    let key = item.get("ParameterKey").and_then(Value::as_str);
                    let value = item.get("ParameterValue");
                    match (key, value) {
                        (Some(key), Some(value)) => {
                            values.insert(key.to_string(), value.clone());
                        }
                        _ => {
                            return Err(ConfigError::invalid_value(
                                "overrides",
                                item.to_string(),
                                "each entry needs ParameterKey and ParameterValue",
                            ))
                        }
                    }
                }
                Ok(Self { values })
            }
            other => Err(ConfigError::invalid_value(
                "overrides",
                other.to_string(),
                "expected a map or a list of ParameterKey/ParameterValue entries",
            )),
        }
    }

    /// Iterates overrides in file order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Number of overrides.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true when there are no overrides.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_flat_map() {
        let overrides = ParameterOverrides::from_value(json!({"B": "2", "A": 1})).unwrap();
        let keys: Vec<&String> = overrides.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["B", "A"]);
    }

    #[test]
    fn test_legacy_list() {
        let overrides = ParameterOverrides::from_value(json!([
            {"ParameterKey": "KeyPairName", "ParameterValue": "mykey"},
            {"ParameterKey": "Count", "ParameterValue": 3}
        ]))
        .unwrap();
        assert_eq!(overrides.len(), 2);
        assert_eq!(overrides.iter().next().unwrap().1, &json!("mykey"));
    }

    #[test]
    fn test_legacy_list_entry_without_value() {
        let err = ParameterOverrides::from_value(json!([{"ParameterKey": "A"}])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_scalar_rejected() {
        assert!(ParameterOverrides::from_value(json!("nope")).is_err());
    }

    #[test]
    fn test_load_missing_and_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ParameterOverrides::load(&dir.path().join("absent.yml")).unwrap().is_empty());

        let path = dir.path().join("overrides.yml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "- ParameterKey: A\n  ParameterValue: x").unwrap();
        let overrides = ParameterOverrides::load(&path).unwrap();
        assert_eq!(overrides.len(), 1);
    }
}
