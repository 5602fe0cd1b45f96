//! Template document decoding.
//!
//! Templates are YAML or JSON. YAML short-form intrinsic tags (`!Sub`,
//! `!Join`, `!GetAtt`, ...) are expanded to their long `Fn::` form so the
//! rest of the crate only deals with one shape.

use crate::errors::TemplateError;
use serde_json::{Map, Number, Value};
use std::path::Path;

/// Reads and decodes a template file.
pub fn load_document(path: &Path) -> Result<Value, TemplateError> {
    let raw = std::fs::read_to_string(path).map_err(|e| TemplateError::Read {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    parse_document(path, &raw)
}

/// Decodes template text. `path` is used for error reporting only.
pub fn parse_document(path: &Path, raw: &str) -> Result<Value, TemplateError> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(raw).map_err(|e| TemplateError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(yaml_to_json(yaml))
}

/// Converts a YAML value to JSON, expanding intrinsic function tags.
#[must_use]
pub fn yaml_to_json(value: serde_yaml::Value) -> Value {
    match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(b),
        serde_yaml::Value::Number(n) => number_to_json(&n),
        serde_yaml::Value::String(s) => Value::String(s),
        serde_yaml::Value::Sequence(items) => {
            Value::Array(items.into_iter().map(yaml_to_json).collect())
        }
        serde_yaml::Value::Mapping(mapping) => {
            let mut map = Map::new();
            for (key, value) in mapping {
                map.insert(key_to_string(key), yaml_to_json(value));
            }
            Value::Object(map)
        }
        serde_yaml::Value::Tagged(tagged) => {
            let tag = tagged.tag.to_string();
            let name = tag.trim_start_matches('!');
            let inner = yaml_to_json(tagged.value);
            expand_intrinsic(name, inner)
        }
    }
}

fn expand_intrinsic(name: &str, inner: Value) -> Value {
    let mut map = Map::new();
    match name {
        "Ref" => {
            map.insert("Ref".to_string(), inner);
        }
        "Condition" => {
            map.insert("Condition".to_string(), inner);
        }
        "GetAtt" => {
            let value = match inner {
                Value::String(s) => match s.split_once('.') {
                    Some((resource, attribute)) => Value::Array(vec![
                        Value::String(resource.to_string()),
                        Value::String(attribute.to_string()),
                    ]),
                    None => Value::String(s),
                },
                other => other,
            };
            map.insert("Fn::GetAtt".to_string(), value);
        }
        other => {
            map.insert(format!("Fn::{other}"), inner);
        }
    }
    Value::Object(map)
}

fn number_to_json(n: &serde_yaml::Number) -> Value {
    if let Some(i) = n.as_i64() {
        Value::Number(i.into())
    } else if let Some(u) = n.as_u64() {
        Value::Number(u.into())
    } else {
        n.as_f64()
            .and_then(Number::from_f64)
            .map_or_else(|| Value::String(n.to_string()), Value::Number)
    }
}

fn key_to_string(key: serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s,
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Null => "null".to_string(),
        other => serde_yaml::to_string(&other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}
