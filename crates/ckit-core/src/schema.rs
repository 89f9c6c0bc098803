use std::collections::BTreeSet;

use jsonschema::{Draft, Validator};
use serde_json::Value;

use crate::errors::FieldIssue;

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("schema does not compile: {0}")]
    Compile(String),
    #[error("schema root must be an object schema")]
    NotAnObject,
}

/// A JSON schema compiled once and reused for every check.
pub struct CompiledSchema {
    validator: Validator,
    declared: BTreeSet<String>,
    raw: Value,
}

impl CompiledSchema {
    pub fn compile(schema: &Value) -> Result<Self, SchemaError> {
        if !schema.is_object() {
            return Err(SchemaError::NotAnObject);
        }
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(schema)
            .map_err(|e| SchemaError::Compile(e.to_string()))?;
        let declared = schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default();
        Ok(Self {
            validator,
            declared,
            raw: schema.clone(),
        })
    }

    /// Top-level property names declared under `properties`.
    pub fn declared_fields(&self) -> &BTreeSet<String> {
        &self.declared
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Every validation failure, each tagged with the offending path.
    pub fn check(&self, instance: &Value) -> Vec<FieldIssue> {
        self.validator
            .iter_errors(instance)
            .map(|error| {
                let path = error.instance_path().to_string();
                FieldIssue {
                    path: if path.is_empty() { "/".to_string() } else { path },
                    message: error.to_string(),
                }
            })
            .collect()
    }

    /// Top-level keys of `instance` not declared in the schema.
    pub fn undeclared_fields(&self, instance: &Value) -> Vec<String> {
        match instance.as_object() {
            Some(obj) => obj
                .keys()
                .filter(|k| !self.declared.contains(k.as_str()))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }
}

impl std::fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledSchema")
            .field("declared", &self.declared)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ops_schema() -> Value {
        json!({
            "type": "object",
            "required": ["operation"],
            "properties": {
                "operation": {"type": "string", "enum": ["ping", "status"]},
                "message": {"type": "string"}
            }
        })
    }

    #[test]
    fn valid_instance_has_no_issues() {
        let schema = CompiledSchema::compile(&ops_schema()).unwrap();
        assert!(schema.check(&json!({"operation": "ping"})).is_empty());
    }

    #[test]
    fn issues_carry_paths() {
        let schema = CompiledSchema::compile(&ops_schema()).unwrap();
        let issues = schema.check(&json!({"operation": "reboot", "message": 7}));
        let paths: Vec<&str> = issues.iter().map(|i| i.path.as_str()).collect();
        assert!(paths.contains(&"/operation"), "got {paths:?}");
        assert!(paths.contains(&"/message"), "got {paths:?}");
    }

    #[test]
    fn missing_required_reported_at_root() {
        let schema = CompiledSchema::compile(&ops_schema()).unwrap();
        let issues = schema.check(&json!({}));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "/");
        assert!(issues[0].message.contains("operation"));
    }

    #[test]
    fn undeclared_fields_detected() {
        let schema = CompiledSchema::compile(&ops_schema()).unwrap();
        assert_eq!(
            schema.undeclared_fields(&json!({"operation": "ping", "verbose": true})),
            vec!["verbose".to_string()]
        );
        assert!(schema.undeclared_fields(&json!({"operation": "ping"})).is_empty());
    }

    #[test]
    fn non_object_schema_rejected() {
        assert!(matches!(
            CompiledSchema::compile(&json!(true)),
            Err(SchemaError::NotAnObject)
        ));
    }

    #[test]
    fn broken_schema_rejected() {
        let err = CompiledSchema::compile(&json!({"type": 12})).unwrap_err();
        assert!(matches!(err, SchemaError::Compile(_)));
    }
}
