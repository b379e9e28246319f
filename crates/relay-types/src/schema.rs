use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Result-type contract a task declares up front. A task result is accepted
/// only if it validates against its schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ResultSchema {
    Text,
    Boolean,
    Integer,
    Number,
    Labels { labels: Vec<String> },
    Object { schema: Value },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid result at `{}`: {}", self.path, self.reason)
    }
}

impl std::error::Error for SchemaViolation {}

fn violation(path: &str, reason: impl Into<String>) -> SchemaViolation {
    SchemaViolation {
        path: path.to_string(),
        reason: reason.into(),
    }
}

impl ResultSchema {
    /// Short human-readable description, used in task framing and end-turn
    /// tool descriptions.
    pub fn describe(&self) -> String {
        match self {
            Self::Text => "string".to_string(),
            Self::Boolean => "boolean".to_string(),
            Self::Integer => "integer".to_string(),
            Self::Number => "number".to_string(),
            Self::Labels { labels } => format!("one of: {}", labels.join(" | ")),
            Self::Object { .. } => "structured object".to_string(),
        }
    }

    /// JSON-schema fragment for the `result` parameter of the
    /// mark-successful end-turn tool.
    pub fn input_schema_fragment(&self) -> Value {
        match self {
            Self::Text => json!({"type": "string"}),
            Self::Boolean => json!({"type": "boolean"}),
            Self::Integer => json!({"type": "integer"}),
            Self::Number => json!({"type": "number"}),
            Self::Labels { labels } => json!({"type": "string", "enum": labels}),
            Self::Object { schema } => schema.clone(),
        }
    }

    pub fn validate(&self, value: &Value) -> Result<(), SchemaViolation> {
        match self {
            Self::Text => value
                .is_string()
                .then_some(())
                .ok_or_else(|| violation("$", "expected a string")),
            Self::Boolean => value
                .is_boolean()
                .then_some(())
                .ok_or_else(|| violation("$", "expected a boolean")),
            Self::Integer => value
                .as_i64()
                .map(|_| ())
                .ok_or_else(|| violation("$", "expected an integer")),
            Self::Number => value
                .is_number()
                .then_some(())
                .ok_or_else(|| violation("$", "expected a number")),
            Self::Labels { labels } => {
                let Some(label) = value.as_str() else {
                    return Err(violation("$", "expected a string label"));
                };
                if labels.iter().any(|l| l == label) {
                    Ok(())
                } else {
                    Err(violation(
                        "$",
                        format!("`{label}` is not one of: {}", labels.join(" | ")),
                    ))
                }
            }
            Self::Object { schema } => validate_node(schema, value, "$"),
        }
    }
}

/// Minimal JSON-schema subset: `type`, `required`, `properties`, `items`,
/// `enum`. Enough for structured task results without pulling in a full
/// validator.
fn validate_node(schema: &Value, value: &Value, path: &str) -> Result<(), SchemaViolation> {
    let Some(obj) = schema.as_object() else {
        return Ok(());
    };

    if let Some(allowed) = obj.get("enum").and_then(|v| v.as_array()) {
        if !allowed.contains(value) {
            return Err(violation(path, "value is not one of the allowed constants"));
        }
    }

    if let Some(expected) = obj.get("type").and_then(|t| t.as_str()) {
        let matches = match expected {
            "object" => value.is_object(),
            "array" => value.is_array(),
            "string" => value.is_string(),
            "boolean" => value.is_boolean(),
            "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
            "number" => value.is_number(),
            "null" => value.is_null(),
            _ => true,
        };
        if !matches {
            return Err(violation(path, format!("expected type `{expected}`")));
        }
    }

    if let Some(required) = obj.get("required").and_then(|v| v.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if value.get(key).is_none() {
                return Err(violation(path, format!("missing required property `{key}`")));
            }
        }
    }

    if let Some(props) = obj.get("properties").and_then(|v| v.as_object()) {
        for (key, child_schema) in props {
            if let Some(child) = value.get(key) {
                validate_node(child_schema, child, &format!("{path}.{key}"))?;
            }
        }
    }

    if let Some(items) = obj.get("items") {
        if let Some(arr) = value.as_array() {
            for (idx, item) in arr.iter().enumerate() {
                validate_node(items, item, &format!("{path}[{idx}]"))?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_schemas_accept_matching_values() {
        assert!(ResultSchema::Text.validate(&json!("ok")).is_ok());
        assert!(ResultSchema::Boolean.validate(&json!(true)).is_ok());
        assert!(ResultSchema::Integer.validate(&json!(42)).is_ok());
        assert!(ResultSchema::Number.validate(&json!(1.5)).is_ok());
    }

    #[test]
    fn scalar_schemas_reject_mismatched_values() {
        assert!(ResultSchema::Text.validate(&json!(42)).is_err());
        assert!(ResultSchema::Boolean.validate(&json!("yes")).is_err());
        assert!(ResultSchema::Integer.validate(&json!(1.5)).is_err());
    }

    #[test]
    fn labels_schema_checks_membership() {
        let schema = ResultSchema::Labels {
            labels: vec!["red".to_string(), "green".to_string()],
        };
        assert!(schema.validate(&json!("red")).is_ok());
        let err = schema.validate(&json!("blue")).unwrap_err();
        assert!(err.reason.contains("blue"));
    }

    #[test]
    fn object_schema_checks_required_and_types() {
        let schema = ResultSchema::Object {
            schema: json!({
                "type": "object",
                "required": ["name", "count"],
                "properties": {
                    "name": {"type": "string"},
                    "count": {"type": "integer"},
                    "tags": {"type": "array", "items": {"type": "string"}}
                }
            }),
        };
        assert!(schema
            .validate(&json!({"name": "a", "count": 2, "tags": ["x"]}))
            .is_ok());
        assert!(schema.validate(&json!({"name": "a"})).is_err());
        let err = schema
            .validate(&json!({"name": "a", "count": "two"}))
            .unwrap_err();
        assert_eq!(err.path, "$.count");
    }
}
