pub mod code;
pub mod registry;

use std::future::Future;
use std::pin::Pin;

use crate::error::Error;
use crate::llm::types::ToolDefinition;

/// Output of a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Trait for tools the engine can dispatch to.
///
/// Uses `Pin<Box<dyn Future>>` return type for dyn-compatibility, allowing
/// tools to be stored as `Arc<dyn Tool>` in the registry and extras lists.
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    fn execute(
        &self,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, Error>> + Send + '_>>;
}

/// Validate a tool-call argument object against the tool's parameter
/// schema before dispatch.
///
/// Covers the subset of JSON Schema draft 7 that tool schemas in practice
/// use: top-level `required` property names and per-property `type`
/// constraints (including `"integer"` vs `"number"`). Returns a message
/// naming the violated constraint.
pub fn validate_tool_input(schema: &serde_json::Value, input: &serde_json::Value) -> Result<(), String> {
    let Some(obj) = input.as_object() else {
        return Err(format!("arguments must be an object, got {}", type_name(input)));
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for name in required.iter().filter_map(|n| n.as_str()) {
            if !obj.contains_key(name) {
                return Err(format!("missing required parameter '{name}'"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (name, value) in obj {
            let Some(prop) = properties.get(name) else {
                continue;
            };
            let Some(expected) = prop.get("type").and_then(|t| t.as_str()) else {
                continue;
            };
            if !type_matches(expected, value) {
                return Err(format!(
                    "parameter '{name}' must be of type {expected}, got {}",
                    type_name(value)
                ));
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &serde_json::Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "limit": {"type": "integer"},
                "ratio": {"type": "number"},
                "flags": {"type": "array"}
            },
            "required": ["query"]
        })
    }

    #[test]
    fn valid_input_passes() {
        let input = json!({"query": "rust", "limit": 3, "ratio": 0.5, "flags": []});
        assert!(validate_tool_input(&schema(), &input).is_ok());
    }

    #[test]
    fn missing_required_parameter_fails() {
        let err = validate_tool_input(&schema(), &json!({"limit": 3})).unwrap_err();
        assert!(err.contains("missing required parameter 'query'"), "{err}");
    }

    #[test]
    fn wrong_type_fails() {
        let err = validate_tool_input(&schema(), &json!({"query": 7})).unwrap_err();
        assert!(err.contains("'query' must be of type string"), "{err}");
    }

    #[test]
    fn integer_rejects_float() {
        let err =
            validate_tool_input(&schema(), &json!({"query": "x", "limit": 1.5})).unwrap_err();
        assert!(err.contains("'limit' must be of type integer"), "{err}");
    }

    #[test]
    fn number_accepts_integer() {
        let input = json!({"query": "x", "ratio": 2});
        assert!(validate_tool_input(&schema(), &input).is_ok());
    }

    #[test]
    fn non_object_arguments_fail() {
        let err = validate_tool_input(&schema(), &json!([1, 2])).unwrap_err();
        assert!(err.contains("must be an object"), "{err}");
    }

    #[test]
    fn unknown_properties_are_ignored() {
        let input = json!({"query": "x", "extra": true});
        assert!(validate_tool_input(&schema(), &input).is_ok());
    }

    #[test]
    fn tool_output_constructors() {
        assert!(!ToolOutput::success("ok").is_error);
        assert!(ToolOutput::error("bad").is_error);
    }
}
