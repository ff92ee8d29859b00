//! Tool input schemas and pre-execution argument checks.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// JSON Schema describing a tool's input object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub schema: Value,
}

impl ToolSchema {
    pub fn from_value(schema: Value) -> Self {
        Self { schema }
    }

    /// Schema for a tool that takes no arguments.
    pub fn empty() -> Self {
        Self {
            schema: json!({ "type": "object", "properties": {}, "required": [] }),
        }
    }

    pub fn object() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn required_fields(&self) -> Vec<&str> {
        self.schema
            .get("required")
            .and_then(Value::as_array)
            .map(|fields| fields.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Check `args` against the top level of the schema: object shape,
    /// required fields, and declared property types.
    pub fn validate(&self, args: &Value) -> Result<(), String> {
        let Some(obj) = args.as_object() else {
            return Err(format!("expected object arguments, got {}", json_type_name(args)));
        };
        if let Some(missing) = self
            .required_fields()
            .into_iter()
            .find(|field| obj.get(*field).map_or(true, Value::is_null))
        {
            return Err(format!("missing required field '{missing}'"));
        }
        let Some(properties) = self.schema.get("properties").and_then(Value::as_object) else {
            return Ok(());
        };
        for (key, value) in obj {
            let expected = properties
                .get(key)
                .and_then(|prop| prop.get("type"))
                .and_then(Value::as_str);
            if let Some(expected) = expected {
                if !value.is_null() && !value_matches_type(value, expected) {
                    return Err(format!(
                        "field '{key}' expected type '{expected}', got {}",
                        json_type_name(value)
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Builder for object schemas.
#[derive(Default)]
pub struct SchemaBuilder {
    properties: Map<String, Value>,
    required: Vec<String>,
}

impl SchemaBuilder {
    fn property(mut self, name: &str, kind: &str, description: &str, required: bool) -> Self {
        self.properties.insert(
            name.to_string(),
            json!({ "type": kind, "description": description }),
        );
        if required {
            self.required.push(name.to_string());
        }
        self
    }

    pub fn string(self, name: &str, description: &str, required: bool) -> Self {
        self.property(name, "string", description, required)
    }

    pub fn integer(self, name: &str, description: &str, required: bool) -> Self {
        self.property(name, "integer", description, required)
    }

    pub fn boolean(self, name: &str, description: &str, required: bool) -> Self {
        self.property(name, "boolean", description, required)
    }

    pub fn object(self, name: &str, description: &str, required: bool) -> Self {
        self.property(name, "object", description, required)
    }

    pub fn build(self) -> ToolSchema {
        ToolSchema {
            schema: json!({
                "type": "object",
                "properties": self.properties,
                "required": self.required,
            }),
        }
    }
}

fn value_matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ToolSchema {
        ToolSchema::object()
            .string("path", "File path", true)
            .integer("limit", "Max lines", false)
            .build()
    }

    #[test]
    fn missing_and_null_required_fields_are_rejected() {
        assert_eq!(
            schema().validate(&json!({})).unwrap_err(),
            "missing required field 'path'"
        );
        assert!(schema().validate(&json!({"path": null})).is_err());
        assert!(schema().validate(&json!({"path": "a"})).is_ok());
    }

    #[test]
    fn wrong_property_type_is_rejected() {
        let err = schema()
            .validate(&json!({"path": "a", "limit": "ten"}))
            .unwrap_err();
        assert!(err.contains("limit"));
        assert!(schema().validate(&json!("nope")).is_err());
    }
}
