//! Typed access to tool call arguments.

use serde_json::Value;

use crate::error::StewardError;

/// Wrapper around tool call arguments providing typed extraction.
#[derive(Debug, Clone, Default)]
pub struct ToolArguments {
    value: Value,
}

impl ToolArguments {
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    pub fn raw(&self) -> &Value {
        &self.value
    }

    pub fn into_inner(self) -> Value {
        self.value
    }

    /// Get a string argument by key.
    pub fn get_str(&self, key: &str) -> Result<&str, StewardError> {
        self.get_str_opt(key)
            .ok_or_else(|| StewardError::InvalidArgument(format!("Missing string argument: {key}")))
    }

    pub fn get_str_opt(&self, key: &str) -> Option<&str> {
        self.value.get(key).and_then(Value::as_str)
    }

    pub fn get_u64_opt(&self, key: &str) -> Option<u64> {
        self.value.get(key).and_then(Value::as_u64)
    }

    pub fn get_bool_opt(&self, key: &str) -> Option<bool> {
        self.value.get(key).and_then(Value::as_bool)
    }

    /// Deserialize the entire arguments into a typed struct.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> Result<T, StewardError> {
        serde_json::from_value(self.value.clone()).map_err(StewardError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn typed_getters() {
        let args = ToolArguments::new(json!({"path": "a.txt", "limit": 3, "recursive": true}));
        assert_eq!(args.get_str("path").unwrap(), "a.txt");
        assert_eq!(args.get_u64_opt("limit"), Some(3));
        assert_eq!(args.get_bool_opt("recursive"), Some(true));
        assert!(matches!(
            args.get_str("missing"),
            Err(StewardError::InvalidArgument(_))
        ));
    }
}
