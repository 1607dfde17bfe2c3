//! Serialization helpers shared across the worker crates.

use std::str::FromStr;

/// Errors that can occur during serialization operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// JSON serialization or deserialization error.
    #[error("JSON serialization/deserialization failed: {source}")]
    Serde {
        #[source]
        source: serde_json::Error,
    },
}

/// Extension trait for parsing strings into JSON values.
pub trait StringExt {
    /// Error type for parsing operations.
    type Error;
    /// Parses the string as a JSON value.
    fn to_value(&self) -> Result<serde_json::Value, Self::Error>;
}

impl StringExt for String {
    type Error = Error;
    fn to_value(&self) -> Result<serde_json::Value, Self::Error> {
        let value = serde_json::Value::from_str(self).map_err(|e| Error::Serde { source: e })?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_ext_to_value() {
        let raw = r#"{"payload": {"op": "c", "after": {"id": 7}}}"#.to_string();
        let value = raw.to_value().unwrap();

        assert_eq!(value["payload"]["op"], "c");
        assert_eq!(value["payload"]["after"]["id"], 7);
    }

    #[test]
    fn test_string_ext_rejects_invalid_json() {
        let raw = "{ not json }".to_string();
        assert!(raw.to_value().is_err());
    }

    #[test]
    fn test_string_ext_scalar() {
        let raw = "42".to_string();
        assert_eq!(raw.to_value().unwrap(), serde_json::json!(42));
    }
}
