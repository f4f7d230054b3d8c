// src/storage/validation_mod.rs
// Validation Layer - identifier format, node names and payload size checks

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use uuid::Uuid;

/// Validation errors
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid format: {field} - {reason}")]
    InvalidFormat { field: String, reason: String },

    #[error("Value out of range: {field} - {value}")]
    OutOfRange { field: String, value: String },

    #[error("Invalid type: {field} - expected {expected}, got {actual}")]
    InvalidType { field: String, expected: String, actual: String },

    #[error("Incomplete content: {kind} - {reason}")]
    Incomplete { kind: String, reason: String },
}

impl ValidationError {
    /// Name of the offending field, used when the error crosses the RPC boundary.
    pub fn field(&self) -> &str {
        match self {
            ValidationError::RequiredFieldMissing { field }
            | ValidationError::InvalidFormat { field, .. }
            | ValidationError::OutOfRange { field, .. }
            | ValidationError::InvalidType { field, .. } => field,
            ValidationError::Incomplete { .. } => "payload",
        }
    }
}

pub type ValidationResult = Result<(), ValidationError>;

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
            .expect("identifier pattern is valid")
    })
}

/// Accepts only canonical lowercase hyphenated UUIDs.
pub fn validate_identifier(raw: &str) -> Result<Uuid, String> {
    if !identifier_regex().is_match(raw) {
        return Err(format!("malformed identifier '{}'", raw));
    }
    Uuid::parse_str(raw).map_err(|e| format!("malformed identifier '{}': {}", raw, e))
}

/// Names may repeat among siblings but must contain something other than whitespace.
pub fn validate_name(name: &str) -> ValidationResult {
    if name.trim().is_empty() {
        return Err(ValidationError::InvalidFormat {
            field: "name".to_string(),
            reason: "name cannot be empty or whitespace".to_string(),
        });
    }
    Ok(())
}

pub fn validate_payload_size(params: &Value, max_bytes: usize) -> ValidationResult {
    let size = serde_json::to_vec(params).map(|v| v.len()).unwrap_or(usize::MAX);
    if size > max_bytes {
        return Err(ValidationError::OutOfRange {
            field: "params".to_string(),
            value: format!("{} bytes (max: {})", size, max_bytes),
        });
    }
    Ok(())
}

/// JSON type name as reported in `InvalidType` errors.
pub fn json_type_name(value: &Value) -> &'static str {
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
    use serde_json::json;

    #[test]
    fn identifier_must_be_canonical_uuid() {
        let id = Uuid::new_v4();
        assert_eq!(validate_identifier(&id.to_string()).unwrap(), id);
        assert!(validate_identifier(&id.to_string().to_uppercase()).is_err());
        assert!(validate_identifier(&id.simple().to_string()).is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn blank_names_rejected() {
        assert!(validate_name("Projects").is_ok());
        assert!(validate_name("").is_err());
        assert_eq!(validate_name(" \t\n").unwrap_err().field(), "name");
    }

    #[test]
    fn payload_size_limit() {
        let params = json!({"name": "x".repeat(64)});
        assert!(validate_payload_size(&params, 1024).is_ok());
        assert!(validate_payload_size(&params, 16).is_err());
    }
}
