// kind_registry.rs - Extension modules owning node payloads
// Each `kind` registers a payload schema and a completeness predicate at startup

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::node_mod::NodeKind;
use crate::storage::validation_mod::{json_type_name, ValidationError, ValidationResult};

/// JSON type expected for a payload field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JsonType {
    Any,
    Object,
    Array,
    String,
    Number,
    Boolean,
}

impl JsonType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            JsonType::Any => true,
            JsonType::Object => value.is_object(),
            JsonType::Array => value.is_array(),
            JsonType::String => value.is_string(),
            JsonType::Number => value.is_number(),
            JsonType::Boolean => value.is_boolean(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldRule {
    pub field: String,
    pub required: bool,
    pub expected_type: JsonType,
}

impl FieldRule {
    pub fn optional(field: &str, expected_type: JsonType) -> Self {
        Self { field: field.to_string(), required: false, expected_type }
    }

    pub fn required(field: &str, expected_type: JsonType) -> Self {
        Self { field: field.to_string(), required: true, expected_type }
    }
}

/// Payload schema declared by an extension
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadSchema {
    pub kind: NodeKind,
    pub version: String,
    pub fields: Vec<FieldRule>,
}

impl PayloadSchema {
    /// Shape checks only; completeness is the extension's call.
    pub fn check(&self, payload: &Value) -> ValidationResult {
        if self.fields.is_empty() {
            return Ok(());
        }
        let object = match payload {
            Value::Object(map) => map,
            Value::Null if self.fields.iter().all(|r| !r.required) => return Ok(()),
            other => {
                return Err(ValidationError::InvalidType {
                    field: "payload".to_string(),
                    expected: "object".to_string(),
                    actual: json_type_name(other).to_string(),
                })
            }
        };
        for rule in &self.fields {
            match object.get(&rule.field) {
                None | Some(Value::Null) if rule.required => {
                    return Err(ValidationError::RequiredFieldMissing {
                        field: format!("payload.{}", rule.field),
                    });
                }
                Some(value) if !value.is_null() && !rule.expected_type.accepts(value) => {
                    return Err(ValidationError::InvalidType {
                        field: format!("payload.{}", rule.field),
                        expected: format!("{:?}", rule.expected_type).to_lowercase(),
                        actual: json_type_name(value).to_string(),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Extension module trait (one per kind)
pub trait KindExtension: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> NodeKind;

    fn schema(&self) -> PayloadSchema;

    /// Ok when the payload is complete enough to leave draft state.
    fn is_complete(&self, payload: &Value) -> Result<(), String>;
}

/// Generic container: always complete.
#[derive(Debug, Default)]
pub struct ContainerKind;

impl KindExtension for ContainerKind {
    fn kind(&self) -> NodeKind {
        NodeKind::container()
    }

    fn schema(&self) -> PayloadSchema {
        PayloadSchema { kind: self.kind(), version: "1".to_string(), fields: Vec::new() }
    }

    fn is_complete(&self, _payload: &Value) -> Result<(), String> {
        Ok(())
    }
}

/// Style-mapping dataset: complete once it maps at least one value.
#[derive(Debug, Default)]
pub struct StyleMappingKind;

impl KindExtension for StyleMappingKind {
    fn kind(&self) -> NodeKind {
        NodeKind::new(NodeKind::STYLE_MAPPING)
    }

    fn schema(&self) -> PayloadSchema {
        PayloadSchema {
            kind: self.kind(),
            version: "1".to_string(),
            fields: vec![
                FieldRule::optional("source", JsonType::String),
                FieldRule::optional("mappings", JsonType::Object),
            ],
        }
    }

    fn is_complete(&self, payload: &Value) -> Result<(), String> {
        match payload.get("mappings").and_then(Value::as_object) {
            Some(map) if !map.is_empty() => Ok(()),
            _ => Err("mappings must contain at least one entry".to_string()),
        }
    }
}

/// Shape dataset: complete once it carries geometry.
#[derive(Debug, Default)]
pub struct ShapeKind;

impl KindExtension for ShapeKind {
    fn kind(&self) -> NodeKind {
        NodeKind::new(NodeKind::SHAPE)
    }

    fn schema(&self) -> PayloadSchema {
        PayloadSchema {
            kind: self.kind(),
            version: "1".to_string(),
            fields: vec![
                FieldRule::optional("geometry", JsonType::Object),
                FieldRule::optional("properties", JsonType::Object),
            ],
        }
    }

    fn is_complete(&self, payload: &Value) -> Result<(), String> {
        match payload.get("geometry") {
            Some(g) if !g.is_null() => Ok(()),
            _ => Err("geometry is missing".to_string()),
        }
    }
}

/// Registration table consulted on create and commit
#[derive(Debug, Default, Clone)]
pub struct KindRegistry {
    extensions: HashMap<NodeKind, Arc<dyn KindExtension>>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the container, style-mapping and shape kinds.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(ContainerKind);
        registry.register(StyleMappingKind);
        registry.register(ShapeKind);
        registry
    }

    pub fn register<E>(&mut self, extension: E)
    where
        E: KindExtension + 'static,
    {
        let kind = extension.kind();
        if self.extensions.insert(kind.clone(), Arc::new(extension)).is_some() {
            tracing::warn!(kind = %kind, "kind extension replaced");
        } else {
            tracing::debug!(kind = %kind, "kind extension registered");
        }
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.extensions.keys().map(|k| k.to_string()).collect();
        kinds.sort();
        kinds
    }

    pub fn get(&self, kind: &NodeKind) -> Result<Arc<dyn KindExtension>, ValidationError> {
        self.extensions.get(kind).cloned().ok_or_else(|| ValidationError::InvalidFormat {
            field: "kind".to_string(),
            reason: format!("unknown kind '{}'", kind),
        })
    }

    pub fn validate_schema(&self, kind: &NodeKind, payload: &Value) -> ValidationResult {
        self.get(kind)?.schema().check(payload)
    }

    /// Completeness predicate. Only the commit path calls this.
    pub fn check_complete(&self, kind: &NodeKind, payload: &Value) -> ValidationResult {
        self.get(kind)?
            .is_complete(payload)
            .map_err(|reason| ValidationError::Incomplete { kind: kind.to_string(), reason })
    }
}
