// src/node_mod.rs
// Node model shared by the store, the working-copy manager and the wire layer

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::storage::validation_mod::validate_identifier;

/// Globally unique node identifier. Serialized as a canonical lowercase UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for NodeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_identifier(s).map(Self)
    }
}

impl TryFrom<String> for NodeId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.to_string()
    }
}

/// Handle of an open working copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DraftHandle(Uuid);

impl DraftHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DraftHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DraftHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl TryFrom<String> for DraftHandle {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_identifier(&value).map(Self)
    }
}

impl From<DraftHandle> for String {
    fn from(handle: DraftHandle) -> Self {
        handle.to_string()
    }
}

/// Tag selecting the extension module that owns a node's payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeKind(String);

impl NodeKind {
    pub const CONTAINER: &'static str = "container";
    pub const STYLE_MAPPING: &'static str = "style-mapping";
    pub const SHAPE: &'static str = "shape";

    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn container() -> Self {
        Self::new(Self::CONTAINER)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry of the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub sort_key: Option<i64>,
    pub version: u64,
    pub is_draft: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Fresh, uncommitted node at version 1.
    pub fn new(parent_id: Option<NodeId>, name: impl Into<String>, kind: NodeKind, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: NodeId::new(),
            parent_id,
            name: name.into(),
            kind,
            payload,
            sort_key: None,
            version: 1,
            is_draft: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_sort_key(mut self, sort_key: Option<i64>) -> Self {
        self.sort_key = sort_key;
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Apply one field edit in place.
    pub fn apply_edit(&mut self, edit: &FieldEdit) -> Result<(), String> {
        match edit.field {
            NodeField::Name => {
                let name = edit
                    .new_value
                    .as_str()
                    .ok_or_else(|| "name must be a string".to_string())?;
                self.name = name.to_string();
            }
            NodeField::Payload => {
                self.payload = edit.new_value.clone();
            }
            NodeField::SortKey => {
                self.sort_key = match &edit.new_value {
                    Value::Null => None,
                    other => Some(
                        other
                            .as_i64()
                            .ok_or_else(|| "sortKey must be an integer or null".to_string())?,
                    ),
                };
            }
        }
        Ok(())
    }
}

/// Editable node fields. Parent changes go through `move`; kind is fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeField {
    Name,
    Payload,
    SortKey,
}

impl fmt::Display for NodeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeField::Name => "name",
            NodeField::Payload => "payload",
            NodeField::SortKey => "sortKey",
        };
        f.write_str(s)
    }
}

/// A single field-level edit recorded on a working copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldEdit {
    pub field: NodeField,
    pub new_value: Value,
}

impl FieldEdit {
    pub fn new(field: NodeField, new_value: Value) -> Self {
        Self { field, new_value }
    }

    pub fn rename(name: impl Into<String>) -> Self {
        Self::new(NodeField::Name, Value::String(name.into()))
    }

    pub fn payload(payload: Value) -> Self {
        Self::new(NodeField::Payload, payload)
    }
}

/// Creation request for a node; the engine assigns id and version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNode {
    #[serde(default)]
    pub parent_id: Option<NodeId>,
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub sort_key: Option<i64>,
}

impl NewNode {
    pub fn new(parent_id: Option<NodeId>, name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            parent_id,
            name: name.into(),
            kind,
            payload: Value::Null,
            sort_key: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn into_node(self) -> Node {
        Node::new(self.parent_id, self.name, self.kind, self.payload).with_sort_key(self.sort_key)
    }
}

/// What happens to the children of a deleted node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum DeletePolicy {
    /// Remove the whole subtree.
    Cascade,
    /// Move the direct children under `parent_id` (`None` makes them roots).
    #[serde(rename_all = "camelCase")]
    ReparentTo { parent_id: Option<NodeId> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_id_roundtrips_through_canonical_text() {
        let id = NodeId::new();
        let text = id.to_string();
        assert_eq!(text.parse::<NodeId>().unwrap(), id);
        assert!("not-an-id".parse::<NodeId>().is_err());
    }

    #[test]
    fn apply_edit_rejects_non_string_name() {
        let mut node = Node::new(None, "a", NodeKind::container(), json!({}));
        let err = node.apply_edit(&FieldEdit::new(NodeField::Name, json!(3)));
        assert!(err.is_err());
        assert_eq!(node.name, "a");

        node.apply_edit(&FieldEdit::new(NodeField::SortKey, json!(7))).unwrap();
        assert_eq!(node.sort_key, Some(7));
        node.apply_edit(&FieldEdit::new(NodeField::SortKey, Value::Null)).unwrap();
        assert_eq!(node.sort_key, None);
    }

    #[test]
    fn delete_policy_wire_shape() {
        let policy: DeletePolicy = serde_json::from_value(json!({"mode": "cascade"})).unwrap();
        assert_eq!(policy, DeletePolicy::Cascade);

        let target = NodeId::new();
        let policy: DeletePolicy =
            serde_json::from_value(json!({"mode": "reparentTo", "parentId": target.to_string()})).unwrap();
        assert_eq!(policy, DeletePolicy::ReparentTo { parent_id: Some(target) });
    }
}
