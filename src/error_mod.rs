// src/error_mod.rs
// Engine error taxonomy shared by every component behind the gateway

use crate::node_mod::{DraftHandle, NodeId};
use crate::storage::validation_mod::ValidationError;
use crate::storage::StorageError;

/// Engine errors with detailed context
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Version conflict on {id}: draft based on version {expected}, store is at {actual}")]
    VersionConflict { id: NodeId, expected: u64, actual: u64 },

    #[error("Draft {draft} is already open for node {id}")]
    Conflict { id: NodeId, draft: DraftHandle },

    #[error("Placing {id} under {new_parent} would create a cycle")]
    Cycle { id: NodeId, new_parent: NodeId },

    #[error("Validation error in field '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("Subscriber dropped for falling behind after sequence {last_sequence}")]
    Overflow { last_sequence: u64 },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Engine is read-only: {reason}")]
    Degraded { reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl EngineError {
    pub fn node_not_found(id: &NodeId) -> Self {
        EngineError::NotFound { what: format!("node {}", id) }
    }

    pub fn draft_not_found(handle: &DraftHandle) -> Self {
        EngineError::NotFound { what: format!("draft {}", handle) }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        EngineError::InvalidRequest { message: message.into() }
    }
}

impl From<ValidationError> for EngineError {
    fn from(error: ValidationError) -> Self {
        EngineError::Validation {
            field: error.field().to_string(),
            message: error.to_string(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
