// src/storage/mod.rs
// Storage module: node store, persistence backends and input validation

pub mod sqlite_adapter;
pub mod storage_mod;
pub mod validation_mod;

// Re-export main types and traits
pub use storage_mod::{
    parent_key,
    DeleteOutcome,
    MemoryAdapter,
    NodeLocks,
    NodeStore,
    RetryPolicy,
    StorageAdapter,
    StorageError,
    StorageStats,
    WriteBatch,
    WriteOp,
    ROOT_KEY,
};

// Re-export sqlite adapter type so callers can construct/register it easily
pub use sqlite_adapter::SqliteAdapter;

pub use validation_mod::{ValidationError, ValidationResult};
