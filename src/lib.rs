//! Canopy tree data engine.
//!
//! A hierarchical node store with optimistic working copies and ordered
//! change notifications, reachable through a message-passing RPC boundary
//! (`engine_worker`).

pub mod change_bus;
pub mod config_mod;
pub mod engine_worker;
pub mod error_mod;
pub mod kind_registry;
pub mod node_mod;
pub mod rpc_gateway;
pub mod state_mod;
pub mod storage;
pub mod tree_navigator;
pub mod working_copy;

pub use change_bus::{BusMessage, ChangeBus, ChangeEvent, ChangeKind, Subscription, SubscriptionFilter, SubscriptionId};
pub use config_mod::{ConfigError, EngineConfig, StorageBackend};
pub use engine_worker::{EngineClient, EngineHandle, EventReceiver};
pub use error_mod::{EngineError, EngineResult};
pub use kind_registry::{KindExtension, KindRegistry, PayloadSchema};
pub use node_mod::{DeletePolicy, DraftHandle, FieldEdit, NewNode, Node, NodeField, NodeId, NodeKind};
pub use rpc_gateway::{EventEnvelope, RpcGateway, RpcOutcome, RpcRequest, RpcResponse};
pub use state_mod::{EngineState, EngineStateType, EngineStatus};
pub use storage::{NodeStore, StorageAdapter, StorageError};
pub use tree_navigator::TreeNavigator;
pub use working_copy::{CommitResult, WorkingCopy, WorkingCopyManager};
