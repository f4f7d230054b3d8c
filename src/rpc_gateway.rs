// src/rpc_gateway.rs
// RPC Gateway - typed request execution over the engine state
// Handlers are looked up by method name (or a `prefix.*` wildcard), wrapped in
// middleware, timed, and every failure is folded into a tagged `RpcOutcome`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::change_bus::{BusMessage, SubscriptionFilter, SubscriptionId};
use crate::config_mod::GatewayConfig;
use crate::error_mod::{EngineError, EngineResult};
use crate::node_mod::{DeletePolicy, DraftHandle, FieldEdit, NewNode, NodeField, NodeId};
use crate::state_mod::EngineState;
use crate::storage::validation_mod::validate_payload_size;
use crate::storage::StorageError;

/// One call crossing the engine boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    pub correlation_id: Uuid,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            method: method.to_string(),
            params,
        }
    }
}

/// Discriminated result of a call. Errors never cross the boundary any other way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum RpcOutcome {
    Success {
        data: Value,
    },
    NotFound {
        message: String,
    },
    VersionConflict {
        message: String,
        id: NodeId,
        expected: u64,
        actual: u64,
    },
    Conflict {
        message: String,
        id: NodeId,
        draft: DraftHandle,
    },
    #[serde(rename_all = "camelCase")]
    CycleError {
        message: String,
        id: NodeId,
        new_parent: NodeId,
    },
    ValidationError {
        message: String,
        field: String,
    },
    #[serde(rename_all = "camelCase")]
    Overflow {
        message: String,
        last_sequence: u64,
    },
    InvalidRequest {
        message: String,
    },
    Degraded {
        message: String,
    },
    Internal {
        message: String,
    },
}

impl From<EngineError> for RpcOutcome {
    fn from(error: EngineError) -> Self {
        let message = error.to_string();
        match error {
            EngineError::NotFound { .. } | EngineError::Storage(StorageError::NotFound { .. }) => {
                RpcOutcome::NotFound { message }
            }
            EngineError::VersionConflict { id, expected, actual } => {
                RpcOutcome::VersionConflict { message, id, expected, actual }
            }
            EngineError::Conflict { id, draft } => RpcOutcome::Conflict { message, id, draft },
            EngineError::Cycle { id, new_parent } => RpcOutcome::CycleError { message, id, new_parent },
            EngineError::Validation { field, .. } => RpcOutcome::ValidationError { message, field },
            EngineError::Overflow { last_sequence } => RpcOutcome::Overflow { message, last_sequence },
            EngineError::InvalidRequest { .. } => RpcOutcome::InvalidRequest { message },
            EngineError::Degraded { .. } => RpcOutcome::Degraded { message },
            EngineError::Storage(_) => RpcOutcome::Internal { message },
        }
    }
}

/// Reply envelope, paired with its request by `correlation_id`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    pub correlation_id: Uuid,
    pub outcome: RpcOutcome,
    /// Set while the engine is read-only after a fatal storage failure
    pub degraded: Option<String>,
    pub elapsed_ms: u64,
}

impl RpcResponse {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RpcOutcome::Success { .. })
    }

    pub fn data(&self) -> Option<&Value> {
        match &self.outcome {
            RpcOutcome::Success { data } => Some(data),
            _ => None,
        }
    }

    pub fn into_data(self) -> Result<Value, RpcOutcome> {
        match self.outcome {
            RpcOutcome::Success { data } => Ok(data),
            other => Err(other),
        }
    }
}

/// Change pushed to a connection for one of its subscriptions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub subscription: SubscriptionId,
    pub message: BusMessage,
}

/// Per-connection call context: where pushed events go and which forwarders are live.
#[derive(Debug, Clone)]
pub struct RpcContext {
    pub connection: Uuid,
    events: mpsc::Sender<EventEnvelope>,
    forwarders: Arc<Mutex<HashMap<SubscriptionId, Forwarder>>>,
}

/// Forwarding task of one subscription. Resolves to the last delivered sequence
/// when the bus dropped the subscriber for falling behind.
type Forwarder = JoinHandle<Option<u64>>;

impl RpcContext {
    pub fn new(events: mpsc::Sender<EventEnvelope>) -> Self {
        Self {
            connection: Uuid::new_v4(),
            events,
            forwarders: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Stop every forwarder of this connection.
    pub async fn close(&self, state: &EngineState) {
        let mut forwarders = self.forwarders.lock().await;
        for (id, task) in forwarders.drain() {
            task.abort();
            state.bus.unsubscribe(&id).await;
        }
    }
}

/// Method handler trait
#[async_trait::async_trait]
pub trait MethodHandler: Send + Sync {
    async fn execute(&self, request: &RpcRequest, context: &RpcContext, state: &EngineState) -> EngineResult<Value>;

    /// Method name, or `prefix.*` for a family of methods
    fn method(&self) -> &str;

    /// Whether `method` writes; writes are refused while the store is degraded
    fn mutates(&self, _method: &str) -> bool {
        false
    }
}

/// Middleware trait
#[async_trait::async_trait]
pub trait RpcMiddleware: Send + Sync {
    async fn before_execute(&self, _request: &RpcRequest, _context: &RpcContext) -> EngineResult<()> {
        Ok(())
    }

    async fn after_execute(&self, _request: &RpcRequest, _response: &mut RpcResponse) {}

    /// Lower numbers execute first
    fn priority(&self) -> u32 {
        100
    }

    fn name(&self) -> &str;
}

/// Method performance statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodStats {
    pub total_calls: u64,
    pub avg_duration_ms: f64,
    pub success_rate: f64,
    pub last_call: chrono::DateTime<chrono::Utc>,
    pub slowest_call_ms: u64,
    pub fastest_call_ms: u64,
}

impl MethodStats {
    fn new() -> Self {
        Self {
            total_calls: 0,
            avg_duration_ms: 0.0,
            success_rate: 100.0,
            last_call: chrono::Utc::now(),
            slowest_call_ms: 0,
            fastest_call_ms: u64::MAX,
        }
    }

    fn record(&mut self, elapsed: Duration, success: bool) {
        let duration_ms = elapsed.as_millis() as u64;
        let previous = self.total_calls as f64;
        self.total_calls += 1;
        self.last_call = chrono::Utc::now();
        self.avg_duration_ms = (self.avg_duration_ms * previous + duration_ms as f64) / self.total_calls as f64;
        let successes = self.success_rate * previous / 100.0 + if success { 1.0 } else { 0.0 };
        self.success_rate = successes / self.total_calls as f64 * 100.0;
        self.slowest_call_ms = self.slowest_call_ms.max(duration_ms);
        self.fastest_call_ms = self.fastest_call_ms.min(duration_ms);
    }
}

type StatsTable = Arc<RwLock<HashMap<String, MethodStats>>>;

#[derive(Debug)]
struct RequestValidator {
    max_payload_bytes: usize,
}

impl RequestValidator {
    fn validate(&self, request: &RpcRequest) -> EngineResult<()> {
        if request.method.trim().is_empty() {
            return Err(EngineError::invalid("method is required"));
        }
        if !(request.params.is_object() || request.params.is_null()) {
            return Err(EngineError::invalid("params must be an object"));
        }
        validate_payload_size(&request.params, self.max_payload_bytes)
            .map_err(|e| EngineError::invalid(e.to_string()))
    }
}

/// Decode `params` into the method's parameter type; absent params read as `{}`.
fn params<T: DeserializeOwned>(request: &RpcRequest) -> EngineResult<T> {
    let raw = match &request.params {
        Value::Null => json!({}),
        other => other.clone(),
    };
    serde_json::from_value(raw)
        .map_err(|e| EngineError::invalid(format!("invalid params for {}: {}", request.method, e)))
}

fn to_data<T: Serialize>(value: &T) -> EngineResult<Value> {
    serde_json::to_value(value).map_err(|e| StorageError::SerializationError { error: e.to_string() }.into())
}

pub struct RpcGateway {
    handlers: RwLock<HashMap<String, Arc<dyn MethodHandler>>>,
    middleware: RwLock<Vec<Arc<dyn RpcMiddleware>>>,
    stats: StatsTable,
    validator: RequestValidator,
}

impl std::fmt::Debug for RpcGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcGateway")
            .field("handlers_count", &self.handlers.try_read().map(|h| h.len()).unwrap_or(0))
            .field("middleware_count", &self.middleware.try_read().map(|m| m.len()).unwrap_or(0))
            .finish()
    }
}

impl RpcGateway {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            middleware: RwLock::new(Vec::new()),
            stats: Arc::new(RwLock::new(HashMap::new())),
            validator: RequestValidator { max_payload_bytes: config.max_payload_bytes },
        }
    }

    /// Gateway with every engine method and the logging middleware registered.
    pub async fn standard(config: &GatewayConfig) -> Self {
        let gateway = Self::new(config);
        gateway.register_handler(NodeMethods).await;
        gateway.register_handler(SubscribeMethod).await;
        gateway.register_handler(UnsubscribeMethod).await;
        gateway.register_handler(EngineMethods { stats: gateway.stats.clone() }).await;
        gateway.add_middleware(LoggingMiddleware).await;
        gateway
    }

    pub async fn register_handler<H>(&self, handler: H)
    where
        H: MethodHandler + 'static,
    {
        let method = handler.method().to_string();
        self.handlers.write().await.insert(method, Arc::new(handler));
    }

    pub async fn add_middleware<M>(&self, middleware: M)
    where
        M: RpcMiddleware + 'static,
    {
        let mut stack = self.middleware.write().await;
        stack.push(Arc::new(middleware));
        stack.sort_by_key(|m| m.priority());
    }

    pub async fn registered_methods(&self) -> Vec<String> {
        let mut methods: Vec<_> = self.handlers.read().await.keys().cloned().collect();
        methods.sort();
        methods
    }

    pub async fn method_stats(&self) -> HashMap<String, MethodStats> {
        self.stats.read().await.clone()
    }

    /// Execute one request. Always produces a response.
    pub async fn dispatch(&self, request: RpcRequest, context: &RpcContext, state: &EngineState) -> RpcResponse {
        let start = Instant::now();
        let outcome = match self.run(&request, context, state).await {
            Ok(data) => RpcOutcome::Success { data },
            Err(error) => error.into(),
        };
        let mut response = RpcResponse {
            correlation_id: request.correlation_id,
            outcome,
            degraded: state.store.degraded().await,
            elapsed_ms: 0,
        };

        let stack: Vec<_> = self.middleware.read().await.iter().cloned().collect();
        for middleware in &stack {
            middleware.after_execute(&request, &mut response).await;
        }

        let elapsed = start.elapsed();
        response.elapsed_ms = elapsed.as_millis() as u64;
        self.stats
            .write()
            .await
            .entry(request.method.clone())
            .or_insert_with(MethodStats::new)
            .record(elapsed, response.is_success());
        response
    }

    async fn run(&self, request: &RpcRequest, context: &RpcContext, state: &EngineState) -> EngineResult<Value> {
        self.validator.validate(request)?;

        let stack: Vec<_> = self.middleware.read().await.iter().cloned().collect();
        for middleware in &stack {
            middleware.before_execute(request, context).await?;
        }

        let handler = self.resolve(&request.method).await?;
        if handler.mutates(&request.method) {
            if let Some(reason) = state.store.degraded().await {
                return Err(EngineError::Degraded { reason });
            }
        }
        handler.execute(request, context, state).await
    }

    /// Exact match first, then `prefix.*` wildcards.
    async fn resolve(&self, method: &str) -> EngineResult<Arc<dyn MethodHandler>> {
        let handlers = self.handlers.read().await;
        if let Some(handler) = handlers.get(method) {
            return Ok(handler.clone());
        }
        handlers
            .iter()
            .find(|(pattern, _)| {
                pattern
                    .strip_suffix(".*")
                    .and_then(|prefix| method.strip_prefix(prefix))
                    .is_some_and(|rest| rest.starts_with('.'))
            })
            .map(|(_, handler)| handler.clone())
            .ok_or_else(|| EngineError::invalid(format!("unknown method '{}'", method)))
    }
}

#[derive(Deserialize)]
struct IdParams {
    id: NodeId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChildrenParams {
    #[serde(default)]
    parent_id: Option<NodeId>,
}

#[derive(Deserialize)]
struct DraftParams {
    draft: DraftHandle,
}

#[derive(Deserialize)]
struct ApplyEditParams {
    draft: DraftHandle,
    field: NodeField,
    #[serde(default)]
    value: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveParams {
    id: NodeId,
    #[serde(default)]
    new_parent_id: Option<NodeId>,
}

#[derive(Deserialize)]
struct DeleteParams {
    id: NodeId,
    policy: DeletePolicy,
}

#[derive(Deserialize)]
struct PathParams {
    path: Vec<String>,
}

/// `node.*`: reads, drafts and structural edits
pub struct NodeMethods;

#[async_trait::async_trait]
impl MethodHandler for NodeMethods {
    async fn execute(&self, request: &RpcRequest, _context: &RpcContext, state: &EngineState) -> EngineResult<Value> {
        match request.method.as_str() {
            "node.get" => {
                let p: IdParams = params(request)?;
                to_data(&state.store.get(&p.id).await?)
            }
            "node.children" => {
                let p: ChildrenParams = params(request)?;
                let _topology = state.store.topology_read().await;
                to_data(&state.store.get_children(p.parent_id.as_ref()).await?)
            }
            "node.create" => {
                let new_node: NewNode = params(request)?;
                to_data(&state.create_node(new_node).await?)
            }
            "node.beginCreate" => {
                let new_node: NewNode = params(request)?;
                let copy = state.begin_create(new_node).await?;
                Ok(json!({ "draft": copy.handle, "node": to_data(&copy.snapshot)? }))
            }
            "node.beginEdit" => {
                let p: IdParams = params(request)?;
                let copy = state.drafts.begin(&p.id).await?;
                Ok(json!({ "draft": copy.handle, "baseVersion": copy.base_version }))
            }
            "node.applyEdit" => {
                let p: ApplyEditParams = params(request)?;
                let copy = state.drafts.apply(&p.draft, FieldEdit::new(p.field, p.value)).await?;
                Ok(json!({ "draft": copy.handle, "pendingChanges": copy.changes.len() }))
            }
            "node.commit" => {
                let p: DraftParams = params(request)?;
                let result = state.drafts.commit(&p.draft).await?;
                Ok(json!({ "success": true, "newVersion": result.new_version, "isDraft": result.is_draft }))
            }
            "node.discard" => {
                let p: DraftParams = params(request)?;
                state.drafts.discard(&p.draft).await?;
                Ok(json!({ "success": true }))
            }
            "node.move" => {
                let p: MoveParams = params(request)?;
                let moved = state.move_node(&p.id, p.new_parent_id).await?;
                Ok(json!({ "success": true, "version": moved.version }))
            }
            "node.delete" => {
                let p: DeleteParams = params(request)?;
                let outcome = state.delete_node(&p.id, p.policy).await?;
                let removed: Vec<NodeId> = outcome.removed.iter().map(|n| n.id).collect();
                Ok(json!({ "success": true, "removed": removed }))
            }
            "node.resolvePath" => {
                let p: PathParams = params(request)?;
                let _topology = state.store.topology_read().await;
                Ok(json!({ "id": state.navigator.resolve_path(&p.path).await? }))
            }
            "node.ancestors" => {
                let p: IdParams = params(request)?;
                let _topology = state.store.topology_read().await;
                to_data(&state.navigator.ancestors_of(&p.id).await?)
            }
            other => Err(EngineError::invalid(format!("unknown method '{}'", other))),
        }
    }

    fn method(&self) -> &str {
        "node.*"
    }

    fn mutates(&self, method: &str) -> bool {
        matches!(
            method,
            "node.create" | "node.beginCreate" | "node.beginEdit" | "node.applyEdit" | "node.commit" | "node.move" | "node.delete"
        )
    }
}

#[derive(Deserialize)]
struct SubscribeParams {
    filter: SubscriptionFilter,
}

/// `subscribe`: registers on the bus and forwards matching messages to the connection
pub struct SubscribeMethod;

#[async_trait::async_trait]
impl MethodHandler for SubscribeMethod {
    async fn execute(&self, request: &RpcRequest, context: &RpcContext, state: &EngineState) -> EngineResult<Value> {
        let p: SubscribeParams = params(request)?;
        if let SubscriptionFilter::Subtree { root } = &p.filter {
            state.store.get(root).await?;
        }

        let mut subscription = state.bus.subscribe(p.filter).await;
        let id = subscription.id();
        let events = context.events.clone();
        let task = tokio::spawn(async move {
            let mut overflowed = None;
            while let Some(message) = subscription.recv().await {
                if let BusMessage::Overflow { last_sequence } = &message {
                    overflowed = Some(*last_sequence);
                }
                if events.send(EventEnvelope { subscription: id, message }).await.is_err() {
                    break;
                }
            }
            tracing::debug!(subscription = %id, ?overflowed, "forwarder finished");
            overflowed
        });

        context.forwarders.lock().await.insert(id, task);
        tracing::info!(subscription = %id, connection = %context.connection, filter = ?p.filter, "subscribed");
        Ok(json!({ "subscription": id }))
    }

    fn method(&self) -> &str {
        "subscribe"
    }
}

#[derive(Deserialize)]
struct UnsubscribeParams {
    subscription: SubscriptionId,
}

pub struct UnsubscribeMethod;

#[async_trait::async_trait]
impl MethodHandler for UnsubscribeMethod {
    async fn execute(&self, request: &RpcRequest, context: &RpcContext, state: &EngineState) -> EngineResult<Value> {
        let p: UnsubscribeParams = params(request)?;
        let task = context.forwarders.lock().await.remove(&p.subscription);
        let Some(task) = task else {
            return Err(EngineError::NotFound { what: format!("subscription {}", p.subscription) });
        };
        task.abort();
        // wait for the task to stop so nothing more is pushed for this subscription
        let stopped = task.await;
        state.bus.unsubscribe(&p.subscription).await;
        if let Ok(Some(last_sequence)) = stopped {
            tracing::info!(subscription = %p.subscription, last_sequence, "unsubscribed after overflow");
            return Err(EngineError::Overflow { last_sequence });
        }
        tracing::info!(subscription = %p.subscription, "unsubscribed");
        Ok(json!({ "success": true }))
    }

    fn method(&self) -> &str {
        "unsubscribe"
    }
}

/// `engine.*`: health and statistics
pub struct EngineMethods {
    stats: StatsTable,
}

#[async_trait::async_trait]
impl MethodHandler for EngineMethods {
    async fn execute(&self, request: &RpcRequest, _context: &RpcContext, state: &EngineState) -> EngineResult<Value> {
        match request.method.as_str() {
            "engine.stats" => {
                let status = state.status().await?;
                let methods = self.stats.read().await.clone();
                Ok(json!({ "engine": to_data(&status)?, "methods": to_data(&methods)? }))
            }
            "engine.health" => {
                state.store.health_check().await?;
                Ok(json!({ "healthy": true, "degraded": state.store.degraded().await }))
            }
            other => Err(EngineError::invalid(format!("unknown method '{}'", other))),
        }
    }

    fn method(&self) -> &str {
        "engine.*"
    }
}

/// Logs every call through `tracing`
pub struct LoggingMiddleware;

#[async_trait::async_trait]
impl RpcMiddleware for LoggingMiddleware {
    async fn before_execute(&self, request: &RpcRequest, context: &RpcContext) -> EngineResult<()> {
        tracing::debug!(method = %request.method, correlation_id = %request.correlation_id, connection = %context.connection, "rpc call");
        Ok(())
    }

    async fn after_execute(&self, request: &RpcRequest, response: &mut RpcResponse) {
        match &response.outcome {
            RpcOutcome::Success { .. } => {
                tracing::debug!(method = %request.method, correlation_id = %request.correlation_id, "rpc ok")
            }
            RpcOutcome::Internal { message } => {
                tracing::error!(method = %request.method, correlation_id = %request.correlation_id, %message, "rpc failed")
            }
            other => {
                tracing::info!(method = %request.method, correlation_id = %request.correlation_id, outcome = ?other, "rpc rejected")
            }
        }
    }

    fn priority(&self) -> u32 {
        10
    }

    fn name(&self) -> &str {
        "LoggingMiddleware"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_mod::EngineConfig;
    use crate::kind_registry::KindRegistry;
    use crate::node_mod::NodeKind;
    use crate::storage::MemoryAdapter;

    async fn setup() -> (RpcGateway, RpcContext, EngineState, mpsc::Receiver<EventEnvelope>) {
        let gateway = RpcGateway::standard(&GatewayConfig::default()).await;
        let (tx, rx) = mpsc::channel(16);
        let state = EngineState::in_memory().await.unwrap();
        (gateway, RpcContext::new(tx), state, rx)
    }

    #[tokio::test]
    async fn wildcard_and_exact_routes() {
        let (gateway, _ctx, _state, _rx) = setup().await;
        assert!(gateway.resolve("node.get").await.is_ok());
        assert!(gateway.resolve("subscribe").await.is_ok());
        assert!(gateway.resolve("nodes.get").await.is_err());
        assert!(gateway.resolve("bogus").await.is_err());
    }

    #[tokio::test]
    async fn malformed_id_is_invalid_request() {
        let (gateway, ctx, state, _rx) = setup().await;
        let response = gateway
            .dispatch(RpcRequest::new("node.get", json!({"id": "NOT-A-UUID"})), &ctx, &state)
            .await;
        assert!(matches!(response.outcome, RpcOutcome::InvalidRequest { .. }));

        let response = gateway
            .dispatch(RpcRequest::new("node.get", json!({"id": NodeId::new()})), &ctx, &state)
            .await;
        assert!(matches!(response.outcome, RpcOutcome::NotFound { .. }));
    }

    #[tokio::test]
    async fn oversized_params_rejected() {
        let config = GatewayConfig { max_payload_bytes: 64, ..GatewayConfig::default() };
        let gateway = RpcGateway::standard(&config).await;
        let (tx, _rx) = mpsc::channel(4);
        let ctx = RpcContext::new(tx);
        let state = EngineState::in_memory().await.unwrap();
        let big = "x".repeat(200);
        let response = gateway
            .dispatch(RpcRequest::new("node.create", json!({"name": big, "kind": "container"})), &ctx, &state)
            .await;
        assert!(matches!(response.outcome, RpcOutcome::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn stats_count_calls_per_method() {
        let (gateway, ctx, state, _rx) = setup().await;
        let create = RpcRequest::new("node.create", json!({"name": "a", "kind": "container"}));
        assert!(gateway.dispatch(create, &ctx, &state).await.is_success());
        let bad = RpcRequest::new("node.create", json!({"name": "", "kind": "container"}));
        let response = gateway.dispatch(bad, &ctx, &state).await;
        assert!(matches!(response.outcome, RpcOutcome::ValidationError { .. }));

        let stats = gateway.method_stats().await;
        let create_stats = &stats["node.create"];
        assert_eq!(create_stats.total_calls, 2);
        assert!((create_stats.success_rate - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn subscription_forwards_until_unsubscribed() {
        let (gateway, ctx, state, mut rx) = setup().await;
        let response = gateway
            .dispatch(RpcRequest::new("subscribe", json!({"filter": {"scope": "all"}})), &ctx, &state)
            .await;
        let subscription: SubscriptionId =
            serde_json::from_value(response.data().unwrap()["subscription"].clone()).unwrap();

        gateway
            .dispatch(RpcRequest::new("node.create", json!({"name": "a", "kind": "container"})), &ctx, &state)
            .await;
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.subscription, subscription);
        assert!(matches!(envelope.message, BusMessage::Event(_)));

        let response = gateway
            .dispatch(RpcRequest::new("unsubscribe", json!({"subscription": subscription})), &ctx, &state)
            .await;
        assert!(response.is_success());
        assert_eq!(state.bus.subscriber_count().await, 0);

        let again = gateway
            .dispatch(RpcRequest::new("unsubscribe", json!({"subscription": subscription})), &ctx, &state)
            .await;
        assert!(matches!(again.outcome, RpcOutcome::NotFound { .. }));
    }

    #[tokio::test]
    async fn unsubscribe_after_overflow_reports_last_sequence() {
        let mut config = EngineConfig::default();
        config.bus.subscriber_buffer = 1;
        let state = EngineState::with_adapter(config, Box::new(MemoryAdapter::new()), KindRegistry::with_builtins())
            .await
            .unwrap();
        let gateway = RpcGateway::standard(&GatewayConfig::default()).await;
        let (tx, mut rx) = mpsc::channel(1);
        let ctx = RpcContext::new(tx);

        let response = gateway
            .dispatch(RpcRequest::new("subscribe", json!({"filter": {"scope": "all"}})), &ctx, &state)
            .await;
        let subscription: SubscriptionId =
            serde_json::from_value(response.data().unwrap()["subscription"].clone()).unwrap();
        for i in 0..6 {
            state
                .create_node(NewNode::new(None, &format!("n{}", i), NodeKind::container()))
                .await
                .unwrap();
        }

        let mut last = None;
        while let Some(envelope) = rx.recv().await {
            if let BusMessage::Overflow { last_sequence } = envelope.message {
                last = Some(last_sequence);
                break;
            }
        }
        assert!(last.is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let response = gateway
            .dispatch(RpcRequest::new("unsubscribe", json!({"subscription": subscription})), &ctx, &state)
            .await;
        match response.outcome {
            RpcOutcome::Overflow { last_sequence, .. } => assert_eq!(Some(last_sequence), last),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(state.bus.subscriber_count().await, 0);
    }

    #[test]
    fn outcome_wire_shape() {
        let id = NodeId::new();
        let outcome: RpcOutcome = EngineError::Cycle { id, new_parent: id }.into();
        let wire = serde_json::to_value(&outcome).unwrap();
        assert_eq!(wire["status"], "cycleError");
        assert_eq!(wire["newParent"], json!(id));
    }
}
