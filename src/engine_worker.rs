// src/engine_worker.rs
// Engine Worker - the message-passing boundary in front of the gateway
//
// Callers never touch `EngineState` directly. A client sends a request with a
// correlation id into a bounded inbox and awaits a oneshot reply; the worker
// runs every call in its own task, so a caller that goes away never cancels a
// mutation halfway.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::change_bus::SubscriptionId;
use crate::rpc_gateway::{EventEnvelope, RpcContext, RpcGateway, RpcOutcome, RpcRequest, RpcResponse};
use crate::state_mod::EngineStateType;

#[derive(Debug)]
enum Inbound {
    Call {
        request: RpcRequest,
        context: RpcContext,
        reply: oneshot::Sender<RpcResponse>,
    },
    Disconnect {
        context: RpcContext,
    },
    Shutdown,
}

/// Owner of the worker task
#[derive(Debug)]
pub struct EngineHandle {
    inbox: mpsc::Sender<Inbound>,
    state: EngineStateType,
    worker: JoinHandle<()>,
}

impl EngineHandle {
    /// Start the worker loop over `state`.
    pub async fn spawn(state: EngineStateType) -> Self {
        let gateway = Arc::new(RpcGateway::standard(&state.config.gateway).await);
        let (inbox, rx) = mpsc::channel(state.config.gateway.inbox_capacity);
        let worker = tokio::spawn(run_worker(rx, gateway, state.clone()));
        tracing::info!(inbox_capacity = state.config.gateway.inbox_capacity, "engine worker started");
        Self { inbox, state, worker }
    }

    /// Open a connection: a client for calls and a receiver for pushed events.
    pub fn connect(&self) -> (EngineClient, EventReceiver) {
        let (events_tx, events_rx) = mpsc::channel(self.state.config.gateway.event_buffer);
        let cancelled = Arc::new(Mutex::new(HashMap::new()));
        let client = EngineClient {
            inbox: self.inbox.clone(),
            context: RpcContext::new(events_tx),
            cancelled: cancelled.clone(),
        };
        (client, EventReceiver { rx: events_rx, cancelled })
    }

    pub fn state(&self) -> &EngineStateType {
        &self.state
    }

    /// Stop accepting calls and wait for the loop to exit. Calls already running finish on their own.
    pub async fn shutdown(self) {
        if self.inbox.send(Inbound::Shutdown).await.is_err() {
            tracing::debug!("engine worker already stopped");
        }
        if let Err(e) = self.worker.await {
            tracing::error!(error = %e, "engine worker panicked");
        }
    }
}

async fn run_worker(mut inbox: mpsc::Receiver<Inbound>, gateway: Arc<RpcGateway>, state: EngineStateType) {
    while let Some(message) = inbox.recv().await {
        match message {
            Inbound::Call { request, context, reply } => {
                let gateway = gateway.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    let correlation_id = request.correlation_id;
                    let response = gateway.dispatch(request, &context, &state).await;
                    if reply.send(response).is_err() {
                        tracing::debug!(%correlation_id, "caller went away, reply discarded");
                    }
                });
            }
            Inbound::Disconnect { context } => {
                let state = state.clone();
                tokio::spawn(async move {
                    context.close(&state).await;
                    tracing::debug!(connection = %context.connection, "connection closed");
                });
            }
            Inbound::Shutdown => break,
        }
    }
    tracing::info!("engine worker stopped");
}

/// Subscriptions the client gave up on. `true` once the gateway confirmed the
/// forwarder stopped, so no new envelope for that id can be queued.
type Cancelled = Arc<Mutex<HashMap<SubscriptionId, bool>>>;

/// Calling side of one connection
#[derive(Debug)]
pub struct EngineClient {
    inbox: mpsc::Sender<Inbound>,
    context: RpcContext,
    cancelled: Cancelled,
}

impl EngineClient {
    /// Send one call and wait for its reply.
    pub async fn call(&self, method: &str, params: Value) -> RpcResponse {
        let request = RpcRequest::new(method, params);
        let correlation_id = request.correlation_id;
        let (reply, response) = oneshot::channel();
        let sent = self
            .inbox
            .send(Inbound::Call { request, context: self.context.clone(), reply })
            .await;
        let unavailable = || RpcResponse {
            correlation_id,
            outcome: RpcOutcome::Internal { message: "engine worker unavailable".to_string() },
            degraded: None,
            elapsed_ms: 0,
        };
        if sent.is_err() {
            return unavailable();
        }
        response.await.unwrap_or_else(|_| unavailable())
    }

    /// `call`, reduced to the success data or the failing outcome.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RpcOutcome> {
        self.call(method, params).await.into_data()
    }

    /// Stop a subscription. Nothing queued for it is surfaced by the receiver afterwards.
    pub async fn unsubscribe(&self, subscription: SubscriptionId) -> RpcResponse {
        self.cancelled.lock().await.insert(subscription, false);
        let response = self
            .call("unsubscribe", serde_json::json!({ "subscription": subscription }))
            .await;
        if !matches!(response.outcome, RpcOutcome::Internal { .. }) {
            self.cancelled.lock().await.insert(subscription, true);
        }
        response
    }
}

impl Drop for EngineClient {
    fn drop(&mut self) {
        let context = self.context.clone();
        if self.inbox.try_send(Inbound::Disconnect { context }).is_err() {
            tracing::debug!(connection = %self.context.connection, "disconnect not delivered");
        }
    }
}

enum Buffered {
    Ready(EventEnvelope),
    Empty,
    Closed,
}

/// Event side of one connection
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<EventEnvelope>,
    cancelled: Cancelled,
}

impl EventReceiver {
    /// Next event for a live subscription; `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.next_buffered().await {
                Buffered::Ready(envelope) => return Some(envelope),
                Buffered::Closed => return None,
                Buffered::Empty => {
                    let envelope = self.rx.recv().await?;
                    if !self.is_cancelled(&envelope.subscription).await {
                        return Some(envelope);
                    }
                }
            }
        }
    }

    /// Non-blocking variant of `recv`.
    pub async fn try_recv(&mut self) -> Option<EventEnvelope> {
        match self.next_buffered().await {
            Buffered::Ready(envelope) => Some(envelope),
            Buffered::Empty | Buffered::Closed => None,
        }
    }

    /// Pop queued envelopes until one belongs to a live subscription. Draining the
    /// queue forgets cancelled ids whose forwarder had already stopped.
    async fn next_buffered(&mut self) -> Buffered {
        loop {
            let settled: Vec<SubscriptionId> = self
                .cancelled
                .lock()
                .await
                .iter()
                .filter(|(_, stopped)| **stopped)
                .map(|(id, _)| *id)
                .collect();
            match self.rx.try_recv() {
                Ok(envelope) => {
                    if !self.is_cancelled(&envelope.subscription).await {
                        return Buffered::Ready(envelope);
                    }
                }
                Err(TryRecvError::Empty) => {
                    if !settled.is_empty() {
                        let mut cancelled = self.cancelled.lock().await;
                        for id in &settled {
                            cancelled.remove(id);
                        }
                    }
                    return Buffered::Empty;
                }
                Err(TryRecvError::Disconnected) => return Buffered::Closed,
            }
        }
    }

    async fn is_cancelled(&self, subscription: &SubscriptionId) -> bool {
        self.cancelled.lock().await.contains_key(subscription)
    }
}
