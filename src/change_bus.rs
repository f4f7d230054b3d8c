// src/change_bus.rs
// Change Bus - ordered fan-out of committed mutations to bounded subscriber queues
//
// Every subscriber owns a bounded channel with one reserved slot. When a
// subscriber's queue reaches the reserved slot the bus sends a terminal
// `Overflow` message there and forgets the subscriber, so publishing never
// waits on a consumer.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::node_mod::{FieldEdit, Node, NodeId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChangeKind {
    Added {
        node: Node,
    },
    #[serde(rename_all = "camelCase")]
    Updated {
        changes: Vec<FieldEdit>,
        is_draft: bool,
    },
    #[serde(rename_all = "camelCase")]
    Moved {
        from: Option<NodeId>,
        to: Option<NodeId>,
        previous_ancestry: Vec<NodeId>,
    },
    #[serde(rename_all = "camelCase")]
    Deleted {
        parent_id: Option<NodeId>,
    },
}

/// A committed mutation as seen by observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Assigned by the bus at publish time; strictly increasing.
    pub sequence: u64,
    pub node_id: NodeId,
    pub version: u64,
    /// Ancestor ids, root-first, at the time of the mutation.
    pub ancestry: Vec<NodeId>,
    pub change: ChangeKind,
    pub committed_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(node_id: NodeId, version: u64, ancestry: Vec<NodeId>, change: ChangeKind) -> Self {
        Self {
            sequence: 0,
            node_id,
            version,
            ancestry,
            change,
            committed_at: Utc::now(),
        }
    }

    /// Whether the event concerns `root` or anything below it, before or after a move.
    pub fn touches(&self, root: &NodeId) -> bool {
        if self.node_id == *root || self.ancestry.contains(root) {
            return true;
        }
        match &self.change {
            ChangeKind::Moved { previous_ancestry, .. } => previous_ancestry.contains(root),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "camelCase")]
pub enum SubscriptionFilter {
    All,
    Subtree { root: NodeId },
}

impl SubscriptionFilter {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match self {
            SubscriptionFilter::All => true,
            SubscriptionFilter::Subtree { root } => event.touches(root),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BusMessage {
    Event(ChangeEvent),
    /// Terminal: the subscriber fell behind and was dropped.
    #[serde(rename_all = "camelCase")]
    Overflow { last_sequence: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct Subscriber {
    id: SubscriptionId,
    filter: SubscriptionFilter,
    tx: mpsc::Sender<BusMessage>,
    closed: Arc<AtomicBool>,
    last_delivered: u64,
}

#[derive(Debug, Default)]
struct BusState {
    next_sequence: u64,
    subscribers: Vec<Subscriber>,
}

#[derive(Debug)]
pub struct ChangeBus {
    state: Mutex<BusState>,
    buffer: usize,
}

impl ChangeBus {
    /// `buffer` is the number of undelivered events a subscriber may lag behind.
    pub fn new(buffer: usize) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            buffer: buffer.max(1),
        }
    }

    pub async fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer + 1);
        let id = SubscriptionId::new();
        let closed = Arc::new(AtomicBool::new(false));
        let mut state = self.state.lock().await;
        let last_delivered = state.next_sequence;
        state.subscribers.push(Subscriber { id, filter, tx, closed: closed.clone(), last_delivered });
        tracing::debug!(subscription = %id, ?filter, "subscriber added");
        Subscription { id, filter, rx, closed }
    }

    /// Remove a subscriber. Messages still queued for it are discarded, not delivered.
    /// Returns false when the subscription was already gone.
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let mut state = self.state.lock().await;
        let Some(index) = state.subscribers.iter().position(|s| s.id == *id) else {
            return false;
        };
        let sub = state.subscribers.remove(index);
        sub.closed.store(true, Ordering::Release);
        true
    }

    pub async fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock().await;
        state.subscribers.retain(|s| !s.tx.is_closed());
        state.subscribers.len()
    }

    /// Assign the next sequence number and hand the event to every matching subscriber.
    pub async fn publish(&self, mut event: ChangeEvent) -> u64 {
        let mut state = self.state.lock().await;
        state.next_sequence += 1;
        let sequence = state.next_sequence;
        event.sequence = sequence;

        state.subscribers.retain_mut(|sub| {
            if sub.tx.is_closed() {
                return false;
            }
            if !sub.filter.matches(&event) {
                return true;
            }
            if sub.tx.capacity() <= 1 {
                let _ = sub.tx.try_send(BusMessage::Overflow { last_sequence: sub.last_delivered });
                tracing::warn!(subscription = %sub.id, last_sequence = sub.last_delivered, "subscriber overflowed, dropping");
                return false;
            }
            match sub.tx.try_send(BusMessage::Event(event.clone())) {
                Ok(()) => {
                    sub.last_delivered = sequence;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(subscription = %sub.id, "subscriber queue full, dropping");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });

        tracing::trace!(sequence, node = %event.node_id, "change published");
        sequence
    }
}

/// Receiving side of a subscription. Dropping it or unsubscribing cancels delivery.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    filter: SubscriptionFilter,
    rx: mpsc::Receiver<BusMessage>,
    closed: Arc<AtomicBool>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn filter(&self) -> SubscriptionFilter {
        self.filter
    }

    /// True once `ChangeBus::unsubscribe` removed this subscription.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Next message, or `None` once the bus dropped this subscriber and the queue is drained.
    /// After an unsubscribe nothing is returned, queued or not.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        if self.is_closed() {
            return None;
        }
        let message = self.rx.recv().await?;
        (!self.is_closed()).then_some(message)
    }

    pub fn try_recv(&mut self) -> Option<BusMessage> {
        if self.is_closed() {
            return None;
        }
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = BusMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.is_closed() {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(_)) if self.is_closed() => Poll::Ready(None),
            other => other,
        }
    }
}
