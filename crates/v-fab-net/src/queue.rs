//! ---
//! vfab_section: "05-edge-interfaces"
//! vfab_subsection: "module"
//! vfab_type: "source"
//! vfab_scope: "code"
//! vfab_description: "Collaborator contracts and in-memory backends."
//! vfab_version: "v0.0.0-prealpha"
//! vfab_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::Result;

/// One message as delivered by the queue transport.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Delivery identifier used for acknowledgment.
    pub id: Uuid,
    /// Queue the message was received from.
    pub queue: String,
    /// JSON message body.
    pub body: Vec<u8>,
}

/// At-least-once queue transport over named queues.
///
/// Messages must be acknowledged after processing; unacknowledged messages
/// remain eligible for redelivery by the transport.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Enqueue a message body on a named queue.
    async fn send(&self, queue: &str, body: Vec<u8>) -> Result<()>;

    /// Receive the next message from a queue, waiting until one arrives.
    async fn receive(&self, queue: &str) -> Result<QueueMessage>;

    /// Acknowledge a previously received message.
    async fn ack(&self, message: &QueueMessage) -> Result<()>;

    /// Drain all currently queued messages, acknowledging each without
    /// acting on its content. Returns the number of drained messages.
    async fn purge(&self, queue: &str) -> Result<usize>;
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueueMessage>,
    inflight: HashMap<Uuid, QueueMessage>,
}

struct QueueSlot {
    state: Mutex<QueueState>,
    available: Notify,
}

impl QueueSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
        }
    }
}

/// In-memory queue transport.
///
/// Unacknowledged messages stay parked in an in-flight table; a real broker
/// would redeliver them after a lock timeout, the in-memory transport keeps
/// them visible through [`InMemoryQueue::unacked`] instead.
#[derive(Default)]
pub struct InMemoryQueue {
    queues: Mutex<HashMap<String, Arc<QueueSlot>>>,
}

impl InMemoryQueue {
    /// Create an empty transport; queues come into existence on first use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages ready for delivery on a queue.
    pub fn depth(&self, queue: &str) -> usize {
        self.slot(queue).state.lock().ready.len()
    }

    /// Number of delivered-but-unacknowledged messages on a queue.
    pub fn unacked(&self, queue: &str) -> usize {
        self.slot(queue).state.lock().inflight.len()
    }

    fn slot(&self, queue: &str) -> Arc<QueueSlot> {
        self.queues
            .lock()
            .entry(queue.to_owned())
            .or_insert_with(|| Arc::new(QueueSlot::new()))
            .clone()
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueue {
    async fn send(&self, queue: &str, body: Vec<u8>) -> Result<()> {
        let slot = self.slot(queue);
        let message = QueueMessage {
            id: Uuid::new_v4(),
            queue: queue.to_owned(),
            body,
        };
        slot.state.lock().ready.push_back(message);
        slot.available.notify_one();
        Ok(())
    }

    async fn receive(&self, queue: &str) -> Result<QueueMessage> {
        let slot = self.slot(queue);
        loop {
            let notified = slot.available.notified();
            {
                let mut state = slot.state.lock();
                if let Some(message) = state.ready.pop_front() {
                    state.inflight.insert(message.id, message.clone());
                    return Ok(message);
                }
            }
            notified.await;
        }
    }

    async fn ack(&self, message: &QueueMessage) -> Result<()> {
        let slot = self.slot(&message.queue);
        if slot.state.lock().inflight.remove(&message.id).is_none() {
            debug!(queue = %message.queue, id = %message.id, "ack for message not in flight");
        }
        Ok(())
    }

    async fn purge(&self, queue: &str) -> Result<usize> {
        let slot = self.slot(queue);
        let drained = {
            let mut state = slot.state.lock();
            let count = state.ready.len();
            state.ready.clear();
            count
        };
        Ok(drained)
    }
}
