//! Domain-event sink used by job bodies.
//!
//! Job bodies queue events while they run; the job manager decides afterwards
//! whether those events are **sent** (the attempt finished) or **rolled back**
//! (the attempt failed). Buffers are kept per thread, so concurrent workers
//! sharing one sink never flush or discard each other's events.
//!
//! ## Delivery
//!
//! Sent events are fanned out to subscribers with broadcast semantics, the
//! same way the rest of the platform distributes events: every subscription
//! receives a copy, dead subscribers are dropped while publishing.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use jobforge_core::OwnerId;

/// A domain event emitted by a job body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    event_id: Uuid,
    event_type: String,
    owner_id: Option<OwnerId>,
    payload: serde_json::Value,
    occurred_at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: event_type.into(),
            owner_id: None,
            payload,
            occurred_at: Utc::now(),
        }
    }

    pub fn for_owner(mut self, owner_id: OwnerId) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn owner_id(&self) -> Option<OwnerId> {
        self.owner_id
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventSinkError {
    #[error("event delivery failed: {0}")]
    Delivery(String),
}

/// Buffers events for the calling thread until they are sent or discarded.
pub trait EventSink: Send + Sync {
    /// Buffer an event for the current thread.
    fn queue(&self, event: JobEvent);

    /// Deliver the current thread's buffered events. Returns how many were sent.
    fn send_events(&self) -> Result<usize, EventSinkError>;

    /// Discard the current thread's buffered events. Returns how many were dropped.
    fn rollback(&self) -> usize;
}

impl<S> EventSink for Arc<S>
where
    S: EventSink + ?Sized,
{
    fn queue(&self, event: JobEvent) {
        (**self).queue(event)
    }

    fn send_events(&self) -> Result<usize, EventSinkError> {
        (**self).send_events()
    }

    fn rollback(&self) -> usize {
        (**self).rollback()
    }
}

/// A subscription to sent events.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// In-memory event sink.
///
/// - No IO / no async
/// - Per-thread buffers
/// - Keeps a log of everything sent, for inspection in tests
#[derive(Debug, Default)]
pub struct InMemoryEventSink {
    buffers: Mutex<HashMap<ThreadId, Vec<JobEvent>>>,
    sent: Mutex<Vec<JobEvent>>,
    subscribers: Mutex<Vec<mpsc::Sender<JobEvent>>>,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn subscribe(&self) -> Subscription<JobEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Subscription::new(rx)
    }

    /// Events sent so far, oldest first.
    pub fn sent(&self) -> Vec<JobEvent> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Events buffered by the calling thread.
    pub fn pending(&self) -> Vec<JobEvent> {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&thread::current().id())
            .cloned()
            .unwrap_or_default()
    }

    fn take_buffer(&self) -> Vec<JobEvent> {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&thread::current().id())
            .unwrap_or_default()
    }
}

impl EventSink for InMemoryEventSink {
    fn queue(&self, event: JobEvent) {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(thread::current().id())
            .or_default()
            .push(event);
    }

    fn send_events(&self) -> Result<usize, EventSinkError> {
        let events = self.take_buffer();
        let count = events.len();

        if count > 0 {
            let mut subs = self
                .subscribers
                .lock()
                .map_err(|_| EventSinkError::Delivery("subscriber list poisoned".to_string()))?;
            for event in &events {
                subs.retain(|tx| tx.send(event.clone()).is_ok());
            }
            drop(subs);

            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(events);
        }

        Ok(count)
    }

    fn rollback(&self) -> usize {
        self.take_buffer().len()
    }
}
