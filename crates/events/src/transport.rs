//! Message transport abstraction (mechanics only).
//!
//! This module describes the **broker contract** the job system is built on:
//! sessions, producers and consumers with transactional commit/rollback.
//!
//! ## Session semantics
//!
//! A session is a transaction scope owned by exactly one thread at a time:
//!
//! - **Sends are staged**: messages handed to a producer become visible to
//!   consumers only when the owning session commits. Rollback discards them.
//! - **Receives are in flight**: a delivery taken by a consumer stays bound
//!   to the session until it is settled. Commit settles it as consumed,
//!   rollback returns it to its address for redelivery.
//! - **Acknowledgement settles leftovers**: acknowledging a delivery that was
//!   not yet settled by commit/rollback consumes it. Acknowledging an already
//!   settled delivery is a no-op, so callers may always acknowledge.
//!
//! Redelivery is at-least-once. Consumers must tolerate duplicates; the job
//! manager does so by reloading authoritative state for every message.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::filter::MessageFilter;

/// A message as carried by the transport: an opaque body plus string
/// properties that filters can select on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    body: String,
    properties: BTreeMap<String, String>,
}

impl TransportMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }
}

/// Transport-level failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("session is closed")]
    Closed,

    #[error("invalid address: '{0}'")]
    InvalidAddress(String),

    #[error("invalid message filter: {0}")]
    InvalidFilter(String),

    /// Internal lock poisoning.
    #[error("transport state poisoned")]
    Poisoned,

    #[error("broker error: {0}")]
    Broker(String),
}

/// Connection-level entry point of a broker.
///
/// Implementations must be shareable across threads; every thread opens its
/// own session.
pub trait MessageTransport: Send + Sync {
    fn open_session(&self) -> Result<Box<dyn TransportSession>, TransportError>;
}

impl<T> MessageTransport for Arc<T>
where
    T: MessageTransport + ?Sized,
{
    fn open_session(&self) -> Result<Box<dyn TransportSession>, TransportError> {
        (**self).open_session()
    }
}

/// A transactional session. Not shared between threads.
pub trait TransportSession: Send {
    fn create_producer(&mut self, address: &str) -> Result<Box<dyn MessageProducer>, TransportError>;

    fn create_consumer(
        &mut self,
        address: &str,
        filter: Option<MessageFilter>,
    ) -> Result<Box<dyn MessageConsumer>, TransportError>;

    /// Publish staged sends and consume in-flight deliveries.
    fn commit(&mut self) -> Result<(), TransportError>;

    /// Discard staged sends and return in-flight deliveries for redelivery.
    fn rollback(&mut self) -> Result<(), TransportError>;

    /// Roll back anything outstanding and release the session.
    fn close(&mut self) -> Result<(), TransportError>;

    fn is_closed(&self) -> bool;
}

/// Sends messages to one address within its session's transaction.
pub trait MessageProducer: Send {
    fn address(&self) -> &str;

    fn send(&mut self, message: TransportMessage) -> Result<(), TransportError>;
}

/// Receives messages from one address within its session's transaction.
pub trait MessageConsumer: Send {
    /// Block for up to `timeout` waiting for a matching message.
    fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>, TransportError>;
}

/// Settles a single delivery on behalf of its session.
pub trait DeliveryAck: Send {
    fn acknowledge(self: Box<Self>) -> Result<(), TransportError>;
}

/// A received message together with its acknowledgement handle.
pub struct Delivery {
    message: TransportMessage,
    delivery_count: u32,
    ack: Box<dyn DeliveryAck>,
}

impl Delivery {
    pub fn new(message: TransportMessage, delivery_count: u32, ack: Box<dyn DeliveryAck>) -> Self {
        Self {
            message,
            delivery_count,
            ack,
        }
    }

    pub fn message(&self) -> &TransportMessage {
        &self.message
    }

    /// How many times this message has been handed out, including this one.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn acknowledge(self) -> Result<(), TransportError> {
        self.ack.acknowledge()
    }
}

impl core::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("delivery_count", &self.delivery_count)
            .finish_non_exhaustive()
    }
}
