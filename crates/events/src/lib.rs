//! `jobforge-events` — messaging transport and domain-event sink.
//!
//! - [`transport`]: broker contract (sessions, producers, consumers)
//! - [`in_memory_broker`]: transactional in-process broker for tests/dev
//! - [`filter`]: property selectors for consumers
//! - [`sink`]: per-thread buffered event sink used by job bodies

pub mod filter;
pub mod in_memory_broker;
pub mod sink;
pub mod transport;

pub use filter::MessageFilter;
pub use in_memory_broker::{InMemoryBroker, DEAD_LETTER_SUFFIX, DEFAULT_MAX_DELIVERY_ATTEMPTS};
pub use sink::{EventSink, EventSinkError, InMemoryEventSink, JobEvent, Subscription};
pub use transport::{
    Delivery, DeliveryAck, MessageConsumer, MessageProducer, MessageTransport, TransportError,
    TransportMessage, TransportSession,
};
