//! In-memory message broker for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::filter::MessageFilter;
use crate::transport::{
    Delivery, DeliveryAck, MessageConsumer, MessageProducer, MessageTransport, TransportError,
    TransportMessage, TransportSession,
};

/// Deliveries after which a rolled-back message is dead-lettered.
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// Suffix of the address rolled-back messages land on once exhausted.
pub const DEAD_LETTER_SUFFIX: &str = ".dlq";

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    message: TransportMessage,
    delivery_count: u32,
}

#[derive(Debug)]
struct InFlight {
    address: String,
    stored: StoredMessage,
}

#[derive(Debug, Default)]
struct SessionState {
    staged: Vec<(String, TransportMessage)>,
    in_flight: Vec<InFlight>,
    closed: bool,
}

#[derive(Debug)]
struct BrokerInner {
    queues: Mutex<HashMap<String, VecDeque<StoredMessage>>>,
    available: Condvar,
    next_id: AtomicU64,
    open_sessions: AtomicUsize,
    max_delivery_attempts: u32,
}

impl BrokerInner {
    fn queues(&self) -> Result<MutexGuard<'_, HashMap<String, VecDeque<StoredMessage>>>, TransportError> {
        self.queues.lock().map_err(|_| TransportError::Poisoned)
    }

    fn settle(&self, state: &mut SessionState, commit: bool) -> Result<(), TransportError> {
        let staged = std::mem::take(&mut state.staged);
        let in_flight = std::mem::take(&mut state.in_flight);

        if staged.is_empty() && in_flight.is_empty() {
            return Ok(());
        }

        let mut queues = self.queues()?;

        if commit {
            for (address, message) in staged {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                queues.entry(address).or_default().push_back(StoredMessage {
                    id,
                    message,
                    delivery_count: 0,
                });
            }
        } else {
            // Returned in reverse so the oldest delivery ends up at the front.
            for entry in in_flight.into_iter().rev() {
                if entry.stored.delivery_count >= self.max_delivery_attempts {
                    warn!(
                        address = %entry.address,
                        deliveries = entry.stored.delivery_count,
                        "message exceeded max delivery attempts; dead-lettering"
                    );
                    queues
                        .entry(format!("{}{}", entry.address, DEAD_LETTER_SUFFIX))
                        .or_default()
                        .push_back(entry.stored);
                } else {
                    queues.entry(entry.address).or_default().push_front(entry.stored);
                }
            }
        }

        drop(queues);
        self.available.notify_all();
        Ok(())
    }
}

/// In-memory point-to-point broker.
///
/// - No IO / no async
/// - Each address is a FIFO queue with competing consumers
/// - Transactional sessions (see [`crate::transport`] for the semantics)
/// - Rolled-back messages are redelivered until `max_delivery_attempts`,
///   then moved to `<address>.dlq`
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_max_delivery_attempts(DEFAULT_MAX_DELIVERY_ATTEMPTS)
    }

    pub fn with_max_delivery_attempts(max_delivery_attempts: u32) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                queues: Mutex::new(HashMap::new()),
                available: Condvar::new(),
                next_id: AtomicU64::new(1),
                open_sessions: AtomicUsize::new(0),
                max_delivery_attempts: max_delivery_attempts.max(1),
            }),
        }
    }

    /// Number of committed messages waiting on `address`.
    pub fn depth(&self, address: &str) -> usize {
        self.inner
            .queues
            .lock()
            .map(|q| q.get(address).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    /// Snapshot of committed messages waiting on `address`, oldest first.
    pub fn peek_all(&self, address: &str) -> Vec<TransportMessage> {
        self.inner
            .queues
            .lock()
            .map(|q| {
                q.get(address)
                    .map(|queue| queue.iter().map(|m| m.message.clone()).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Remove and return every committed message waiting on `address`.
    pub fn drain(&self, address: &str) -> Vec<TransportMessage> {
        self.inner
            .queues
            .lock()
            .map(|mut q| {
                q.get_mut(address)
                    .map(|queue| queue.drain(..).map(|m| m.message).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn dead_letters(&self, address: &str) -> Vec<TransportMessage> {
        self.peek_all(&format!("{address}{DEAD_LETTER_SUFFIX}"))
    }

    /// Sessions opened and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.inner.open_sessions.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageTransport for InMemoryBroker {
    fn open_session(&self) -> Result<Box<dyn TransportSession>, TransportError> {
        self.inner.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemorySession {
            broker: self.inner.clone(),
            state: Arc::new(Mutex::new(SessionState::default())),
        }))
    }
}

struct InMemorySession {
    broker: Arc<BrokerInner>,
    state: Arc<Mutex<SessionState>>,
}

impl InMemorySession {
    fn state(&self) -> Result<MutexGuard<'_, SessionState>, TransportError> {
        let state = self.state.lock().map_err(|_| TransportError::Poisoned)?;
        if state.closed {
            return Err(TransportError::Closed);
        }
        Ok(state)
    }
}

fn validate_address(address: &str) -> Result<(), TransportError> {
    if address.trim().is_empty() {
        return Err(TransportError::InvalidAddress(address.to_string()));
    }
    Ok(())
}

impl TransportSession for InMemorySession {
    fn create_producer(&mut self, address: &str) -> Result<Box<dyn MessageProducer>, TransportError> {
        validate_address(address)?;
        drop(self.state()?);

        Ok(Box::new(InMemoryProducer {
            address: address.to_string(),
            state: self.state.clone(),
        }))
    }

    fn create_consumer(
        &mut self,
        address: &str,
        filter: Option<MessageFilter>,
    ) -> Result<Box<dyn MessageConsumer>, TransportError> {
        validate_address(address)?;
        drop(self.state()?);

        Ok(Box::new(InMemoryConsumer {
            address: address.to_string(),
            filter,
            broker: self.broker.clone(),
            state: self.state.clone(),
        }))
    }

    fn commit(&mut self) -> Result<(), TransportError> {
        let mut state = self.state()?;
        self.broker.settle(&mut state, true)
    }

    fn rollback(&mut self) -> Result<(), TransportError> {
        let mut state = self.state()?;
        self.broker.settle(&mut state, false)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock().map_err(|_| TransportError::Poisoned)?;
        if state.closed {
            return Ok(());
        }

        let result = self.broker.settle(&mut state, false);
        state.closed = true;
        self.broker.open_sessions.fetch_sub(1, Ordering::SeqCst);
        debug!("in-memory session closed");
        result
    }

    fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "failed to close in-memory session on drop");
        }
    }
}

struct InMemoryProducer {
    address: String,
    state: Arc<Mutex<SessionState>>,
}

impl MessageProducer for InMemoryProducer {
    fn address(&self) -> &str {
        &self.address
    }

    fn send(&mut self, message: TransportMessage) -> Result<(), TransportError> {
        let mut state = self.state.lock().map_err(|_| TransportError::Poisoned)?;
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.staged.push((self.address.clone(), message));
        Ok(())
    }
}

struct InMemoryConsumer {
    address: String,
    filter: Option<MessageFilter>,
    broker: Arc<BrokerInner>,
    state: Arc<Mutex<SessionState>>,
}

impl InMemoryConsumer {
    fn take_matching(&self, queue: &mut VecDeque<StoredMessage>) -> Option<StoredMessage> {
        let index = queue.iter().position(|stored| {
            self.filter
                .as_ref()
                .is_none_or(|filter| filter.matches(&stored.message))
        })?;
        queue.remove(index)
    }
}

impl MessageConsumer for InMemoryConsumer {
    fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>, TransportError> {
        if self.state.lock().map_err(|_| TransportError::Poisoned)?.closed {
            return Err(TransportError::Closed);
        }

        let deadline = Instant::now() + timeout;
        let mut queues = self.broker.queues()?;

        let mut stored = loop {
            if let Some(stored) = queues.get_mut(&self.address).and_then(|q| self.take_matching(q)) {
                break stored;
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let (guard, _) = self
                .broker
                .available
                .wait_timeout(queues, deadline - now)
                .map_err(|_| TransportError::Poisoned)?;
            queues = guard;
        };
        drop(queues);

        stored.delivery_count += 1;
        let id = stored.id;
        let message = stored.message.clone();
        let delivery_count = stored.delivery_count;

        let mut state = self.state.lock().map_err(|_| TransportError::Poisoned)?;
        state.in_flight.push(InFlight {
            address: self.address.clone(),
            stored,
        });
        drop(state);

        Ok(Some(Delivery::new(
            message,
            delivery_count,
            Box::new(InMemoryAck {
                id,
                state: self.state.clone(),
            }),
        )))
    }
}

struct InMemoryAck {
    id: u64,
    state: Arc<Mutex<SessionState>>,
}

impl DeliveryAck for InMemoryAck {
    fn acknowledge(self: Box<Self>) -> Result<(), TransportError> {
        let mut state = self.state.lock().map_err(|_| TransportError::Poisoned)?;
        // Settled deliveries are gone from in_flight already; nothing to do.
        state.in_flight.retain(|entry| entry.stored.id != self.id);
        Ok(())
    }
}
