//! Publishes job correlation messages.
//!
//! Every calling thread gets its own transport session and producer, created
//! on first use. A thread's session stays open for the thread's lifetime and
//! is closed by the next publish (from any thread) after the owner exits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};

use thiserror::Error;
use tracing::{debug, warn};

use jobforge_events::{MessageProducer, MessageTransport, TransportError, TransportMessage, TransportSession};

use super::message::{JOB_KEY_PROPERTY, JobMessage};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("unable to serialize job message: {0}")]
    Serialization(String),

    #[error("invalid dispatcher configuration: {0}")]
    Configuration(String),
}

/// Sends job messages on behalf of the calling thread.
///
/// Outside a unit of work every posted message is committed immediately.
/// Inside one, messages stay staged until the caller commits or rolls back.
pub trait JobDispatcher: Send + Sync {
    fn post_message(&self, message: &JobMessage) -> Result<(), DispatchError>;

    /// Commit the calling thread's session.
    fn commit(&self) -> Result<(), DispatchError>;

    /// Roll back the calling thread's session.
    fn rollback(&self) -> Result<(), DispatchError>;

    fn begin_unit_of_work(&self);

    fn end_unit_of_work(&self);
}

impl<D> JobDispatcher for Arc<D>
where
    D: JobDispatcher + ?Sized,
{
    fn post_message(&self, message: &JobMessage) -> Result<(), DispatchError> {
        (**self).post_message(message)
    }

    fn commit(&self) -> Result<(), DispatchError> {
        (**self).commit()
    }

    fn rollback(&self) -> Result<(), DispatchError> {
        (**self).rollback()
    }

    fn begin_unit_of_work(&self) {
        (**self).begin_unit_of_work()
    }

    fn end_unit_of_work(&self) {
        (**self).end_unit_of_work()
    }
}

/// Scope guard for a unit of work on the current thread.
///
/// Dropping an unresolved unit of work rolls it back.
#[must_use = "dropping a unit of work immediately rolls it back"]
pub struct UnitOfWork<'a> {
    dispatcher: &'a dyn JobDispatcher,
    resolved: bool,
}

impl<'a> UnitOfWork<'a> {
    pub fn begin(dispatcher: &'a dyn JobDispatcher) -> Self {
        dispatcher.begin_unit_of_work();
        Self {
            dispatcher,
            resolved: false,
        }
    }

    pub fn commit(mut self) -> Result<(), DispatchError> {
        self.resolved = true;
        self.dispatcher.commit()
    }

    pub fn rollback(mut self) -> Result<(), DispatchError> {
        self.resolved = true;
        self.dispatcher.rollback()
    }
}

impl Drop for UnitOfWork<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            if let Err(err) = self.dispatcher.rollback() {
                warn!(error = %err, "failed to roll back abandoned unit of work");
            }
        }
        self.dispatcher.end_unit_of_work();
    }
}

thread_local! {
    static THREAD_TOKEN: Arc<()> = Arc::new(());
}

fn thread_token() -> Weak<()> {
    THREAD_TOKEN.with(Arc::downgrade)
}

struct ThreadSession {
    session: Box<dyn TransportSession>,
    producer: Box<dyn MessageProducer>,
}

struct ThreadState {
    alive: Weak<()>,
    depth: usize,
    session: Option<ThreadSession>,
}

/// Dispatcher backed by a [`MessageTransport`].
pub struct TransportJobDispatcher {
    transport: Arc<dyn MessageTransport>,
    address: String,
    threads: Mutex<HashMap<ThreadId, ThreadState>>,
}

impl TransportJobDispatcher {
    pub fn new(transport: Arc<dyn MessageTransport>, address: impl Into<String>) -> Result<Self, DispatchError> {
        let address = address.into();
        if address.trim().is_empty() {
            return Err(DispatchError::Configuration("publish address must not be blank".to_string()));
        }

        Ok(Self {
            transport,
            address,
            threads: Mutex::new(HashMap::new()),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Threads currently holding an open session.
    pub fn session_count(&self) -> usize {
        self.lock().values().filter(|t| t.session.is_some()).count()
    }

    /// Close every session, whatever thread owns it. Staged sends are lost.
    pub fn close_all(&self) {
        let sessions: Vec<ThreadSession> = self
            .lock()
            .drain()
            .filter_map(|(_, state)| state.session)
            .collect();

        for session in sessions {
            close_session(session);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ThreadId, ThreadState>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_unit_of_work(&self) -> bool {
        self.lock()
            .get(&thread::current().id())
            .is_some_and(|t| t.depth > 0)
    }

    fn reap_dead_threads(&self) {
        let dead: Vec<ThreadSession> = {
            let mut threads = self.lock();
            let ids: Vec<ThreadId> = threads
                .iter()
                .filter(|(_, state)| state.alive.strong_count() == 0)
                .map(|(id, _)| *id)
                .collect();

            ids.into_iter()
                .filter_map(|id| threads.remove(&id).and_then(|state| state.session))
                .collect()
        };

        if !dead.is_empty() {
            debug!(sessions = dead.len(), "closing sessions of exited threads");
        }
        for session in dead {
            close_session(session);
        }
    }

    /// Take the current thread's session out of the table, opening one if needed.
    fn checkout(&self) -> Result<ThreadSession, DispatchError> {
        let existing = self
            .lock()
            .get_mut(&thread::current().id())
            .and_then(|state| state.session.take());

        match existing {
            Some(session) if !session.session.is_closed() => Ok(session),
            _ => {
                let mut session = self.transport.open_session()?;
                let producer = session.create_producer(&self.address)?;
                debug!(address = %self.address, "opened dispatcher session");
                Ok(ThreadSession { session, producer })
            }
        }
    }

    fn checkin(&self, session: ThreadSession) {
        let mut threads = self.lock();
        let state = threads.entry(thread::current().id()).or_insert_with(|| ThreadState {
            alive: thread_token(),
            depth: 0,
            session: None,
        });
        state.session = Some(session);
    }

    fn with_existing_session<F>(&self, op: F) -> Result<(), DispatchError>
    where
        F: FnOnce(&mut dyn TransportSession) -> Result<(), TransportError>,
    {
        let existing = self
            .lock()
            .get_mut(&thread::current().id())
            .and_then(|state| state.session.take());

        let Some(mut session) = existing else {
            return Ok(());
        };

        let result = op(session.session.as_mut());
        self.checkin(session);
        result.map_err(DispatchError::from)
    }
}

fn close_session(mut session: ThreadSession) {
    if let Err(err) = session.session.close() {
        warn!(error = %err, "failed to close dispatcher session");
    }
}

impl JobDispatcher for TransportJobDispatcher {
    fn post_message(&self, message: &JobMessage) -> Result<(), DispatchError> {
        let body = message
            .to_json()
            .map_err(|e| DispatchError::Serialization(e.to_string()))?;
        let outbound = TransportMessage::new(body).with_property(JOB_KEY_PROPERTY, message.job_key());

        self.reap_dead_threads();

        let auto_commit = !self.in_unit_of_work();
        let mut session = self.checkout()?;

        let mut result = session.producer.send(outbound);
        if auto_commit {
            result = result.and_then(|_| session.session.commit());
            if result.is_err() {
                if let Err(err) = session.session.rollback() {
                    warn!(error = %err, "rollback after failed publish also failed");
                }
            }
        }
        self.checkin(session);
        result?;

        debug!(
            job_id = %message.job_id(),
            job_key = %message.job_key(),
            address = %self.address,
            staged = !auto_commit,
            "job message posted"
        );
        Ok(())
    }

    fn commit(&self) -> Result<(), DispatchError> {
        self.with_existing_session(|session| session.commit())
    }

    fn rollback(&self) -> Result<(), DispatchError> {
        self.with_existing_session(|session| session.rollback())
    }

    fn begin_unit_of_work(&self) {
        let mut threads = self.lock();
        let state = threads.entry(thread::current().id()).or_insert_with(|| ThreadState {
            alive: thread_token(),
            depth: 0,
            session: None,
        });
        state.depth += 1;
    }

    fn end_unit_of_work(&self) {
        if let Some(state) = self.lock().get_mut(&thread::current().id()) {
            state.depth = state.depth.saturating_sub(1);
        }
    }
}

impl Drop for TransportJobDispatcher {
    fn drop(&mut self) {
        self.close_all();
    }
}

impl core::fmt::Debug for TransportJobDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TransportJobDispatcher")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
