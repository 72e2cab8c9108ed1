//! Consumer threads feeding job messages to the job manager.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use jobforge_events::{Delivery, MessageConsumer, MessageFilter, MessageTransport, TransportSession};

use super::dispatcher::{JobDispatcher, UnitOfWork};
use super::error::JobError;
use super::message::JobMessage;
use super::status::JobStatus;

/// Executes the job a message refers to.
pub trait JobMessageHandler: Send + Sync {
    fn execute_job(&self, message: &JobMessage) -> Result<JobStatus, JobError>;
}

/// What to do with the transport transaction after a message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The outcome is final; consume the message and publish staged sends.
    Commit,
    /// Redeliver the message and discard staged sends.
    Rollback,
}

impl Disposition {
    /// A failed job body always commits: either the job is finished with, or
    /// the manager staged a fresh retry message that goes out with the commit
    /// while the original is consumed.
    pub fn for_result<T>(result: &Result<T, JobError>) -> Self {
        match result {
            Ok(_) => Disposition::Commit,
            Err(JobError::Execution(_)) => Disposition::Commit,
            Err(err) if err.is_terminal() => Disposition::Commit,
            Err(_) => Disposition::Rollback,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub address: String,
    pub filter: Option<String>,
    pub threads: usize,
}

impl ReceiverConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            filter: None,
            threads: 1,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }
}

/// Receiver runtime statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReceiverStats {
    pub received: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub malformed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    malformed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ReceiverStats {
        ReceiverStats {
            received: self.received.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    active: AtomicBool,
    shutdown: AtomicBool,
    counters: Counters,
}

/// Pool of consumer threads, each with its own transport session.
pub struct JobMessageReceiver {
    transport: Arc<dyn MessageTransport>,
    address: String,
    filter: Option<MessageFilter>,
    threads: usize,
    tick: Duration,
    shared: Arc<Shared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl JobMessageReceiver {
    pub fn new(transport: Arc<dyn MessageTransport>, config: ReceiverConfig) -> Result<Self, JobError> {
        if config.address.trim().is_empty() {
            return Err(JobError::Configuration("consume address must not be blank".to_string()));
        }

        let filter = config
            .filter
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(MessageFilter::parse)
            .transpose()
            .map_err(|e| JobError::Configuration(e.to_string()))?;

        Ok(Self {
            transport,
            address: config.address,
            filter,
            threads: config.threads.max(1),
            tick: Duration::from_millis(250),
            shared: Arc::new(Shared::default()),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// How long a consumer blocks per poll. Also bounds suspend/shutdown latency.
    pub fn with_poll_interval(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ReceiverStats {
        self.shared.counters.snapshot()
    }

    /// Start consuming. The first call spawns the consumer threads; later
    /// calls resume them after a `suspend`.
    pub fn start(
        &self,
        handler: Weak<dyn JobMessageHandler>,
        dispatcher: Arc<dyn JobDispatcher>,
    ) -> Result<(), JobError> {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(JobError::illegal_state("receiver has been shut down"));
        }

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if workers.is_empty() {
            for index in 0..self.threads {
                let mut session = self.transport.open_session().map_err(|e| {
                    JobError::Configuration(format!("unable to open consumer session: {e}"))
                })?;
                let consumer = session
                    .create_consumer(&self.address, self.filter.clone())
                    .map_err(|e| JobError::Configuration(format!("unable to create consumer: {e}")))?;

                let worker = ConsumerWorker {
                    name: format!("job-receiver-{index}"),
                    session,
                    consumer,
                    handler: handler.clone(),
                    dispatcher: dispatcher.clone(),
                    shared: self.shared.clone(),
                    tick: self.tick,
                };

                let join = thread::Builder::new()
                    .name(worker.name.clone())
                    .spawn(move || worker.run())
                    .map_err(|e| JobError::Configuration(format!("unable to spawn receiver thread: {e}")))?;
                workers.push(join);
            }
            info!(address = %self.address, threads = self.threads, "job receiver started");
        } else {
            info!(address = %self.address, "job receiver resumed");
        }

        self.shared.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop taking new messages. In-flight messages finish normally.
    pub fn suspend(&self) {
        if self.shared.active.swap(false, Ordering::SeqCst) {
            info!(address = %self.address, "job receiver suspended");
        }
    }

    /// Stop and join every consumer thread.
    pub fn shutdown(&self) {
        self.shared.active.store(false, Ordering::SeqCst);
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for join in workers {
            // The last owner may be dropped on one of our own consumer threads.
            if join.thread().id() == thread::current().id() {
                continue;
            }
            if join.join().is_err() {
                error!(address = %self.address, "job receiver thread panicked");
            }
        }
        info!(address = %self.address, "job receiver shut down");
    }
}

impl Drop for JobMessageReceiver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl core::fmt::Debug for JobMessageReceiver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobMessageReceiver")
            .field("address", &self.address)
            .field("filter", &self.filter)
            .field("threads", &self.threads)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

struct ConsumerWorker {
    name: String,
    session: Box<dyn TransportSession>,
    consumer: Box<dyn MessageConsumer>,
    handler: Weak<dyn JobMessageHandler>,
    dispatcher: Arc<dyn JobDispatcher>,
    shared: Arc<Shared>,
    tick: Duration,
}

impl ConsumerWorker {
    fn run(mut self) {
        loop {
            if self.shared.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if !self.shared.active.load(Ordering::SeqCst) {
                thread::sleep(self.tick);
                continue;
            }

            match self.consumer.receive(self.tick) {
                Ok(Some(delivery)) => {
                    if !self.process(delivery) {
                        break;
                    }
                }
                Ok(None) => continue,
                Err(err) => {
                    error!(worker = %self.name, error = %err, "job receiver lost its session");
                    break;
                }
            }
        }

        if let Err(err) = self.session.close() {
            warn!(worker = %self.name, error = %err, "failed to close consumer session");
        }
        debug!(worker = %self.name, "job receiver thread stopped");
    }

    /// Handle one delivery. Returns false when the worker should stop.
    fn process(&mut self, delivery: Delivery) -> bool {
        self.shared.counters.received.fetch_add(1, Ordering::Relaxed);

        let message = match JobMessage::from_json(delivery.message().body()) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    worker = %self.name,
                    deliveries = delivery.delivery_count(),
                    error = %err,
                    "unable to parse job message; rolling back"
                );
                self.shared.counters.malformed.fetch_add(1, Ordering::Relaxed);
                self.settle(Disposition::Rollback);
                acknowledge(&self.name, delivery);
                return true;
            }
        };

        let Some(handler) = self.handler.upgrade() else {
            warn!(worker = %self.name, job_id = %message.job_id(), "job manager is gone; returning message");
            self.settle(Disposition::Rollback);
            acknowledge(&self.name, delivery);
            return false;
        };

        let uow = UnitOfWork::begin(self.dispatcher.as_ref());
        let result = handler.execute_job(&message);
        let mut disposition = Disposition::for_result(&result);

        match &result {
            Ok(status) => debug!(
                worker = %self.name,
                job_id = %message.job_id(),
                state = %status.state(),
                "job message handled"
            ),
            Err(err) => warn!(
                worker = %self.name,
                job_id = %message.job_id(),
                job_key = %message.job_key(),
                error = %err,
                terminal = err.is_terminal(),
                "job message handled with error"
            ),
        }

        match disposition {
            Disposition::Commit => {
                if let Err(err) = uow.commit() {
                    error!(worker = %self.name, error = %err, "unable to commit dispatcher session; rolling back message");
                    disposition = Disposition::Rollback;
                }
            }
            Disposition::Rollback => {
                if let Err(err) = uow.rollback() {
                    error!(worker = %self.name, error = %err, "unable to roll back dispatcher session");
                }
            }
        }

        self.settle(disposition);
        acknowledge(&self.name, delivery);
        true
    }

    fn settle(&mut self, disposition: Disposition) {
        let counters = &self.shared.counters;
        let result = match disposition {
            Disposition::Commit => {
                counters.committed.fetch_add(1, Ordering::Relaxed);
                self.session.commit()
            }
            Disposition::Rollback => {
                counters.rolled_back.fetch_add(1, Ordering::Relaxed);
                self.session.rollback()
            }
        };

        if let Err(err) = result {
            error!(worker = %self.name, ?disposition, error = %err, "unable to settle consumer session");
        }
    }
}

fn acknowledge(worker: &str, delivery: Delivery) {
    if let Err(err) = delivery.acknowledge() {
        warn!(worker = %worker, error = %err, "unable to acknowledge job message");
    }
}
