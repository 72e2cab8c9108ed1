//! Job registry: job key → factory producing executable job instances.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use jobforge_core::JobId;
use jobforge_events::{EventSink, JobEvent};

use super::error::{JobError, JobExecutionError};
use super::logging::LoggingContext;
use super::status::JobStatus;

/// Business logic of a job.
///
/// A fresh instance is created for every attempt, so implementations may
/// keep per-run state in `self`.
pub trait AsyncJob: Send {
    fn execute(&self, ctx: &mut JobExecutionContext<'_>) -> Result<(), JobExecutionError>;
}

impl<F> AsyncJob for F
where
    F: Fn(&mut JobExecutionContext<'_>) -> Result<(), JobExecutionError> + Send,
{
    fn execute(&self, ctx: &mut JobExecutionContext<'_>) -> Result<(), JobExecutionError> {
        self(ctx)
    }
}

/// What a running job can see and produce.
pub struct JobExecutionContext<'a> {
    status: &'a JobStatus,
    events: &'a dyn EventSink,
    logging: &'a LoggingContext,
    result: Option<String>,
}

impl<'a> JobExecutionContext<'a> {
    pub fn new(status: &'a JobStatus, events: &'a dyn EventSink, logging: &'a LoggingContext) -> Self {
        Self {
            status,
            events,
            logging,
            result: None,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.status.id()
    }

    pub fn job_key(&self) -> &str {
        self.status.job_key()
    }

    pub fn status(&self) -> &JobStatus {
        self.status
    }

    /// Raw (JSON-encoded) argument value.
    pub fn argument(&self, key: &str) -> Option<&str> {
        self.status.argument(key)
    }

    /// Decode an argument. `Ok(None)` when it is absent.
    pub fn argument_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, JobExecutionError> {
        self.argument(key)
            .map(|raw| {
                serde_json::from_str(raw).map_err(|e| {
                    JobExecutionError::terminal(format!("invalid value for argument '{key}': {e}"))
                })
            })
            .transpose()
    }

    /// Buffer a domain event; it is sent only if the attempt finishes.
    pub fn queue_event(&self, event: JobEvent) {
        self.events.queue(event);
    }

    /// Store the job result, serialized as JSON unless it is already a string.
    pub fn set_job_result<T: Serialize>(&mut self, result: T) -> Result<(), JobExecutionError> {
        let value = serde_json::to_value(result)
            .map_err(|e| JobExecutionError::terminal(format!("unable to serialize job result: {e}")))?;

        self.result = Some(match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });
        Ok(())
    }

    pub fn job_result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub(crate) fn into_result(self) -> Option<String> {
        self.result
    }

    pub fn logging(&self) -> &LoggingContext {
        self.logging
    }
}

/// Produces job instances for one job key.
pub trait JobFactory: Send + Sync {
    fn create(&self) -> anyhow::Result<Box<dyn AsyncJob>>;
}

impl<F> JobFactory for F
where
    F: Fn() -> anyhow::Result<Box<dyn AsyncJob>> + Send + Sync,
{
    fn create(&self) -> anyhow::Result<Box<dyn AsyncJob>> {
        self()
    }
}

/// A registry entry.
#[derive(Clone)]
pub struct JobDefinition {
    job_key: String,
    factory: Arc<dyn JobFactory>,
    schedule: Option<String>,
}

impl JobDefinition {
    pub fn new(job_key: impl Into<String>, factory: impl JobFactory + 'static) -> Self {
        Self {
            job_key: job_key.into(),
            factory: Arc::new(factory),
            schedule: None,
        }
    }

    /// Definition whose factory builds every instance with `make`.
    pub fn from_fn<J, M>(job_key: impl Into<String>, make: M) -> Self
    where
        J: AsyncJob + 'static,
        M: Fn() -> J + Send + Sync + 'static,
    {
        Self::new(job_key, move || -> anyhow::Result<Box<dyn AsyncJob>> { Ok(Box::new(make())) })
    }

    /// Default cron schedule, used unless configuration overrides it.
    pub fn with_schedule(mut self, cron: impl Into<String>) -> Self {
        self.schedule = Some(cron.into());
        self
    }

    pub fn job_key(&self) -> &str {
        &self.job_key
    }

    pub fn schedule(&self) -> Option<&str> {
        self.schedule.as_deref()
    }
}

impl core::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("job_key", &self.job_key)
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

/// Known job keys. Built once at startup and shared read-only.
#[derive(Debug, Default)]
pub struct JobRegistry {
    definitions: HashMap<String, JobDefinition>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: JobDefinition) -> Result<(), JobError> {
        let key = definition.job_key().trim();
        if key.is_empty() {
            return Err(JobError::Configuration("job key must not be blank".to_string()));
        }
        if self.definitions.contains_key(key) {
            return Err(JobError::Configuration(format!("job key already registered: {key}")));
        }

        self.definitions.insert(key.to_string(), definition);
        Ok(())
    }

    pub fn contains(&self, job_key: &str) -> bool {
        self.definitions.contains_key(job_key)
    }

    pub fn get(&self, job_key: &str) -> Option<&JobDefinition> {
        self.definitions.get(job_key)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn definitions(&self) -> impl Iterator<Item = &JobDefinition> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn instantiate(&self, job_key: &str) -> Result<Box<dyn AsyncJob>, JobError> {
        let definition = self.definitions.get(job_key).ok_or_else(|| {
            JobError::initialization(None, format!("Unable to instantiate job '{job_key}': not registered"))
        })?;

        definition
            .factory
            .create()
            .map_err(|e| JobError::initialization(None, format!("Unable to instantiate job '{job_key}': {e:#}")))
    }
}
