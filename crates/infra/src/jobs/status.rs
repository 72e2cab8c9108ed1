//! Durable job status record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobforge_core::{DomainError, JobId, JobState, OwnerId};

use super::message::JobMessage;

/// The organization a job runs on behalf of.
///
/// Only used to enrich the logging context and to scope access checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerContext {
    pub id: OwnerId,
    pub key: String,
    /// Log level applied to jobs of this owner unless the job overrides it.
    pub log_level: Option<String>,
}

impl OwnerContext {
    pub fn new(id: OwnerId, key: impl Into<String>) -> Self {
        Self {
            id,
            key: key.into(),
            log_level: None,
        }
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }
}

/// State of one job across all of its attempts.
///
/// The identifier is fixed at construction. Persisted copies carry a
/// `version` that the curator bumps on every write; writing a stale copy is
/// rejected as a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    id: JobId,
    job_key: String,
    name: Option<String>,
    state: JobState,
    previous_state: Option<JobState>,
    attempts: u32,
    max_attempts: u32,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    origin: Option<String>,
    executor: Option<String>,
    arguments: BTreeMap<String, String>,
    owner: Option<OwnerContext>,
    log_level: Option<String>,
    principal: Option<String>,
    result: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: u64,
}

impl JobStatus {
    pub fn new(job_key: impl Into<String>) -> Self {
        Self::with_id(JobId::new(), job_key)
    }

    pub fn with_id(id: JobId, job_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            job_key: job_key.into(),
            name: None,
            state: JobState::Created,
            previous_state: None,
            attempts: 0,
            max_attempts: 1,
            start_time: None,
            end_time: None,
            origin: None,
            executor: None,
            arguments: BTreeMap::new(),
            owner: None,
            log_level: None,
            principal: None,
            result: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    // Builders

    /// Set the state without transition checks. For seeding records only.
    pub fn in_state(mut self, state: JobState) -> Self {
        self.state = state;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.set_max_attempts(max_attempts);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = Some(executor.into());
        self
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    pub fn with_arguments(mut self, arguments: BTreeMap<String, String>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_owner(mut self, owner: OwnerContext) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    // Accessors

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn job_key(&self) -> &str {
        &self.job_key
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn previous_state(&self) -> Option<JobState> {
        self.previous_state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    pub fn executor(&self) -> Option<&str> {
        self.executor.as_deref()
    }

    pub fn arguments(&self) -> &BTreeMap<String, String> {
        &self.arguments
    }

    pub fn argument(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).map(String::as_str)
    }

    pub fn owner(&self) -> Option<&OwnerContext> {
        self.owner.as_ref()
    }

    pub fn owner_id(&self) -> Option<OwnerId> {
        self.owner.as_ref().map(|o| o.id)
    }

    pub fn log_level(&self) -> Option<&str> {
        self.log_level.as_deref()
    }

    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The correlation message referring to this job.
    pub fn message(&self) -> JobMessage {
        JobMessage::new(self.id, self.job_key.clone())
    }

    // Mutators

    /// Move to `next`, remembering the current state.
    ///
    /// Only moves listed in [`JobState::valid_transitions`] are accepted.
    pub fn transition_to(&mut self, next: JobState) -> Result<(), DomainError> {
        if !self.state.can_transition_to(next) {
            return Err(DomainError::invalid_transition(self.state, next));
        }

        self.previous_state = Some(self.state);
        self.state = next;
        Ok(())
    }

    /// Clamped to at least one attempt.
    pub fn set_max_attempts(&mut self, max_attempts: u32) {
        self.max_attempts = max_attempts.max(1);
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn increment_attempts(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    pub fn set_executor(&mut self, executor: Option<String>) {
        self.executor = executor;
    }

    pub fn set_start_time(&mut self, at: Option<DateTime<Utc>>) {
        self.start_time = at;
    }

    pub fn set_end_time(&mut self, at: Option<DateTime<Utc>>) {
        self.end_time = at;
    }

    pub fn set_result(&mut self, result: Option<String>) {
        self.result = result;
    }

    /// Record a successful write. Called by curator implementations.
    pub fn mark_persisted(&mut self, version: u64, at: DateTime<Utc>) {
        self.version = version;
        self.updated_at = at;
    }
}
