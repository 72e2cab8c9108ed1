//! Queue request builder.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use jobforge_auth::Principal;

use super::constraint::JobConstraint;
use super::error::JobError;
use super::status::{JobStatus, OwnerContext};

/// Everything needed to queue one job.
#[derive(Clone, Default)]
pub struct JobConfig {
    job_key: String,
    job_name: Option<String>,
    arguments: BTreeMap<String, String>,
    constraints: Vec<Arc<dyn JobConstraint>>,
    retry_count: u32,
    owner: Option<OwnerContext>,
    log_level: Option<String>,
    principal: Option<String>,
}

impl JobConfig {
    pub fn for_job(job_key: impl Into<String>) -> Self {
        Self {
            job_key: job_key.into(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.job_name = Some(name.into());
        self
    }

    /// Add an argument. Values are stored JSON-encoded.
    pub fn with_argument<T: Serialize>(mut self, key: impl Into<String>, value: T) -> Result<Self, JobError> {
        let key = key.into();
        let encoded = serde_json::to_string(&value)
            .map_err(|e| JobError::Configuration(format!("argument '{key}' is not serializable: {e}")))?;

        self.arguments.insert(key, encoded);
        Ok(self)
    }

    /// Add an argument whose value is already encoded.
    pub fn with_raw_argument(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    pub fn with_constraint(mut self, constraint: impl JobConstraint + 'static) -> Self {
        self.constraints.push(Arc::new(constraint));
        self
    }

    /// Retries after the first attempt; max attempts is this plus one.
    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = retries;
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

    pub fn on_behalf_of(mut self, principal: &Principal) -> Self {
        self.principal = Some(principal.name().to_string());
        self
    }

    pub fn with_principal_name(mut self, name: impl Into<String>) -> Self {
        self.principal = Some(name.into());
        self
    }

    pub fn job_key(&self) -> &str {
        &self.job_key
    }

    pub fn job_name(&self) -> Option<&str> {
        self.job_name.as_deref()
    }

    pub fn arguments(&self) -> &BTreeMap<String, String> {
        &self.arguments
    }

    pub fn constraints(&self) -> &[Arc<dyn JobConstraint>] {
        &self.constraints
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    pub fn validate(&self) -> Result<(), JobError> {
        if self.job_key.trim().is_empty() {
            return Err(JobError::Configuration("job key must not be blank".to_string()));
        }
        Ok(())
    }

    /// A CREATED status for this request, originating on `origin`.
    pub fn to_status(&self, origin: &str) -> JobStatus {
        let mut status = JobStatus::new(self.job_key.trim())
            .with_origin(origin)
            .with_max_attempts(self.max_attempts())
            .with_arguments(self.arguments.clone());

        if let Some(name) = &self.job_name {
            status = status.with_name(name.clone());
        }
        if let Some(owner) = &self.owner {
            status = status.with_owner(owner.clone());
        }
        if let Some(level) = &self.log_level {
            status = status.with_log_level(level.clone());
        }
        if let Some(principal) = &self.principal {
            status = status.with_principal(principal.clone());
        }
        status
    }
}

impl core::fmt::Debug for JobConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobConfig")
            .field("job_key", &self.job_key)
            .field("job_name", &self.job_name)
            .field("arguments", &self.arguments)
            .field("constraints", &self.constraints.len())
            .field("retry_count", &self.retry_count)
            .field("owner", &self.owner)
            .field("log_level", &self.log_level)
            .field("principal", &self.principal)
            .finish()
    }
}
