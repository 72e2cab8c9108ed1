//! Per-execution logging context.

use tracing::{Level, Span, field, info_span};

use jobforge_core::JobId;

use super::status::JobStatus;

/// Fields attached to every log line emitted while a job runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingContext {
    job_id: JobId,
    job_key: String,
    log_level: Option<String>,
    owner_key: Option<String>,
}

impl LoggingContext {
    /// Resolve the context for `status`.
    ///
    /// The log level comes from the job's own override, then from its owner,
    /// then from `default_level`.
    pub fn resolve(status: &JobStatus, default_level: Option<&str>) -> Self {
        let owner = status.owner();
        let log_level = status
            .log_level()
            .or_else(|| owner.and_then(|o| o.log_level.as_deref()))
            .or(default_level)
            .map(str::to_string);

        Self {
            job_id: status.id(),
            job_key: status.job_key().to_string(),
            log_level,
            owner_key: owner.map(|o| o.key.clone()),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_key(&self) -> &str {
        &self.job_key
    }

    pub fn log_level(&self) -> Option<&str> {
        self.log_level.as_deref()
    }

    pub fn owner_key(&self) -> Option<&str> {
        self.owner_key.as_deref()
    }

    /// The resolved level, if it names a valid tracing level.
    pub fn level(&self) -> Option<Level> {
        self.log_level.as_deref().and_then(|l| l.trim().parse().ok())
    }

    /// Whether a body should emit output at `level` for this job.
    /// Without a resolved level everything is allowed; the subscriber filter decides.
    pub fn allows(&self, level: Level) -> bool {
        self.level().is_none_or(|max| level <= max)
    }

    pub fn span(&self) -> Span {
        let span = info_span!(
            "job",
            request_type = "job",
            job_id = %self.job_id,
            job_key = %self.job_key,
            log_level = field::Empty,
            owner_key = field::Empty,
        );

        if let Some(level) = &self.log_level {
            span.record("log_level", level.as_str());
        }
        if let Some(owner) = &self.owner_key {
            span.record("owner_key", owner.as_str());
        }
        span
    }
}
