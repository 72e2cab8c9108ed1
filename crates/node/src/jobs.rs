//! Jobs bundled with the node.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{Level, info};

use jobforge_core::JobState;
use jobforge_events::JobEvent;
use jobforge_infra::jobs::{
    AsyncJob, JobCurator, JobDefinition, JobError, JobExecutionContext, JobExecutionError, JobRegistry, QueryArgs,
};

pub const HEARTBEAT: &str = "heartbeat";
pub const JOB_CLEANER: &str = "job_cleaner";

/// Terminal jobs older than this are removed by the cleaner.
pub const DEFAULT_MAX_AGE_DAYS: i64 = 7;

/// Records that the node is alive.
pub struct HeartbeatJob {
    node: String,
}

impl AsyncJob for HeartbeatJob {
    fn execute(&self, ctx: &mut JobExecutionContext<'_>) -> Result<(), JobExecutionError> {
        // Runs every minute; a job or owner log level above INFO silences it.
        if ctx.logging().allows(Level::INFO) {
            info!(node = %self.node, "heartbeat");
        }
        ctx.queue_event(JobEvent::new(
            "node.heartbeat",
            serde_json::json!({ "node": self.node, "at": Utc::now() }),
        ));
        ctx.set_job_result(format!("{} is alive", self.node))
    }
}

/// Deletes terminal jobs that have not changed for a while.
///
/// The age can be overridden with a `max_age_days` argument.
pub struct JobCleaner {
    curator: Arc<dyn JobCurator>,
}

impl AsyncJob for JobCleaner {
    fn execute(&self, ctx: &mut JobExecutionContext<'_>) -> Result<(), JobExecutionError> {
        let days = ctx.argument_as::<i64>("max_age_days")?.unwrap_or(DEFAULT_MAX_AGE_DAYS);
        if days < 0 {
            return Err(JobExecutionError::terminal(format!("max_age_days must not be negative: {days}")));
        }

        let cutoff = Utc::now() - Duration::days(days);
        let args = QueryArgs::new()
            .with_states(JobState::terminal_states())
            .with_end_date(cutoff);

        let deleted = self
            .curator
            .delete_jobs(&args)
            .map_err(|e| JobExecutionError::retryable(e.to_string()))?;

        info!(deleted, %cutoff, "removed old terminal jobs");
        ctx.set_job_result(serde_json::json!({ "deleted": deleted }))
    }
}

pub fn registry(node: &str, curator: Arc<dyn JobCurator>) -> Result<JobRegistry, JobError> {
    let mut registry = JobRegistry::new();

    let node = node.to_string();
    registry.register(
        JobDefinition::from_fn(HEARTBEAT, move || HeartbeatJob { node: node.clone() })
            .with_schedule("0 * * * * *"),
    )?;
    registry.register(
        JobDefinition::from_fn(JOB_CLEANER, move || JobCleaner {
            curator: curator.clone(),
        })
        .with_schedule("0 0 3 * * *"),
    )?;

    Ok(registry)
}
