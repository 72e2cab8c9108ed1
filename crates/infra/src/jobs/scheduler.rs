//! Scheduler adapter: cron triggers that queue registered jobs.

use thiserror::Error;
use tracing::{debug, info, warn};

use super::registry::JobRegistry;

/// Trigger group used for every job managed by the job manager.
pub const JOB_GROUP: &str = "cron_group";

/// Schedule value that disables cron scheduling for a job.
pub const MANUAL_SCHEDULE: &str = "manual";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("unknown scheduled job: {0}")]
    UnknownJob(String),

    #[error("scheduler is shut down")]
    ShutDown,

    #[error("scheduler error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchedulerJobKey {
    pub name: String,
    pub group: String,
}

impl SchedulerJobKey {
    pub fn for_job(job_key: &str) -> Self {
        Self {
            name: job_key.to_string(),
            group: JOB_GROUP.to_string(),
        }
    }
}

impl core::fmt::Display for SchedulerJobKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TriggerKey {
    pub name: String,
    pub group: String,
}

impl TriggerKey {
    pub fn for_job(job_key: &str) -> Self {
        Self {
            name: job_key.to_string(),
            group: JOB_GROUP.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub key: TriggerKey,
    pub cron: String,
}

/// A job known to the scheduler, with the job key it queues when fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub key: SchedulerJobKey,
    pub job_key: String,
    pub triggers: Vec<Trigger>,
}

impl ScheduledJob {
    pub fn cron(job_key: &str, cron: impl Into<String>) -> Self {
        Self {
            key: SchedulerJobKey::for_job(job_key),
            job_key: job_key.to_string(),
            triggers: vec![Trigger {
                key: TriggerKey::for_job(job_key),
                cron: cron.into(),
            }],
        }
    }
}

/// Cron scheduling backend.
pub trait JobScheduler: Send + Sync {
    /// Register (or replace) a job and its triggers.
    fn schedule_job(&self, job: ScheduledJob) -> Result<(), SchedulerError>;

    /// Remove a job and its triggers. Returns whether it existed.
    fn delete_job(&self, key: &SchedulerJobKey) -> Result<bool, SchedulerError>;

    fn unschedule_triggers(&self, keys: &[TriggerKey]) -> Result<(), SchedulerError>;

    fn job_keys(&self) -> Result<Vec<SchedulerJobKey>, SchedulerError>;

    /// Details of one job. May fail for a single key while others succeed.
    fn job_detail(&self, key: &SchedulerJobKey) -> Result<Option<ScheduledJob>, SchedulerError>;

    fn triggers_of_job(&self, key: &SchedulerJobKey) -> Result<Vec<Trigger>, SchedulerError>;

    fn start(&self) -> Result<(), SchedulerError>;

    /// Stop firing triggers without forgetting them.
    fn standby(&self) -> Result<(), SchedulerError>;

    fn shutdown(&self) -> Result<(), SchedulerError>;
}

/// The cron expression a job should run on, if any.
///
/// `override_schedule` (from configuration) wins over the registry default.
/// A `manual` schedule means the job is never triggered by cron.
pub fn effective_schedule<'a>(override_schedule: Option<&'a str>, default: Option<&'a str>) -> Option<&'a str> {
    override_schedule
        .or(default)
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case(MANUAL_SCHEDULE))
}

/// Register one trigger per registry entry that has an effective schedule.
///
/// Returns the number of jobs scheduled. A job with an invalid schedule is
/// skipped with a warning.
pub fn schedule_registered_jobs<F>(
    scheduler: &dyn JobScheduler,
    registry: &JobRegistry,
    schedule_override: F,
) -> usize
where
    F: Fn(&str) -> Option<String>,
{
    let mut scheduled = 0;

    for key in registry.keys() {
        let configured = schedule_override(key);
        let default = registry.get(key).and_then(|d| d.schedule());

        let Some(cron) = effective_schedule(configured.as_deref(), default) else {
            debug!(job_key = %key, "job has no cron schedule; not scheduling");
            continue;
        };

        match scheduler.schedule_job(ScheduledJob::cron(key, cron)) {
            Ok(()) => {
                info!(job_key = %key, schedule = %cron, "scheduled job");
                scheduled += 1;
            }
            Err(err) => warn!(job_key = %key, error = %err, "unable to schedule job"),
        }
    }

    scheduled
}

/// Remove scheduler jobs that no longer correspond to a registered job.
///
/// Never fails: every problem is logged and reconciliation moves on.
/// Returns the number of scheduler jobs removed.
pub fn reconcile_dead_triggers(scheduler: &dyn JobScheduler, registry: &JobRegistry) -> usize {
    let keys = match scheduler.job_keys() {
        Ok(keys) => keys,
        Err(err) => {
            warn!(error = %err, "unable to list scheduled jobs; skipping trigger reconciliation");
            return 0;
        }
    };

    let mut removed = 0;
    for key in keys {
        match scheduler.job_detail(&key) {
            Ok(Some(detail)) if registry.contains(&detail.job_key) => {}
            Ok(Some(detail)) => {
                info!(scheduler_job = %key, job_key = %detail.job_key, "removing trigger for unregistered job");
                if delete_logged(scheduler, &key) {
                    removed += 1;
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(scheduler_job = %key, error = %err, "unable to load scheduled job; removing it");
                if unschedule_or_delete(scheduler, &key) {
                    removed += 1;
                }
            }
        }
    }

    removed
}

fn unschedule_or_delete(scheduler: &dyn JobScheduler, key: &SchedulerJobKey) -> bool {
    let triggers = match scheduler.triggers_of_job(key) {
        Ok(triggers) => triggers,
        Err(err) => {
            warn!(scheduler_job = %key, error = %err, "unable to list triggers");
            Vec::new()
        }
    };

    if triggers.is_empty() {
        return delete_logged(scheduler, key);
    }

    let trigger_keys: Vec<TriggerKey> = triggers.into_iter().map(|t| t.key).collect();
    match scheduler.unschedule_triggers(&trigger_keys) {
        Ok(()) => true,
        Err(err) => {
            warn!(scheduler_job = %key, error = %err, "unable to unschedule triggers");
            false
        }
    }
}

fn delete_logged(scheduler: &dyn JobScheduler, key: &SchedulerJobKey) -> bool {
    match scheduler.delete_job(key) {
        Ok(existed) => existed,
        Err(err) => {
            warn!(scheduler_job = %key, error = %err, "unable to delete scheduled job");
            false
        }
    }
}
