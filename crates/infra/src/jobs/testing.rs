//! Recording doubles for job manager tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use jobforge_core::{JobId, JobState};

use super::dispatcher::{DispatchError, JobDispatcher};
use super::error::JobExecutionError;
use super::message::JobMessage;
use super::registry::JobExecutionContext;
use super::scheduler::{JobScheduler, ScheduledJob, SchedulerError, SchedulerJobKey, Trigger, TriggerKey};
use super::status::JobStatus;
use super::store::{CuratorError, InMemoryJobCurator, JobCurator, QueryArgs};

/// In-memory curator that remembers every state it was asked to persist.
#[derive(Debug, Default)]
pub struct RecordingCurator {
    inner: InMemoryJobCurator,
    merged: Mutex<HashMap<JobId, Vec<JobState>>>,
    fail_merge_to: Mutex<Option<JobState>>,
    next_load: Mutex<Option<JobStatus>>,
    bulk_calls: Mutex<usize>,
}

impl RecordingCurator {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, status: JobStatus) -> JobStatus {
        self.inner.create(&status).unwrap()
    }

    /// Reject merges that move a record to `state`.
    pub fn fail_merges_to(&self, state: JobState) {
        *self.fail_merge_to.lock().unwrap() = Some(state);
    }

    /// Answer the next `lock_and_load` with `snapshot`, as if it had been read
    /// before a concurrent writer persisted its change.
    pub fn serve_next_load(&self, snapshot: JobStatus) {
        *self.next_load.lock().unwrap() = Some(snapshot);
    }

    pub fn merged_states(&self, id: JobId) -> Vec<JobState> {
        self.merged.lock().unwrap().get(&id).cloned().unwrap_or_default()
    }

    pub fn stored(&self, id: JobId) -> JobStatus {
        self.inner.get(id).unwrap().unwrap()
    }

    pub fn bulk_calls(&self) -> usize {
        *self.bulk_calls.lock().unwrap()
    }
}

impl JobCurator for RecordingCurator {
    fn get(&self, id: JobId) -> Result<Option<JobStatus>, CuratorError> {
        self.inner.get(id)
    }

    fn lock_and_load(&self, id: JobId) -> Result<Option<JobStatus>, CuratorError> {
        if let Some(snapshot) = self.next_load.lock().unwrap().take() {
            return Ok(Some(snapshot));
        }
        self.inner.lock_and_load(id)
    }

    fn create(&self, status: &JobStatus) -> Result<JobStatus, CuratorError> {
        self.inner.create(status)
    }

    fn merge(&self, status: &JobStatus) -> Result<JobStatus, CuratorError> {
        if *self.fail_merge_to.lock().unwrap() == Some(status.state()) {
            return Err(CuratorError::Storage("database unavailable".to_string()));
        }

        let merged = self.inner.merge(status)?;
        self.merged
            .lock()
            .unwrap()
            .entry(status.id())
            .or_default()
            .push(status.state());
        Ok(merged)
    }

    fn find_jobs(&self, args: Option<&QueryArgs>) -> Result<Vec<JobStatus>, CuratorError> {
        self.inner.find_jobs(args)
    }

    fn get_non_terminal_jobs(&self) -> Result<Vec<JobStatus>, CuratorError> {
        self.inner.get_non_terminal_jobs()
    }

    fn delete_jobs(&self, args: &QueryArgs) -> Result<usize, CuratorError> {
        *self.bulk_calls.lock().unwrap() += 1;
        self.inner.delete_jobs(args)
    }

    fn update_job_state(&self, args: &QueryArgs, state: JobState) -> Result<usize, CuratorError> {
        *self.bulk_calls.lock().unwrap() += 1;
        self.inner.update_job_state(args, state)
    }
}

/// Dispatcher that keeps posted messages instead of sending them.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    posted: Mutex<Vec<JobMessage>>,
    failing: Mutex<bool>,
}

impl RecordingDispatcher {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_posts(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn posted(&self) -> Vec<JobMessage> {
        self.posted.lock().unwrap().clone()
    }
}

impl JobDispatcher for RecordingDispatcher {
    fn post_message(&self, message: &JobMessage) -> Result<(), DispatchError> {
        if *self.failing.lock().unwrap() {
            return Err(DispatchError::Configuration("broker unreachable".to_string()));
        }
        self.posted.lock().unwrap().push(message.clone());
        Ok(())
    }

    fn commit(&self) -> Result<(), DispatchError> {
        Ok(())
    }

    fn rollback(&self) -> Result<(), DispatchError> {
        Ok(())
    }

    fn begin_unit_of_work(&self) {}

    fn end_unit_of_work(&self) {}
}

/// Scheduler that only records what it is told.
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    jobs: Mutex<HashMap<SchedulerJobKey, ScheduledJob>>,
    calls: Mutex<Vec<&'static str>>,
}

impl RecordingScheduler {
    pub fn with_jobs(jobs: impl IntoIterator<Item = ScheduledJob>) -> Self {
        let scheduler = Self::default();
        for job in jobs {
            scheduler.jobs.lock().unwrap().insert(job.key.clone(), job);
        }
        scheduler
    }

    pub fn job_keys_sorted(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.jobs.lock().unwrap().values().map(|j| j.job_key.clone()).collect();
        keys.sort();
        keys
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

impl JobScheduler for RecordingScheduler {
    fn schedule_job(&self, job: ScheduledJob) -> Result<(), SchedulerError> {
        self.jobs.lock().unwrap().insert(job.key.clone(), job);
        Ok(())
    }

    fn delete_job(&self, key: &SchedulerJobKey) -> Result<bool, SchedulerError> {
        Ok(self.jobs.lock().unwrap().remove(key).is_some())
    }

    fn unschedule_triggers(&self, _keys: &[TriggerKey]) -> Result<(), SchedulerError> {
        Ok(())
    }

    fn job_keys(&self) -> Result<Vec<SchedulerJobKey>, SchedulerError> {
        Ok(self.jobs.lock().unwrap().keys().cloned().collect())
    }

    fn job_detail(&self, key: &SchedulerJobKey) -> Result<Option<ScheduledJob>, SchedulerError> {
        Ok(self.jobs.lock().unwrap().get(key).cloned())
    }

    fn triggers_of_job(&self, key: &SchedulerJobKey) -> Result<Vec<Trigger>, SchedulerError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .get(key)
            .map(|j| j.triggers.clone())
            .unwrap_or_default())
    }

    fn start(&self) -> Result<(), SchedulerError> {
        self.calls.lock().unwrap().push("start");
        Ok(())
    }

    fn standby(&self) -> Result<(), SchedulerError> {
        self.calls.lock().unwrap().push("standby");
        Ok(())
    }

    fn shutdown(&self) -> Result<(), SchedulerError> {
        self.calls.lock().unwrap().push("shutdown");
        Ok(())
    }
}

// Job bodies used across the manager tests.

pub fn succeed(ctx: &mut JobExecutionContext<'_>) -> Result<(), JobExecutionError> {
    ctx.set_job_result("done")
}

pub fn fail_retryable(_ctx: &mut JobExecutionContext<'_>) -> Result<(), JobExecutionError> {
    Err(JobExecutionError::retryable("upstream timed out"))
}

pub fn fail_terminal(_ctx: &mut JobExecutionContext<'_>) -> Result<(), JobExecutionError> {
    Err(JobExecutionError::terminal("bad input"))
}

pub fn explode(_ctx: &mut JobExecutionContext<'_>) -> Result<(), JobExecutionError> {
    panic!("kaboom")
}
