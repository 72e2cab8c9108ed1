//! Job status persistence (curator) and an in-memory implementation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use jobforge_core::{JobId, JobState, OwnerId};

use super::status::JobStatus;

/// Persistence contract for job status records.
///
/// Writes are optimistic: `merge` must reject a record whose version does
/// not match the stored one. Bulk operations are atomic over their whole
/// query scope.
pub trait JobCurator: Send + Sync {
    fn get(&self, id: JobId) -> Result<Option<JobStatus>, CuratorError>;

    /// Load a record for execution. Durable stores take a row lock here.
    fn lock_and_load(&self, id: JobId) -> Result<Option<JobStatus>, CuratorError>;

    /// Insert a new record and return the persisted copy.
    fn create(&self, status: &JobStatus) -> Result<JobStatus, CuratorError>;

    /// Write an existing record and return the persisted copy.
    fn merge(&self, status: &JobStatus) -> Result<JobStatus, CuratorError>;

    /// `None` lists every record.
    fn find_jobs(&self, args: Option<&QueryArgs>) -> Result<Vec<JobStatus>, CuratorError>;

    fn get_non_terminal_jobs(&self) -> Result<Vec<JobStatus>, CuratorError>;

    fn delete_jobs(&self, args: &QueryArgs) -> Result<usize, CuratorError>;

    fn update_job_state(&self, args: &QueryArgs, state: JobState) -> Result<usize, CuratorError>;
}

impl<C> JobCurator for Arc<C>
where
    C: JobCurator + ?Sized,
{
    fn get(&self, id: JobId) -> Result<Option<JobStatus>, CuratorError> {
        (**self).get(id)
    }

    fn lock_and_load(&self, id: JobId) -> Result<Option<JobStatus>, CuratorError> {
        (**self).lock_and_load(id)
    }

    fn create(&self, status: &JobStatus) -> Result<JobStatus, CuratorError> {
        (**self).create(status)
    }

    fn merge(&self, status: &JobStatus) -> Result<JobStatus, CuratorError> {
        (**self).merge(status)
    }

    fn find_jobs(&self, args: Option<&QueryArgs>) -> Result<Vec<JobStatus>, CuratorError> {
        (**self).find_jobs(args)
    }

    fn get_non_terminal_jobs(&self) -> Result<Vec<JobStatus>, CuratorError> {
        (**self).get_non_terminal_jobs()
    }

    fn delete_jobs(&self, args: &QueryArgs) -> Result<usize, CuratorError> {
        (**self).delete_jobs(args)
    }

    fn update_job_state(&self, args: &QueryArgs, state: JobState) -> Result<usize, CuratorError> {
        (**self).update_job_state(args, state)
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CuratorError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("stale write for job {job_id}: expected version {expected}, found {actual}")]
    Conflict {
        job_id: JobId,
        expected: u64,
        actual: u64,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Filter for job queries and bulk operations.
///
/// Every populated set must contain the record's value for the record to
/// match; an unset or empty set does not filter. The date range is
/// inclusive and applies to the record's last update time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryArgs {
    pub job_ids: Option<HashSet<JobId>>,
    pub job_keys: Option<HashSet<String>>,
    pub states: Option<HashSet<JobState>>,
    pub owner_ids: Option<HashSet<OwnerId>>,
    pub principal_names: Option<HashSet<String>>,
    pub origins: Option<HashSet<String>>,
    pub executors: Option<HashSet<String>>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

fn set_of<T, I>(values: I) -> Option<HashSet<T>>
where
    T: Eq + std::hash::Hash,
    I: IntoIterator<Item = T>,
{
    Some(values.into_iter().collect())
}

fn allows<T: Eq + std::hash::Hash>(filter: &Option<HashSet<T>>, value: Option<&T>) -> bool {
    match filter {
        Some(set) if !set.is_empty() => value.is_some_and(|v| set.contains(v)),
        _ => true,
    }
}

impl QueryArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job_ids(mut self, ids: impl IntoIterator<Item = JobId>) -> Self {
        self.job_ids = set_of(ids);
        self
    }

    pub fn with_job_keys<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
        self.job_keys = set_of(keys.into_iter().map(Into::into));
        self
    }

    pub fn with_states(mut self, states: impl IntoIterator<Item = JobState>) -> Self {
        self.states = set_of(states);
        self
    }

    pub fn with_owner_ids(mut self, owners: impl IntoIterator<Item = OwnerId>) -> Self {
        self.owner_ids = set_of(owners);
        self
    }

    pub fn with_principal_names<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.principal_names = set_of(names.into_iter().map(Into::into));
        self
    }

    pub fn with_origins<S: Into<String>>(mut self, origins: impl IntoIterator<Item = S>) -> Self {
        self.origins = set_of(origins.into_iter().map(Into::into));
        self
    }

    pub fn with_executors<S: Into<String>>(mut self, executors: impl IntoIterator<Item = S>) -> Self {
        self.executors = set_of(executors.into_iter().map(Into::into));
        self
    }

    pub fn with_start_date(mut self, start: DateTime<Utc>) -> Self {
        self.start_date = Some(start);
        self
    }

    pub fn with_end_date(mut self, end: DateTime<Utc>) -> Self {
        self.end_date = Some(end);
        self
    }

    pub fn matches(&self, status: &JobStatus) -> bool {
        let id = status.id();
        let key = status.job_key().to_string();
        let state = status.state();
        let owner = status.owner_id();
        let principal = status.principal().map(str::to_string);
        let origin = status.origin().map(str::to_string);
        let executor = status.executor().map(str::to_string);
        let updated = status.updated_at();

        allows(&self.job_ids, Some(&id))
            && allows(&self.job_keys, Some(&key))
            && allows(&self.states, Some(&state))
            && allows(&self.owner_ids, owner.as_ref())
            && allows(&self.principal_names, principal.as_ref())
            && allows(&self.origins, origin.as_ref())
            && allows(&self.executors, executor.as_ref())
            && self.start_date.is_none_or(|start| updated >= start)
            && self.end_date.is_none_or(|end| updated <= end)
    }
}

/// In-memory job curator for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobCurator {
    jobs: RwLock<HashMap<JobId, JobStatus>>,
}

impl InMemoryJobCurator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Store a record as-is, replacing any existing one. Seeds test fixtures.
    pub fn insert(&self, status: JobStatus) -> Result<(), CuratorError> {
        self.write()?.insert(status.id(), status);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<JobId, JobStatus>>, CuratorError> {
        self.jobs
            .read()
            .map_err(|_| CuratorError::Storage("job table lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<JobId, JobStatus>>, CuratorError> {
        self.jobs
            .write()
            .map_err(|_| CuratorError::Storage("job table lock poisoned".to_string()))
    }
}

impl JobCurator for InMemoryJobCurator {
    fn get(&self, id: JobId) -> Result<Option<JobStatus>, CuratorError> {
        Ok(self.read()?.get(&id).cloned())
    }

    fn lock_and_load(&self, id: JobId) -> Result<Option<JobStatus>, CuratorError> {
        // Merges are version-checked, which is all the locking needed here.
        self.get(id)
    }

    fn create(&self, status: &JobStatus) -> Result<JobStatus, CuratorError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&status.id()) {
            return Err(CuratorError::AlreadyExists(status.id()));
        }

        let mut stored = status.clone();
        stored.mark_persisted(status.version() + 1, Utc::now());
        jobs.insert(stored.id(), stored.clone());
        Ok(stored)
    }

    fn merge(&self, status: &JobStatus) -> Result<JobStatus, CuratorError> {
        let mut jobs = self.write()?;
        let current = jobs
            .get(&status.id())
            .ok_or(CuratorError::NotFound(status.id()))?;

        if current.version() != status.version() {
            return Err(CuratorError::Conflict {
                job_id: status.id(),
                expected: status.version(),
                actual: current.version(),
            });
        }

        let mut stored = status.clone();
        stored.mark_persisted(status.version() + 1, Utc::now());
        jobs.insert(stored.id(), stored.clone());
        Ok(stored)
    }

    fn find_jobs(&self, args: Option<&QueryArgs>) -> Result<Vec<JobStatus>, CuratorError> {
        let jobs = self.read()?;
        let mut found: Vec<JobStatus> = jobs
            .values()
            .filter(|job| args.is_none_or(|a| a.matches(job)))
            .cloned()
            .collect();

        found.sort_by_key(|job| (job.created_at(), job.id()));
        Ok(found)
    }

    fn get_non_terminal_jobs(&self) -> Result<Vec<JobStatus>, CuratorError> {
        let args = QueryArgs::new().with_states(JobState::non_terminal_states());
        self.find_jobs(Some(&args))
    }

    fn delete_jobs(&self, args: &QueryArgs) -> Result<usize, CuratorError> {
        let mut jobs = self.write()?;
        let before = jobs.len();
        jobs.retain(|_, job| !args.matches(job));
        Ok(before - jobs.len())
    }

    fn update_job_state(&self, args: &QueryArgs, state: JobState) -> Result<usize, CuratorError> {
        let mut jobs = self.write()?;
        let now = Utc::now();
        let mut updated = 0;

        for job in jobs.values_mut().filter(|job| args.matches(job)) {
            // Records that cannot move to `state` are skipped rather than failing the batch.
            if job.transition_to(state).is_ok() {
                let version = job.version() + 1;
                job.mark_persisted(version, now);
                updated += 1;
            }
        }

        Ok(updated)
    }
}
