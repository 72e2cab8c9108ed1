//! Queuing constraints.

use std::collections::BTreeSet;

use jobforge_core::JobId;

use super::status::JobStatus;

/// Vetoes queuing of a job that conflicts with currently active jobs.
///
/// `active` is the set of non-terminal jobs, fetched once per queue request
/// and shared by every constraint of that request.
pub trait JobConstraint: Send + Sync {
    /// Ids of the active jobs that block `inbound`. Empty means no conflict.
    fn test(&self, inbound: &JobStatus, active: &[JobStatus]) -> Vec<JobId>;
}

impl<F> JobConstraint for F
where
    F: Fn(&JobStatus, &[JobStatus]) -> Vec<JobId> + Send + Sync,
{
    fn test(&self, inbound: &JobStatus, active: &[JobStatus]) -> Vec<JobId> {
        self(inbound, active)
    }
}

/// Blocks a job when an active job with the same key carries the same values
/// for every listed argument.
///
/// An argument absent from either side never matches, so an inbound job that
/// lacks one of the arguments is never blocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueByArguments {
    params: BTreeSet<String>,
}

impl UniqueByArguments {
    pub fn new<S: Into<String>>(params: impl IntoIterator<Item = S>) -> Self {
        Self {
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(String::as_str)
    }
}

impl JobConstraint for UniqueByArguments {
    fn test(&self, inbound: &JobStatus, active: &[JobStatus]) -> Vec<JobId> {
        let mut wanted = Vec::with_capacity(self.params.len());
        for param in &self.params {
            match inbound.argument(param) {
                Some(value) => wanted.push((param.as_str(), value)),
                None => return Vec::new(),
            }
        }

        active
            .iter()
            .filter(|job| job.id() != inbound.id() && job.job_key() == inbound.job_key())
            .filter(|job| wanted.iter().all(|(param, value)| job.argument(param) == Some(*value)))
            .map(JobStatus::id)
            .collect()
    }
}
