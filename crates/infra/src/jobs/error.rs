//! Job error taxonomy.
//!
//! Every variant answers one question for the receiver: is this outcome
//! final (`is_terminal`) or should the transport roll back?

use thiserror::Error;

use jobforge_core::{JobId, JobState};

use super::dispatcher::DispatchError;
use super::store::CuratorError;

/// Failure raised by a job body.
///
/// The body decides whether a failure is worth retrying. Errors converted
/// from `anyhow::Error` (i.e. propagated with `?` from arbitrary code) are
/// treated as crashes and never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct JobExecutionError {
    message: String,
    terminal: bool,
}

impl JobExecutionError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            terminal: false,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            terminal: true,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// The same failure, flagged as final.
    pub fn into_terminal(mut self) -> Self {
        self.terminal = true;
        self
    }
}

impl From<anyhow::Error> for JobExecutionError {
    fn from(err: anyhow::Error) -> Self {
        Self::terminal(format!("{err:#}"))
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    /// The job could not be set up: missing record, unknown key, bad state.
    #[error("job initialization failed: {message}")]
    Initialization {
        job_id: Option<JobId>,
        message: String,
    },

    #[error("job execution failed: {0}")]
    Execution(JobExecutionError),

    /// Persisting a state change failed. Takes priority over the execution
    /// outcome that triggered it.
    #[error("unable to update job {job_id} to state {state}: {source}")]
    StateManagement {
        job_id: JobId,
        state: JobState,
        terminal: bool,
        #[source]
        source: CuratorError,
    },

    #[error("job message dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("job curator error: {0}")]
    Curator(#[from] CuratorError),
}

impl JobError {
    pub fn initialization(job_id: Option<JobId>, message: impl Into<String>) -> Self {
        Self::Initialization {
            job_id,
            message: message.into(),
        }
    }

    pub fn state_management(job_id: JobId, state: JobState, source: CuratorError) -> Self {
        Self::StateManagement {
            job_id,
            state,
            terminal: state.is_terminal(),
            source,
        }
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    /// Whether retrying the same message could ever produce a different outcome.
    pub fn is_terminal(&self) -> bool {
        match self {
            JobError::Initialization { .. } => true,
            JobError::Execution(err) => err.is_terminal(),
            JobError::StateManagement { terminal, .. } => *terminal,
            JobError::Dispatch(_) => false,
            JobError::IllegalState(_) => true,
            JobError::Configuration(_) => true,
            JobError::Curator(_) => false,
        }
    }
}

impl From<JobExecutionError> for JobError {
    fn from(err: JobExecutionError) -> Self {
        Self::Execution(err)
    }
}
