//! Background job system: queuing, distributed execution, retry and recovery.
//!
//! ## Design
//!
//! - Every job is a durable [`JobStatus`] record plus a small correlation
//!   [`JobMessage`] carrying its id and key
//! - Messages travel over a transactional transport; a receiver thread runs
//!   the job and commits or rolls back its transaction based on the outcome
//! - Retries are new messages published by the manager, never broker
//!   redelivery of the original one
//! - A node only resumes a RUNNING job it owns; another node's job is
//!   rejected
//!
//! ## Components
//!
//! - [`JobManager`]: lifecycle, queuing, execution, administration
//! - [`JobRegistry`]: job key → job factory
//! - [`JobDispatcher`]: per-thread transport sessions for publishing
//! - [`JobMessageReceiver`]: consumer threads feeding the manager
//! - [`JobCurator`]: status persistence
//! - [`JobScheduler`]: cron triggers queuing registered jobs

pub mod config;
pub mod constraint;
pub mod cron_scheduler;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod manager;
pub mod message;
pub mod mode;
pub mod receiver;
pub mod registry;
pub mod scheduler;
pub mod status;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use config::JobConfig;
pub use constraint::{JobConstraint, UniqueByArguments};
pub use cron_scheduler::{CronScheduler, TriggerCallback};
pub use dispatcher::{DispatchError, JobDispatcher, TransportJobDispatcher, UnitOfWork};
pub use error::{JobError, JobExecutionError};
pub use logging::LoggingContext;
pub use manager::{JobManager, JobManagerBuilder, ManagerState, SCHEDULER_PRINCIPAL};
pub use message::{JOB_KEY_PROPERTY, JobMessage};
pub use mode::{Mode, ModeChange};
pub use receiver::{Disposition, JobMessageHandler, JobMessageReceiver, ReceiverConfig, ReceiverStats};
pub use registry::{AsyncJob, JobDefinition, JobExecutionContext, JobFactory, JobRegistry};
pub use scheduler::{JobScheduler, ScheduledJob, SchedulerError, SchedulerJobKey, Trigger, TriggerKey};
pub use status::{JobStatus, OwnerContext};
pub use store::{CuratorError, InMemoryJobCurator, JobCurator, QueryArgs};
