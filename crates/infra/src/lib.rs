//! Infrastructure layer: job manager, transport plumbing, config, workers.

pub mod config;
pub mod jobs;
pub mod workers;

pub use config::{ConfigError, JobsConfig};
