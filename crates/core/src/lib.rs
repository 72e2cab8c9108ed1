//! `jobforge-core` — identifiers, job states and the shared error model.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod state;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, OwnerId};
pub use state::JobState;
