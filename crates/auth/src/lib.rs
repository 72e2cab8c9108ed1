//! `jobforge-auth` — principals and owner-scoped permission checks.
//!
//! This crate is intentionally decoupled from HTTP and storage.

pub mod authorize;
pub mod permissions;
pub mod principal;

pub use authorize::{authorize, AuthzError, Principal};
pub use permissions::Permission;
pub use principal::{OwnerMembership, PrincipalId};
