use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use jobforge_core::OwnerId;

use crate::{OwnerMembership, Permission, PrincipalId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    /// Internal callers (schedulers, workers). Not subject to owner checks.
    System,
    User,
}

/// A fully resolved principal for authorization decisions.
///
/// Construction of this object is intentionally decoupled from storage and
/// transport: API/workers can derive memberships from claims and a policy source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub principal_id: PrincipalId,
    pub name: String,
    pub kind: PrincipalKind,
    pub memberships: Vec<OwnerMembership>,
}

impl Principal {
    pub fn system(name: impl Into<String>) -> Self {
        Self {
            principal_id: PrincipalId::new(),
            name: name.into(),
            kind: PrincipalKind::System,
            memberships: Vec::new(),
        }
    }

    pub fn user(name: impl Into<String>, memberships: Vec<OwnerMembership>) -> Self {
        Self {
            principal_id: PrincipalId::new(),
            name: name.into(),
            kind: PrincipalKind::User,
            memberships,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("principal '{principal}' has no membership in owner {owner_id}")]
    NotAMember { principal: String, owner_id: OwnerId },

    #[error("forbidden: missing permission '{0}'")]
    Forbidden(String),
}

/// Authorize a principal for `required` within `owner_id`.
///
/// - No IO
/// - No panics
/// - No business logic (pure policy check)
pub fn authorize(
    principal: &Principal,
    owner_id: OwnerId,
    required: &Permission,
) -> Result<(), AuthzError> {
    if principal.kind == PrincipalKind::System {
        return Ok(());
    }

    let membership = principal
        .memberships
        .iter()
        .find(|m| m.owner_id == owner_id)
        .ok_or_else(|| AuthzError::NotAMember {
            principal: principal.name.clone(),
            owner_id,
        })?;

    let perms: HashSet<&str> = membership.permissions.iter().map(|p| p.as_str()).collect();

    if perms.contains("*") || perms.contains(required.as_str()) {
        Ok(())
    } else {
        Err(AuthzError::Forbidden(required.as_str().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_principals_bypass_owner_checks() {
        let principal = Principal::system("scheduler");
        assert!(authorize(&principal, OwnerId::new(), &Permission::JOBS_READ).is_ok());
    }

    #[test]
    fn members_need_the_permission() {
        let owner = OwnerId::new();
        let reader = Principal::user(
            "alice",
            vec![OwnerMembership::new(owner, [Permission::JOBS_READ])],
        );

        assert!(authorize(&reader, owner, &Permission::JOBS_READ).is_ok());
        assert_eq!(
            authorize(&reader, owner, &Permission::JOBS_MANAGE),
            Err(AuthzError::Forbidden("jobs.manage".to_string()))
        );
    }

    #[test]
    fn wildcard_grants_everything_within_the_owner() {
        let owner = OwnerId::new();
        let admin = Principal::user("root", vec![OwnerMembership::new(owner, [Permission::WILDCARD])]);

        assert!(authorize(&admin, owner, &Permission::JOBS_MANAGE).is_ok());
        assert!(matches!(
            authorize(&admin, OwnerId::new(), &Permission::JOBS_READ),
            Err(AuthzError::NotAMember { .. })
        ));
    }
}
