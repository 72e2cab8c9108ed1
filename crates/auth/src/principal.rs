use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use jobforge_core::OwnerId;

/// Identity of an authenticated principal (human user, service account, etc).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(Uuid);

impl PrincipalId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for PrincipalId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for PrincipalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(s)?))
    }
}

/// A principal's membership in an owner (organization).
///
/// States *which owner* the principal may act within and which permissions
/// are granted there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerMembership {
    pub owner_id: OwnerId,
    pub permissions: Vec<crate::Permission>,
}

impl OwnerMembership {
    pub fn new(owner_id: OwnerId, permissions: impl IntoIterator<Item = crate::Permission>) -> Self {
        Self {
            owner_id,
            permissions: permissions.into_iter().collect(),
        }
    }
}
