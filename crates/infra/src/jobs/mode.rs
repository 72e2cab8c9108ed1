//! Operational mode notifications.

use serde::{Deserialize, Serialize};

/// Node-wide operational mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    #[default]
    Normal,
    /// A dependency is unavailable; no new work should start.
    Suspend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeChange {
    pub previous: Mode,
    pub current: Mode,
}

impl ModeChange {
    pub fn new(previous: Mode, current: Mode) -> Self {
        Self { previous, current }
    }
}
