//! Wire-level correlation message.
//!
//! The message only references a job; authoritative state lives in the
//! status record, so redelivery is safe and message size is constant.

use serde::{Deserialize, Serialize};

use jobforge_core::JobId;

/// Message property carrying the job key, for consumer-side filtering.
pub const JOB_KEY_PROPERTY: &str = "job_key";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    job_id: JobId,
    job_key: String,
}

impl JobMessage {
    pub fn new(job_id: JobId, job_key: impl Into<String>) -> Self {
        Self {
            job_id,
            job_key: job_key.into(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_key(&self) -> &str {
        &self.job_key
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }
}

impl core::fmt::Display for JobMessage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} ({})", self.job_id, self.job_key)
    }
}
