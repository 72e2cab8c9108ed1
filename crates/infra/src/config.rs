//! Job system configuration.

use std::collections::HashMap;

use thiserror::Error;

/// Prefix of per-job schedule overrides, e.g. `JOBS_SCHEDULE_REFRESH_POOLS`.
pub const SCHEDULE_PREFIX: &str = "JOBS_SCHEDULE_";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} has an invalid value '{value}': {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings of the job manager and its transport plumbing.
///
/// Defaults are suitable for a single local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobsConfig {
    /// Receiver consumer threads (default: `4`).
    pub threads: usize,
    /// Whether this node runs cron triggers (default: `true`).
    pub scheduler_enabled: bool,
    /// Identity of this node, recorded as origin/executor (default: host name).
    pub node_name: String,
    /// Address job messages are published to (default: `jobs`).
    pub publish_address: String,
    /// Address receivers consume from (default: `jobs`).
    pub consume_address: String,
    /// Optional receiver message filter, e.g. `job_key <> 'import'`.
    pub consume_filter: Option<String>,
    /// Log level used when neither the job nor its owner sets one.
    pub default_log_level: Option<String>,
    /// Per-job schedule overrides, keyed by upper-cased job key.
    schedules: HashMap<String, String>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            scheduler_enabled: true,
            node_name: default_node_name(),
            publish_address: "jobs".to_string(),
            consume_address: "jobs".to_string(),
            consume_filter: None,
            default_log_level: None,
            schedules: HashMap::new(),
        }
    }
}

fn default_node_name() -> String {
    gethostname::gethostname()
        .into_string()
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl JobsConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default          |
    /// |--------------------------|------------------|
    /// | `JOBS_THREADS`           | `4`              |
    /// | `JOBS_SCHEDULER_ENABLED` | `true`           |
    /// | `JOBS_NODE_NAME`         | host name        |
    /// | `JOBS_PUBLISH_ADDRESS`   | `jobs`           |
    /// | `JOBS_CONSUME_ADDRESS`   | `jobs`           |
    /// | `JOBS_CONSUME_FILTER`    | unset            |
    /// | `JOBS_DEFAULT_LOG_LEVEL` | unset            |
    /// | `JOBS_SCHEDULE_<KEY>`    | registry default |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Same as [`JobsConfig::from_env`], reading from the given pairs.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        let get = |name: &str| non_blank(vars.get(name).cloned());

        let mut config = Self::default();

        if let Some(raw) = get("JOBS_THREADS") {
            config.threads = raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ConfigError::InvalidValue {
                    var: "JOBS_THREADS",
                    value: raw.clone(),
                    reason: "expected a positive integer".to_string(),
                })?;
        }

        if let Some(raw) = get("JOBS_SCHEDULER_ENABLED") {
            config.scheduler_enabled = parse_bool(&raw).ok_or_else(|| ConfigError::InvalidValue {
                var: "JOBS_SCHEDULER_ENABLED",
                value: raw.clone(),
                reason: "expected true or false".to_string(),
            })?;
        }

        if let Some(name) = get("JOBS_NODE_NAME") {
            config.node_name = name;
        }
        if let Some(address) = get("JOBS_PUBLISH_ADDRESS") {
            config.publish_address = address;
        }
        if let Some(address) = get("JOBS_CONSUME_ADDRESS") {
            config.consume_address = address;
        }
        config.consume_filter = get("JOBS_CONSUME_FILTER");
        config.default_log_level = get("JOBS_DEFAULT_LOG_LEVEL");

        for (name, value) in &vars {
            if let Some(job) = name.strip_prefix(SCHEDULE_PREFIX) {
                if let Some(cron) = non_blank(Some(value.clone())) {
                    config.schedules.insert(job.to_ascii_uppercase(), cron);
                }
            }
        }

        Ok(config)
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_scheduler_enabled(mut self, enabled: bool) -> Self {
        self.scheduler_enabled = enabled;
        self
    }

    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = name.into();
        self
    }

    pub fn with_publish_address(mut self, address: impl Into<String>) -> Self {
        self.publish_address = address.into();
        self
    }

    pub fn with_consume_address(mut self, address: impl Into<String>) -> Self {
        self.consume_address = address.into();
        self
    }

    pub fn with_consume_filter(mut self, filter: impl Into<String>) -> Self {
        self.consume_filter = Some(filter.into());
        self
    }

    pub fn with_default_log_level(mut self, level: impl Into<String>) -> Self {
        self.default_log_level = Some(level.into());
        self
    }

    /// Override the schedule of one job. `manual` disables cron for it.
    pub fn with_schedule(mut self, job_key: &str, cron: impl Into<String>) -> Self {
        self.schedules.insert(job_key.to_ascii_uppercase(), cron.into());
        self
    }

    /// Configured schedule override for `job_key`, if any.
    pub fn schedule_for(&self, job_key: &str) -> Option<&str> {
        self.schedules.get(&job_key.to_ascii_uppercase()).map(String::as_str)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
