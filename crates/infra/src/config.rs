//! Engine configuration.
//!
//! Built in code with `EngineConfig::default()` plus `with_*` methods, or read
//! from `JOBFORGE_*` environment variables with [`EngineConfig::from_env`].

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use jobforge_core::RetryPolicy;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("invalid queue spec {spec:?}: {message}")]
    InvalidQueue { spec: String, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Per-queue execution settings. Not persisted; changed at runtime through
/// pause/resume/scale commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub name: String,
    /// Maximum jobs of this queue running at once in one executor.
    pub limit: usize,
    pub paused: bool,
    /// Default execution timeout; a worker's own timeout takes precedence.
    pub timeout: Option<Duration>,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, limit: usize) -> Self {
        Self {
            name: name.into(),
            limit,
            paused: false,
            timeout: None,
        }
    }

    pub fn paused(mut self) -> Self {
        self.paused = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl FromStr for QueueConfig {
    type Err = ConfigError;

    /// Parse `name:limit` (limit defaults to 10 when omitted).
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = |message: &str| ConfigError::InvalidQueue {
            spec: spec.to_string(),
            message: message.to_string(),
        };

        let (name, limit) = match spec.trim().split_once(':') {
            Some((name, limit)) => {
                let limit = limit
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| invalid("limit is not a number"))?;
                (name.trim(), limit)
            }
            None => (spec.trim(), DEFAULT_QUEUE_LIMIT),
        };

        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(invalid("queue name must be non-empty without whitespace"));
        }
        if limit == 0 {
            return Err(invalid("limit must be at least 1"));
        }
        Ok(QueueConfig::new(name, limit))
    }
}

/// How the engine behaves under test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TestingMode {
    /// Normal operation.
    #[default]
    Disabled,
    /// Jobs are persisted but nothing runs them; tests drive execution by hand.
    Manual,
    /// Jobs run immediately in the inserting task and are never persisted.
    Inline,
}

impl FromStr for TestingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "disabled" | "off" | "false" => Ok(Self::Disabled),
            "manual" => Ok(Self::Manual),
            "inline" => Ok(Self::Inline),
            other => Err(ConfigError::InvalidValue {
                var: "JOBFORGE_TESTING".into(),
                message: format!("unknown testing mode {other:?}"),
            }),
        }
    }
}

const DEFAULT_QUEUE_LIMIT: usize = 10;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Name of this process in heartbeats and control envelopes.
    pub node: String,
    pub queues: Vec<QueueConfig>,
    /// Fetch interval of each queue executor when nothing woke it earlier.
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub stage_interval: Duration,
    /// Max rows promoted per scheduler sweep.
    pub stage_limit: usize,
    pub rescue_interval: Duration,
    /// An executor silent for this long is considered dead.
    pub rescue_after: Duration,
    /// Max rows rescued per sweep.
    pub rescue_limit: usize,
    pub prune_interval: Duration,
    /// Terminal rows older than this are deleted.
    pub prune_max_age: Duration,
    /// Rows deleted per prune batch.
    pub prune_limit: usize,
    pub shutdown_grace: Duration,
    pub retry_policy: RetryPolicy,
    pub testing: TestingMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node: default_node(),
            queues: vec![QueueConfig::new("default", DEFAULT_QUEUE_LIMIT)],
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(15),
            stage_interval: Duration::from_secs(1),
            stage_limit: 1_000,
            rescue_interval: Duration::from_secs(60),
            rescue_after: Duration::from_secs(120),
            rescue_limit: 1_000,
            prune_interval: Duration::from_secs(30),
            prune_max_age: Duration::from_secs(24 * 60 * 60),
            prune_limit: 10_000,
            shutdown_grace: Duration::from_secs(15),
            retry_policy: RetryPolicy::default(),
            testing: TestingMode::Disabled,
        }
    }
}

fn default_node() -> String {
    format!("node-{}", &Uuid::now_v7().simple().to_string()[..12])
}

impl EngineConfig {
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    pub fn with_queues(mut self, queues: impl IntoIterator<Item = QueueConfig>) -> Self {
        self.queues = queues.into_iter().collect();
        self
    }

    /// Add (or replace) one queue.
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queues.retain(|q| q.name != queue.name);
        self.queues.push(queue);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_stage_interval(mut self, interval: Duration) -> Self {
        self.stage_interval = interval;
        self
    }

    pub fn with_rescue(mut self, interval: Duration, rescue_after: Duration) -> Self {
        self.rescue_interval = interval;
        self.rescue_after = rescue_after;
        self
    }

    pub fn with_prune(mut self, interval: Duration, max_age: Duration, limit: usize) -> Self {
        self.prune_interval = interval;
        self.prune_max_age = max_age;
        self.prune_limit = limit;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_testing(mut self, mode: TestingMode) -> Self {
        self.testing = mode;
        self
    }

    pub fn queue(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.name == name)
    }

    /// Create configuration from environment variables.
    ///
    /// Environment variables (all optional):
    /// - `JOBFORGE_NODE`: node name (default: generated)
    /// - `JOBFORGE_QUEUES`: `name:limit` list, e.g. `mail:10,default:5`
    /// - `JOBFORGE_POLL_INTERVAL_MS`, `JOBFORGE_HEARTBEAT_INTERVAL_MS`,
    ///   `JOBFORGE_STAGE_INTERVAL_MS`, `JOBFORGE_RESCUE_INTERVAL_MS`,
    ///   `JOBFORGE_PRUNE_INTERVAL_MS`, `JOBFORGE_SHUTDOWN_GRACE_MS`
    /// - `JOBFORGE_RESCUE_AFTER_SECS`, `JOBFORGE_PRUNE_MAX_AGE_SECS`
    /// - `JOBFORGE_PRUNE_LIMIT`
    /// - `JOBFORGE_TESTING`: `disabled`, `manual` or `inline`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(node) = lookup("JOBFORGE_NODE").filter(|n| !n.trim().is_empty()) {
            config.node = node.trim().to_string();
        }

        if let Some(spec) = lookup("JOBFORGE_QUEUES") {
            config.queues = spec
                .split(',')
                .filter(|part| !part.trim().is_empty())
                .map(QueueConfig::from_str)
                .collect::<Result<_, _>>()?;
        }

        let millis = |var: &str| parse_var::<u64>(&lookup, var).map(|v| v.map(Duration::from_millis));
        let secs = |var: &str| parse_var::<u64>(&lookup, var).map(|v| v.map(Duration::from_secs));

        if let Some(d) = millis("JOBFORGE_POLL_INTERVAL_MS")? {
            config.poll_interval = d;
        }
        if let Some(d) = millis("JOBFORGE_HEARTBEAT_INTERVAL_MS")? {
            config.heartbeat_interval = d;
        }
        if let Some(d) = millis("JOBFORGE_STAGE_INTERVAL_MS")? {
            config.stage_interval = d;
        }
        if let Some(d) = millis("JOBFORGE_RESCUE_INTERVAL_MS")? {
            config.rescue_interval = d;
        }
        if let Some(d) = secs("JOBFORGE_RESCUE_AFTER_SECS")? {
            config.rescue_after = d;
        }
        if let Some(d) = millis("JOBFORGE_PRUNE_INTERVAL_MS")? {
            config.prune_interval = d;
        }
        if let Some(d) = secs("JOBFORGE_PRUNE_MAX_AGE_SECS")? {
            config.prune_max_age = d;
        }
        if let Some(limit) = parse_var::<usize>(&lookup, "JOBFORGE_PRUNE_LIMIT")? {
            config.prune_limit = limit;
        }
        if let Some(d) = millis("JOBFORGE_SHUTDOWN_GRACE_MS")? {
            config.shutdown_grace = d;
        }
        if let Some(mode) = lookup("JOBFORGE_TESTING") {
            config.testing = mode.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("poll_interval", self.poll_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("stage_interval", self.stage_interval),
            ("rescue_interval", self.rescue_interval),
            ("prune_interval", self.prune_interval),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }

        if self.rescue_after <= self.heartbeat_interval {
            return Err(ConfigError::Invalid(format!(
                "rescue_after ({:?}) must exceed heartbeat_interval ({:?})",
                self.rescue_after, self.heartbeat_interval
            )));
        }
        if self.stage_limit == 0 || self.rescue_limit == 0 || self.prune_limit == 0 {
            return Err(ConfigError::Invalid("sweep limits must be at least 1".into()));
        }

        for (i, queue) in self.queues.iter().enumerate() {
            if queue.limit == 0 {
                return Err(ConfigError::Invalid(format!("queue {} has a zero limit", queue.name)));
            }
            if self.queues[..i].iter().any(|q| q.name == queue.name) {
                return Err(ConfigError::Invalid(format!("queue {} configured twice", queue.name)));
            }
        }
        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| ConfigError::InvalidValue {
            var: var.to_string(),
            message: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.queues, vec![QueueConfig::new("default", 10)]);
        assert_eq!(config.testing, TestingMode::Disabled);
    }

    #[test]
    fn reads_queues_and_intervals() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("JOBFORGE_NODE", "worker-1"),
            ("JOBFORGE_QUEUES", "mail:10, default:5,events"),
            ("JOBFORGE_POLL_INTERVAL_MS", "250"),
            ("JOBFORGE_RESCUE_AFTER_SECS", "90"),
            ("JOBFORGE_PRUNE_LIMIT", "500"),
            ("JOBFORGE_TESTING", "manual"),
        ]))
        .unwrap();

        assert_eq!(config.node, "worker-1");
        assert_eq!(
            config.queues,
            vec![
                QueueConfig::new("mail", 10),
                QueueConfig::new("default", 5),
                QueueConfig::new("events", 10),
            ]
        );
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.rescue_after, Duration::from_secs(90));
        assert_eq!(config.prune_limit, 500);
        assert_eq!(config.testing, TestingMode::Manual);
    }

    #[test]
    fn rejects_bad_values() {
        let err = EngineConfig::from_lookup(lookup(&[("JOBFORGE_POLL_INTERVAL_MS", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref var, .. } if var == "JOBFORGE_POLL_INTERVAL_MS"));

        assert!(matches!(
            EngineConfig::from_lookup(lookup(&[("JOBFORGE_QUEUES", "mail:0")])),
            Err(ConfigError::InvalidQueue { .. })
        ));
        assert!(matches!(
            EngineConfig::from_lookup(lookup(&[("JOBFORGE_TESTING", "sometimes")])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            EngineConfig::from_lookup(lookup(&[("JOBFORGE_QUEUES", "mail:2,mail:3")])),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rescue_window_must_outlast_heartbeats() {
        let config = EngineConfig::default().with_rescue(Duration::from_secs(10), Duration::from_secs(5));
        assert!(config.validate().is_err());
    }

    #[test]
    fn with_queue_replaces_by_name() {
        let config = EngineConfig::default()
            .with_queue(QueueConfig::new("default", 3))
            .with_queue(QueueConfig::new("mail", 2).paused());
        assert_eq!(config.queues.len(), 2);
        assert_eq!(config.queue("default").map(|q| q.limit), Some(3));
        assert!(config.queue("mail").is_some_and(|q| q.paused));
    }
}
