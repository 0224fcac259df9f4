//! Reconnect configuration with sensible defaults.
//!
//! Every tunable is a named constant below, so the defaults stay in one
//! place. The TOML form stores durations as integer milliseconds.

use core::fmt;
use core::str::FromStr;
use core::time::Duration;
use std::fs::read_to_string;

use camino::Utf8Path;
use eyre::{bail, Result as EyreResult, WrapErr};
use serde::{Deserialize, Serialize};

/// How long the learner waits for the root response (60 seconds).
pub const DEFAULT_ROOT_RESPONSE_TIMEOUT_MS: u64 = 60_000;

/// How long the learner keeps applying responses after the teacher
/// acknowledged the terminal request and closed its stream (30 seconds).
pub const DEFAULT_TERMINAL_DRAIN_TIMEOUT_MS: u64 = 30_000;

/// Teacher responses per second; 0 disables the limit.
pub const DEFAULT_MAX_NODES_PER_SECOND: u32 = 0;

/// Teacher back-off when the rate limiter denies a response.
pub const DEFAULT_RATE_LIMITER_SLEEP_MS: u64 = 1;

/// Learner back-off when the traversal has nothing to send yet.
pub const DEFAULT_TRAVERSAL_RETRY_SLEEP_MS: u64 = 1;

/// Learner tasks sending requests.
pub const DEFAULT_LEARNER_SEND_TASKS: usize = 4;

/// Learner tasks applying responses.
pub const DEFAULT_LEARNER_RECEIVE_TASKS: usize = 32;

/// Push teacher poll interval while waiting for the learner's last report.
pub const DEFAULT_PUSH_REPORT_POLL_MS: u64 = 1;

/// Push teacher gives up waiting for a report after this long and proceeds.
pub const DEFAULT_PUSH_MAX_REPORT_WAIT_MS: u64 = 1_000;

/// Leaves buffered between the collector and the hashing pipeline.
pub const DEFAULT_HASHING_QUEUE_CAPACITY: usize = 1_024;

/// Which reconnect protocol both peers speak.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectMode {
    /// Learner-driven, hash per requested path.
    #[default]
    Pull,
    /// Teacher-driven, level by level.
    Push,
}

impl FromStr for ReconnectMode {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pull" => Ok(Self::Pull),
            "push" => Ok(Self::Push),
            other => bail!("unknown reconnect mode {other:?}, expected \"pull\" or \"push\""),
        }
    }
}

impl fmt::Display for ReconnectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pull => "pull",
            Self::Push => "push",
        })
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
#[non_exhaustive]
pub struct ReconnectConfig {
    pub mode: ReconnectMode,

    #[serde(rename = "root_response_timeout_ms", with = "serde_duration")]
    pub root_response_timeout: Duration,

    #[serde(rename = "terminal_drain_timeout_ms", with = "serde_duration")]
    pub terminal_drain_timeout: Duration,

    pub max_nodes_per_second: u32,

    #[serde(rename = "rate_limiter_sleep_ms", with = "serde_duration")]
    pub rate_limiter_sleep: Duration,

    #[serde(rename = "traversal_retry_sleep_ms", with = "serde_duration")]
    pub traversal_retry_sleep: Duration,

    /// Not tuned per deployment yet; kept configurable for benchmarks.
    pub learner_send_tasks: usize,

    pub learner_receive_tasks: usize,

    #[serde(rename = "push_report_poll_ms", with = "serde_duration")]
    pub push_report_poll: Duration,

    #[serde(rename = "push_max_report_wait_ms", with = "serde_duration")]
    pub push_max_report_wait: Duration,

    pub hashing_queue_capacity: usize,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            mode: ReconnectMode::default(),
            root_response_timeout: Duration::from_millis(DEFAULT_ROOT_RESPONSE_TIMEOUT_MS),
            terminal_drain_timeout: Duration::from_millis(DEFAULT_TERMINAL_DRAIN_TIMEOUT_MS),
            max_nodes_per_second: DEFAULT_MAX_NODES_PER_SECOND,
            rate_limiter_sleep: Duration::from_millis(DEFAULT_RATE_LIMITER_SLEEP_MS),
            traversal_retry_sleep: Duration::from_millis(DEFAULT_TRAVERSAL_RETRY_SLEEP_MS),
            learner_send_tasks: DEFAULT_LEARNER_SEND_TASKS,
            learner_receive_tasks: DEFAULT_LEARNER_RECEIVE_TASKS,
            push_report_poll: Duration::from_millis(DEFAULT_PUSH_REPORT_POLL_MS),
            push_max_report_wait: Duration::from_millis(DEFAULT_PUSH_MAX_REPORT_WAIT_MS),
            hashing_queue_capacity: DEFAULT_HASHING_QUEUE_CAPACITY,
        }
    }
}

impl ReconnectConfig {
    #[must_use]
    pub fn with_mode(mut self, mode: ReconnectMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub const fn with_max_nodes_per_second(mut self, max_nodes_per_second: u32) -> Self {
        self.max_nodes_per_second = max_nodes_per_second;
        self
    }

    #[must_use]
    pub const fn with_root_response_timeout(mut self, timeout: Duration) -> Self {
        self.root_response_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_terminal_drain_timeout(mut self, timeout: Duration) -> Self {
        self.terminal_drain_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_push_max_report_wait(mut self, wait: Duration) -> Self {
        self.push_max_report_wait = wait;
        self
    }

    #[must_use]
    pub const fn with_learner_tasks(mut self, send: usize, receive: usize) -> Self {
        self.learner_send_tasks = send;
        self.learner_receive_tasks = receive;
        self
    }

    /// Rejects settings that would stall a session.
    pub fn validate(&self) -> EyreResult<()> {
        if self.learner_send_tasks == 0 {
            bail!("learner_send_tasks must be at least 1");
        }
        if self.learner_receive_tasks == 0 {
            bail!("learner_receive_tasks must be at least 1");
        }
        if self.hashing_queue_capacity == 0 {
            bail!("hashing_queue_capacity must be at least 1");
        }
        Ok(())
    }

    pub fn from_toml(content: &str) -> EyreResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Utf8Path) -> EyreResult<Self> {
        let content = read_to_string(path)
            .wrap_err_with(|| format!("failed to read reconnect configuration from {path:?}"))?;

        Self::from_toml(&content)
            .wrap_err_with(|| format!("invalid reconnect configuration in {path:?}"))
    }
}

mod serde_duration {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use claims::{assert_err, assert_ok};

    use super::*;

    #[test]
    fn defaults() {
        let config = ReconnectConfig::default();
        assert_eq!(config.mode, ReconnectMode::Pull, "pull by default");
        assert_eq!(config.root_response_timeout, Duration::from_secs(60), "one minute");
        assert_eq!(config.max_nodes_per_second, 0, "unlimited");
        assert_eq!(config.learner_send_tasks, 4, "send tasks");
        assert_eq!(config.learner_receive_tasks, 32, "receive tasks");
        assert_eq!(config.push_max_report_wait, Duration::from_secs(1), "push wait ceiling");
        assert_eq!(
            config.terminal_drain_timeout,
            Duration::from_secs(30),
            "drain after acknowledgement"
        );
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = assert_ok!(ReconnectConfig::from_toml(
            r#"
            mode = "push"
            max_nodes_per_second = 500
            root_response_timeout_ms = 250
            "#
        ));

        assert_eq!(config.mode, ReconnectMode::Push, "mode");
        assert_eq!(config.max_nodes_per_second, 500, "rate");
        assert_eq!(config.root_response_timeout, Duration::from_millis(250), "timeout");
        assert_eq!(config.learner_receive_tasks, 32, "untouched default");
    }

    #[test]
    fn zero_workers_are_rejected() {
        let _ = assert_err!(ReconnectConfig::from_toml("learner_send_tasks = 0"));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = ReconnectConfig::default().with_mode(ReconnectMode::Push);
        let text = assert_ok!(toml::to_string_pretty(&config));
        let back = assert_ok!(ReconnectConfig::from_toml(&text));
        assert_eq!(back.mode, ReconnectMode::Push, "mode survives");
        assert_eq!(back.rate_limiter_sleep, config.rate_limiter_sleep, "durations survive");
    }

    #[test]
    fn mode_parses_from_cli_text() {
        assert_eq!(assert_ok!("push".parse::<ReconnectMode>()), ReconnectMode::Push, "push");
        let _ = assert_err!("sideways".parse::<ReconnectMode>());
    }
}
