//! Core configuration types.
//!
//! This module contains the root [`Config`] struct and the tuning sections
//! of `fleet.yaml`. Hosts and services live in their own modules.

use super::serde_duration;
use super::{RemoteHost, ServiceSpec};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration structure for fleet.yaml
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub hosts: Vec<RemoteHost>,

    #[serde(default)]
    pub services: Vec<ServiceSpec>,

    #[serde(default)]
    pub ports: PortsConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub activation: ActivationConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,

    #[serde(default)]
    pub launch: LaunchConfig,
}

impl Config {
    pub fn host(&self, name: &str) -> Option<&RemoteHost> {
        self.hosts.iter().find(|h| h.name == name)
    }

    pub fn service(&self, id: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.id == id)
    }

    /// Port range for a host: its own override, else the global range.
    pub fn port_range_for(&self, host: &str) -> PortRange {
        self.host(host)
            .and_then(|h| h.port_range)
            .unwrap_or(self.ports.range())
    }
}

/// Half-open TCP port range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port < self.end
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::new(8000, 8100)
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// What the allocator does when every port in the range is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Surface `Error::NoPortAvailable`.
    #[default]
    Fail,
    /// Hand out the range start anyway and let the launch collide.
    RangeStart,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_port_start")]
    pub start: u16,
    #[serde(default = "default_port_end")]
    pub end: u16,
    #[serde(default)]
    pub on_exhaustion: ExhaustionPolicy,
    /// How long a lease may stay unconfirmed before the port is reusable.
    #[serde(default = "default_lease_ttl", with = "serde_duration")]
    pub lease_ttl: Duration,
}

impl PortsConfig {
    pub fn range(&self) -> PortRange {
        PortRange::new(self.start, self.end)
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            start: default_port_start(),
            end: default_port_end(),
            on_exhaustion: ExhaustionPolicy::default(),
            lease_ttl: default_lease_ttl(),
        }
    }
}

fn default_port_start() -> u16 {
    8000
}
fn default_port_end() -> u16 {
    8100
}
fn default_lease_ttl() -> Duration {
    Duration::from_secs(600)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_connect", with = "serde_duration")]
    pub connect: Duration,
    #[serde(default = "default_command", with = "serde_duration")]
    pub command: Duration,
    #[serde(default = "default_launch", with = "serde_duration")]
    pub launch: Duration,
    #[serde(default = "default_health_interval", with = "serde_duration")]
    pub health_interval: Duration,
    #[serde(default = "default_health_ceiling", with = "serde_duration")]
    pub health_ceiling: Duration,
    /// Wait between SIGTERM and the follow-up liveness check.
    #[serde(default = "default_stop_grace", with = "serde_duration")]
    pub stop_grace: Duration,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect: default_connect(),
            command: default_command(),
            launch: default_launch(),
            health_interval: default_health_interval(),
            health_ceiling: default_health_ceiling(),
            stop_grace: default_stop_grace(),
        }
    }
}

fn default_connect() -> Duration {
    Duration::from_secs(10)
}
fn default_command() -> Duration {
    Duration::from_secs(30)
}
fn default_launch() -> Duration {
    Duration::from_secs(60)
}
fn default_health_interval() -> Duration {
    Duration::from_secs(3)
}
fn default_health_ceiling() -> Duration {
    Duration::from_secs(180)
}
fn default_stop_grace() -> Duration {
    Duration::from_secs(2)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_idle", with = "serde_duration")]
    pub idle_timeout: Duration,
    #[serde(default = "default_sweep", with = "serde_duration")]
    pub eviction_interval: Duration,
    /// Attempt `su -` on connect when the host has a root password.
    #[serde(default = "default_true")]
    pub escalate: bool,
    /// Start and attach a screen session on connect.
    #[serde(default = "default_true")]
    pub job_container: bool,
    /// Open a session on demand when a start needs a non-trivial environment.
    #[serde(default)]
    pub auto_open: bool,
    /// How long to wait for a password prompt or a shell prompt.
    #[serde(default = "default_prompt_wait", with = "serde_duration")]
    pub prompt_wait: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_session_idle(),
            eviction_interval: default_sweep(),
            escalate: true,
            job_container: true,
            auto_open: false,
            prompt_wait: default_prompt_wait(),
        }
    }
}

fn default_session_idle() -> Duration {
    Duration::from_secs(30 * 60)
}
fn default_sweep() -> Duration {
    Duration::from_secs(60)
}
fn default_prompt_wait() -> Duration {
    Duration::from_secs(5)
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_idle", with = "serde_duration")]
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_pool_idle(),
        }
    }
}

fn default_pool_idle() -> Duration {
    Duration::from_secs(5 * 60)
}

/// How many verification signals must agree before an activation is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    /// One matching signal is enough.
    #[default]
    Any,
    /// Every signal that produced an observation must match.
    All,
    /// At least this many signals must match.
    AtLeast(u8),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationConfig {
    #[serde(default = "default_cache_ttl", with = "serde_duration")]
    pub cache_ttl: Duration,
    #[serde(default)]
    pub strictness: Strictness,
    /// Well-known install locations of the conda binary, probed after `PATH`.
    #[serde(default = "default_tool_paths")]
    pub tool_paths: Vec<String>,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            cache_ttl: default_cache_ttl(),
            strictness: Strictness::default(),
            tool_paths: default_tool_paths(),
        }
    }
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

pub fn default_tool_paths() -> Vec<String> {
    [
        "/opt/miniconda3/bin/conda",
        "/opt/anaconda3/bin/conda",
        "/root/anaconda3/bin/conda",
        "/root/miniconda3/bin/conda",
        "/usr/local/anaconda3/bin/conda",
        "/usr/local/miniconda3/bin/conda",
        "/home/anaconda3/bin/conda",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_sweep", with = "serde_duration")]
    pub interval: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: default_sweep(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// Python module that serves the model.
    #[serde(default = "default_module")]
    pub module: String,
    /// Interpreter used when no environment is activated.
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_true")]
    pub trust_remote_code: bool,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            module: default_module(),
            python: default_python(),
            bind_address: default_bind_address(),
            trust_remote_code: true,
        }
    }
}

fn default_log_dir() -> String {
    "/tmp".to_string()
}
fn default_module() -> String {
    "vllm.entrypoints.openai.api_server".to_string()
}
fn default_python() -> String {
    "python3".to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_documented_values() {
        let config = Config::default();
        assert_eq!(config.ports.range(), PortRange::new(8000, 8100));
        assert_eq!(config.ports.on_exhaustion, ExhaustionPolicy::Fail);
        assert_eq!(config.timeouts.health_interval, Duration::from_secs(3));
        assert_eq!(config.timeouts.health_ceiling, Duration::from_secs(180));
        assert_eq!(config.session.idle_timeout, Duration::from_secs(1800));
        assert_eq!(config.pool.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.activation.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.activation.strictness, Strictness::Any);
        assert_eq!(config.activation.tool_paths.len(), 7);
    }

    #[test]
    fn port_range_is_half_open() {
        let range = PortRange::new(8000, 8010);
        assert!(range.contains(8000));
        assert!(range.contains(8009));
        assert!(!range.contains(8010));
        assert_eq!(range.len(), 10);
        assert!(PortRange::new(9000, 9000).is_empty());
    }

    #[test]
    fn strictness_parses_from_yaml() {
        #[derive(Deserialize)]
        struct Holder {
            strictness: Strictness,
        }
        let h: Holder = serde_yaml::from_str("strictness: all").unwrap();
        assert_eq!(h.strictness, Strictness::All);
        let h: Holder = serde_yaml::from_str("strictness:\n  at_least: 2").unwrap();
        assert_eq!(h.strictness, Strictness::AtLeast(2));
    }

    #[test]
    fn exhaustion_policy_parses_from_yaml() {
        let p: PortsConfig = serde_yaml::from_str("on_exhaustion: range_start").unwrap();
        assert_eq!(p.on_exhaustion, ExhaustionPolicy::RangeStart);
        assert_eq!(p.start, 8000);
        assert_eq!(p.lease_ttl, Duration::from_secs(600));
    }
}
