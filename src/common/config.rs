//! Configuration for the shard distributor
//!
//! Values are layered from an optional TOML file and `SHARD_DISTRIBUTOR__*`
//! environment variables (double underscore separates nested keys).

use crate::common::utils::duration_str;
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "SHARD_DISTRIBUTOR";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Leader election and store settings
    #[serde(default)]
    pub leader_election: LeaderElectionConfig,

    /// Namespaces this service distributes shards for
    #[serde(default)]
    pub namespaces: Vec<Namespace>,

    /// Reconciliation settings for the leader-only processor
    #[serde(default)]
    pub process: ProcessConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            leader_election: LeaderElectionConfig::default(),
            namespaces: Vec::new(),
            process: ProcessConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderElectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub election: ElectionConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

fn default_true() -> bool {
    true
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            election: ElectionConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// Timing of the per-namespace elector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Voluntary term limit of one leadership episode
    #[serde(with = "duration_str", default = "default_leader_period")]
    pub leader_period: Duration,

    /// Upper bound of the startup jitter before campaigning
    #[serde(with = "duration_str", default = "default_max_random_delay")]
    pub max_random_delay: Duration,

    /// Pause after a failed campaign
    #[serde(with = "duration_str", default = "default_failed_election_cooldown")]
    pub failed_election_cooldown: Duration,

    /// TTL of the backend session backing the election
    #[serde(with = "duration_str", default = "default_session_ttl")]
    pub session_ttl: Duration,

    /// Bound on each Terminate/Resign step while stepping down
    #[serde(with = "duration_str", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
}

fn default_leader_period() -> Duration {
    Duration::from_secs(600)
}
fn default_max_random_delay() -> Duration {
    Duration::from_secs(10)
}
fn default_failed_election_cooldown() -> Duration {
    Duration::from_secs(10)
}
fn default_session_ttl() -> Duration {
    Duration::from_secs(15)
}
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            leader_period: default_leader_period(),
            max_random_delay: default_max_random_delay(),
            failed_election_cooldown: default_failed_election_cooldown(),
            session_ttl: default_session_ttl(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Coordination backend settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend name, resolved through the backend table
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Key prefix for executor heartbeat and shard state
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Key prefix for leadership state, separate from `prefix`
    #[serde(default = "default_election_prefix")]
    pub election_prefix: String,
}

fn default_backend() -> String {
    "memory".to_string()
}
fn default_prefix() -> String {
    "/shard-distributor/store".to_string()
}
fn default_election_prefix() -> String {
    "/shard-distributor/election".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            prefix: default_prefix(),
            election_prefix: default_election_prefix(),
        }
    }
}

/// Persistence mode of a namespace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    /// Durable, fixed shard set `0..shard_num`
    #[default]
    Fixed,
    /// Shards exist while some executor reports them
    Ephemeral,
}

/// Operating mode of a namespace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceMode {
    /// The leader writes assignments
    #[default]
    Active,
    /// The leader only computes and logs assignments
    Shadow,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,

    #[serde(rename = "type", default)]
    pub namespace_type: NamespaceType,

    #[serde(default)]
    pub mode: NamespaceMode,

    #[serde(default)]
    pub shard_num: u32,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Reconciliation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Fallback period between reconciliations without watch events
    #[serde(with = "duration_str", default = "default_process_period")]
    pub period: Duration,

    /// Executors silent for longer than this are removed
    #[serde(with = "duration_str", default = "default_heartbeat_ttl")]
    pub heartbeat_ttl: Duration,
}

fn default_process_period() -> Duration {
    Duration::from_secs(1)
}
fn default_heartbeat_ttl() -> Duration {
    Duration::from_secs(10)
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            period: default_process_period(),
            heartbeat_ttl: default_heartbeat_ttl(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()));
        }
        let cfg: Config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml(raw: &str) -> Result<Self> {
        let cfg: Config = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let election = &self.leader_election.election;
        if election.leader_period.is_zero() {
            return Err(Error::InvalidConfig("leader_period must be positive".into()));
        }
        if election.session_ttl.is_zero() {
            return Err(Error::InvalidConfig("session_ttl must be positive".into()));
        }
        if election.failed_election_cooldown.is_zero() {
            return Err(Error::InvalidConfig(
                "failed_election_cooldown must be positive".into(),
            ));
        }
        if self.process.period.is_zero() {
            return Err(Error::InvalidConfig("process period must be positive".into()));
        }
        // Heartbeat timestamps have second resolution
        if self.process.heartbeat_ttl < Duration::from_secs(1) {
            return Err(Error::InvalidConfig(
                "heartbeat_ttl must be at least 1s".into(),
            ));
        }

        let mut seen = HashSet::new();
        for ns in &self.namespaces {
            if ns.name.is_empty() {
                return Err(Error::InvalidConfig("namespace name cannot be empty".into()));
            }
            if !seen.insert(ns.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate namespace: {}",
                    ns.name
                )));
            }
            if ns.namespace_type == NamespaceType::Fixed && ns.shard_num == 0 {
                return Err(Error::InvalidConfig(format!(
                    "fixed namespace {} needs shard_num > 0",
                    ns.name
                )));
            }
        }
        Ok(())
    }

    pub fn namespace(&self, name: &str) -> Option<&Namespace> {
        self.namespaces.iter().find(|ns| ns.name == name)
    }
}
