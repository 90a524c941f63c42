//! Coordination store: executor heartbeats, shard ownership and leadership.
//!
//! - [`Store`]: namespaced heartbeat/shard state with guarded mutation
//! - [`Election`] / [`ElectionStore`]: per-namespace mutual exclusion
//! - [`kv`]: the backend contract both are built on
//! - [`memory`]: in-process backend, [`registry`]: backend table

pub mod election;
pub mod executor_store;
pub mod kv;
pub mod memory;
pub mod registry;

use crate::common::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use election::{KvElection, KvElectionStore};
pub use executor_store::ExecutorStore;
pub use kv::{Compare, KvBackend, Txn, TxnOp};
pub use memory::MemoryBackend;
pub use registry::BackendTable;

/// Liveness/role of an executor as reported in its heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutorState {
    #[default]
    Active,
    Draining,
    Drained,
}

impl ExecutorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorState::Active => "ACTIVE",
            ExecutorState::Draining => "DRAINING",
            ExecutorState::Drained => "DRAINED",
        }
    }

    /// Can this executor take new shards?
    pub fn accepts_shards(&self) -> bool {
        matches!(self, ExecutorState::Active)
    }
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutorState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ACTIVE" => Ok(ExecutorState::Active),
            "DRAINING" => Ok(ExecutorState::Draining),
            "DRAINED" => Ok(ExecutorState::Drained),
            other => Err(Error::Serialization(format!(
                "unknown executor state: {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardStatus {
    #[default]
    Ready,
    Done,
}

/// What an executor reports about a shard it believes it owns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardState {
    #[serde(default)]
    pub status: ShardStatus,
    #[serde(default)]
    pub load: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentStatus {
    #[default]
    Ready,
}

/// Ownership of a shard as decided by the leader.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    #[serde(default)]
    pub status: AssignmentStatus,
}

/// Executor-written liveness record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeartbeatState {
    pub executor_id: String,
    /// Unix seconds of the last heartbeat, stamped by the store
    pub last_heartbeat: i64,
    pub state: ExecutorState,
    pub reported_shards: BTreeMap<String, ShardState>,
}

/// Leader-written ownership record, with the executor's report mirrored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssignedState {
    pub executor_id: String,
    pub reported_shards: BTreeMap<String, ShardState>,
    pub assigned_shards: BTreeMap<String, ShardAssignment>,
}

impl AssignedState {
    pub fn new(executor_id: impl Into<String>) -> Self {
        Self {
            executor_id: executor_id.into(),
            ..Default::default()
        }
    }
}

/// Point-in-time snapshot of one namespace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamespaceState {
    pub heartbeats: HashMap<String, HeartbeatState>,
    pub assignments: HashMap<String, AssignedState>,
    /// Backend revision the snapshot was read at
    pub revision: i64,
}

/// Leadership-validity precondition for guarded writes.
///
/// Holds while the leader key still exists with the create revision it had
/// when leadership was granted. A new leader always has a different key or a
/// later create revision, so a stale guard can never commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Guard {
    leader_key: String,
    create_revision: i64,
}

impl Guard {
    pub fn new(leader_key: impl Into<String>, create_revision: i64) -> Self {
        Self {
            leader_key: leader_key.into(),
            create_revision,
        }
    }

    pub fn leader_key(&self) -> &str {
        &self.leader_key
    }

    pub fn create_revision(&self) -> i64 {
        self.create_revision
    }

    pub fn compare(&self) -> Compare {
        Compare::create_revision(self.leader_key.clone(), self.create_revision)
    }
}

/// Latest significant revision of a namespace; closes when the watch ends.
pub type Subscription = tokio::sync::watch::Receiver<i64>;

/// Namespaced executor heartbeat and shard state.
#[async_trait]
pub trait Store: Send + Sync {
    /// Upsert heartbeat time, state and reported shards in one transaction.
    async fn record_heartbeat(&self, namespace: &str, state: HeartbeatState) -> Result<()>;

    async fn get_heartbeat(&self, namespace: &str, executor_id: &str) -> Result<HeartbeatState>;

    async fn get_state(&self, namespace: &str) -> Result<NamespaceState>;

    /// Watch the namespace for executor state, reported shard and deletion
    /// changes. Heartbeat refreshes and assignment writes are filtered out.
    async fn subscribe(&self, namespace: &str, cancel: CancellationToken) -> Result<Subscription>;

    async fn assign_shards(
        &self,
        namespace: &str,
        new_state: HashMap<String, AssignedState>,
        guard: &Guard,
    ) -> Result<()>;

    async fn delete_executors(
        &self,
        namespace: &str,
        executor_ids: &[String],
        guard: &Guard,
    ) -> Result<()>;
}

/// One namespace's distributed lock.
#[async_trait]
pub trait Election: Send + Sync {
    /// Block until `hostname` holds leadership, or fail.
    async fn campaign(&self, hostname: &str) -> Result<()>;

    /// Release leadership. Succeeds when leadership was already gone.
    async fn resign(&self) -> Result<()>;

    /// Fires when leadership is lost without a resign (session expiry).
    fn done(&self) -> CancellationToken;

    /// Precondition for writes made under the current leadership grant.
    fn guard(&self) -> Result<Guard>;

    /// Release backend resources held by this election.
    async fn cleanup(&self) -> Result<()>;
}

/// Creates elections for namespaces.
#[async_trait]
pub trait ElectionStore: Send + Sync {
    async fn create_election(&self, namespace: &str) -> Result<Arc<dyn Election>>;
}
