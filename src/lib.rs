//! # shard-distributor
//!
//! Coordination core of a shard distributor:
//! - Executors heartbeat their state and the shards they run
//! - One leader per namespace, elected over backend leases
//! - The leader reconciles shard ownership with guarded writes
//! - Leadership rotates voluntarily after a configured period
//!
//! ## Architecture
//!
//! ```text
//!  executors ──heartbeat──▶ HeartbeatHandler ──▶ Store (ExecutorStore)
//!                                                   │  ▲
//!                                          subscribe│  │assign / delete (guarded)
//!                                                   ▼  │
//! ┌──────────────── NamespaceManager ────────────────────────────┐
//! │  Elector(ns-a)  ── campaign/resign ──▶ Election (KvElection)  │
//! │     └─ leading ─▶ ShardProcessor(ns-a)                        │
//! │  Elector(ns-b)  ...                                           │
//! └───────────────────────────────┬───────────────────────────────┘
//!                                 ▼
//!                         KvBackend (memory, ...)
//! ```
//!
//! ## Usage
//!
//! ```bash
//! shard-distributor serve --config ./distributor.toml --hostname node-1
//! ```

pub mod common;
pub mod handler;
pub mod leader;
pub mod service;
pub mod store;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use handler::{HeartbeatHandler, HeartbeatRequest};
pub use service::ShardDistributor;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
