//! Common utilities and types shared across the shard distributor

pub mod config;
pub mod error;
pub mod hash;
pub mod utils;

pub use config::{Config, ElectionConfig, LeaderElectionConfig, Namespace, NamespaceMode, NamespaceType, ProcessConfig, StoreConfig};
pub use error::{Error, Result};
pub use hash::{hrw_hash, hrw_weight};
pub use utils::{parse_duration, random_delay, timestamp_now};
