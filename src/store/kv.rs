//! Backend contract for a replicated, linearizable key-value store.
//!
//! The shape follows etcd: every mutation bumps a store-wide revision, keys
//! remember the revision that created and last modified them, transactions
//! are "if all compares hold then apply all ops", and leases own keys that
//! disappear with them.

use crate::common::Result;
use crate::store::Guard;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::time::Duration;

pub type LeaseId = i64;

/// A stored key with its revisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub lease: Option<LeaseId>,
}

/// Result of a point or prefix read.
#[derive(Debug, Clone, Default)]
pub struct GetResponse {
    pub kvs: Vec<KeyValue>,
    /// Store revision at the time of the read
    pub revision: i64,
}

/// Transaction precondition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    /// Key's create revision equals `revision`; `0` means the key is absent.
    CreateRevision { key: String, revision: i64 },
}

impl Compare {
    pub fn create_revision(key: impl Into<String>, revision: i64) -> Self {
        Compare::CreateRevision {
            key: key.into(),
            revision,
        }
    }

    pub fn absent(key: impl Into<String>) -> Self {
        Self::create_revision(key, 0)
    }
}

/// Transaction operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put {
        key: String,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    },
    /// Delete one key, or every key under `key` when `prefix` is set.
    Delete { key: String, prefix: bool },
}

impl TxnOp {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            lease: None,
        }
    }

    pub fn put_with_lease(key: impl Into<String>, value: impl Into<Vec<u8>>, lease: LeaseId) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            lease: Some(lease),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete {
            key: key.into(),
            prefix: false,
        }
    }

    pub fn delete_prefix(prefix: impl Into<String>) -> Self {
        TxnOp::Delete {
            key: prefix.into(),
            prefix: true,
        }
    }
}

/// Transaction builder: all `compares` must hold for `ops` to be applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Txn {
    compares: Vec<Compare>,
    ops: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: Compare) -> Self {
        self.compares.push(compare);
        self
    }

    /// Attach the leadership-validity precondition carried by `guard`.
    pub fn guarded_by(self, guard: &Guard) -> Self {
        self.when(guard.compare())
    }

    pub fn and_then(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.ops.extend(ops);
        self
    }

    pub fn compares(&self) -> &[Compare] {
        &self.compares
    }

    pub fn ops(&self) -> &[TxnOp] {
        &self.ops
    }

    pub fn into_parts(self) -> (Vec<Compare>, Vec<TxnOp>) {
        (self.compares, self.ops)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnResponse {
    /// Whether every compare held and the ops were applied
    pub succeeded: bool,
    /// Store revision after the transaction
    pub revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// One key change observed by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// New value (empty for deletes)
    pub value: Vec<u8>,
    /// Value before this change, if the key existed
    pub prev_value: Option<Vec<u8>>,
    pub create_revision: i64,
    pub mod_revision: i64,
}

impl WatchEvent {
    pub fn is_modify(&self) -> bool {
        self.kind == EventKind::Put && self.create_revision != self.mod_revision
    }

    pub fn is_delete(&self) -> bool {
        self.kind == EventKind::Delete
    }
}

/// All events committed at one revision under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchResponse {
    pub revision: i64,
    pub events: Vec<WatchEvent>,
}

/// Ends when the watch is closed; an `Err` item means the watch failed.
pub type WatchStream = BoxStream<'static, Result<WatchResponse>>;

/// Linearizable KV backend consumed by the store and the election recipe.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str, prefix: bool) -> Result<GetResponse>;

    async fn txn(&self, txn: Txn) -> Result<TxnResponse>;

    /// Watch every change under `prefix` committed after this call.
    async fn watch(&self, prefix: &str) -> Result<WatchStream>;

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;

    /// Revoke the lease, deleting every key attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_builder_keeps_order() {
        let guard = Guard::new("/election/ns/1", 7);
        let txn = Txn::new()
            .guarded_by(&guard)
            .and_then([TxnOp::put("a", "1"), TxnOp::delete_prefix("b/")]);

        assert_eq!(txn.compares(), &[Compare::create_revision("/election/ns/1", 7)]);
        assert_eq!(txn.ops().len(), 2);
        assert_eq!(txn.ops()[1], TxnOp::delete_prefix("b/"));
    }

    #[test]
    fn test_event_kinds() {
        let mut event = WatchEvent {
            kind: EventKind::Put,
            key: "k".into(),
            value: b"v".to_vec(),
            prev_value: None,
            create_revision: 3,
            mod_revision: 3,
        };
        assert!(!event.is_modify());
        event.mod_revision = 4;
        assert!(event.is_modify());
        event.kind = EventKind::Delete;
        assert!(event.is_delete());
        assert!(!event.is_modify());
    }
}
