//! [`Store`] implementation over a [`KvBackend`].
//!
//! Key layout, per executor:
//!
//! ```text
//! <prefix>/<namespace>/executors/<executor_id>/heartbeat        unix seconds
//! <prefix>/<namespace>/executors/<executor_id>/state            ACTIVE | DRAINING | DRAINED
//! <prefix>/<namespace>/executors/<executor_id>/reported_shards  JSON map
//! <prefix>/<namespace>/executors/<executor_id>/assigned_shards  JSON map
//! ```

use crate::common::utils::timestamp_now;
use crate::common::{Error, Result};
use crate::store::kv::{KvBackend, Txn, TxnOp, WatchEvent};
use crate::store::{
    AssignedState, Guard, HeartbeatState, NamespaceState, Store, Subscription,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const HEARTBEAT_KEY: &str = "heartbeat";
const STATE_KEY: &str = "state";
const REPORTED_SHARDS_KEY: &str = "reported_shards";
const ASSIGNED_SHARDS_KEY: &str = "assigned_shards";

pub struct ExecutorStore {
    backend: Arc<dyn KvBackend>,
    prefix: String,
}

impl ExecutorStore {
    pub fn new(backend: Arc<dyn KvBackend>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
        }
    }

    fn executor_prefix(&self, namespace: &str) -> String {
        format!("{}/{}/executors/", self.prefix, namespace)
    }

    fn executor_key(&self, namespace: &str, executor_id: &str, key_type: &str) -> String {
        format!("{}{}/{}", self.executor_prefix(namespace), executor_id, key_type)
    }

    /// Ids are single key path segments.
    fn check_executor_id(executor_id: &str) -> Result<()> {
        if executor_id.is_empty() || executor_id.contains('/') {
            return Err(Error::InvalidConfig(format!(
                "invalid executor id: {:?}",
                executor_id
            )));
        }
        Ok(())
    }
}

/// Split `<executor_prefix><executor_id>/<key_type>` into its parts.
fn parse_executor_key<'a>(executor_prefix: &str, key: &'a str) -> Option<(&'a str, &'a str)> {
    let remainder = key.strip_prefix(executor_prefix)?;
    let mut parts = remainder.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(executor_id), Some(key_type), None) if !executor_id.is_empty() => {
            Some((executor_id, key_type))
        }
        _ => None,
    }
}

fn parse_timestamp(raw: &[u8]) -> Result<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            Error::Serialization(format!(
                "invalid heartbeat timestamp: {:?}",
                String::from_utf8_lossy(raw)
            ))
        })
}

fn parse_state(raw: &[u8]) -> Result<crate::store::ExecutorState> {
    std::str::from_utf8(raw)
        .map_err(|e| Error::Serialization(format!("executor state: {}", e)))?
        .parse()
}

/// A change is significant when it is a deletion, or when the executor's
/// state or reported shards actually changed value. Heartbeat refreshes and
/// the leader's own assignment writes never are.
fn is_significant(executor_prefix: &str, event: &WatchEvent) -> bool {
    if event.is_delete() {
        return true;
    }
    match parse_executor_key(executor_prefix, &event.key) {
        Some((_, HEARTBEAT_KEY)) | Some((_, ASSIGNED_SHARDS_KEY)) | None => false,
        Some(_) => event.prev_value.as_deref() != Some(event.value.as_slice()),
    }
}

#[async_trait]
impl Store for ExecutorStore {
    async fn record_heartbeat(&self, namespace: &str, state: HeartbeatState) -> Result<()> {
        Self::check_executor_id(&state.executor_id)?;
        let id = &state.executor_id;

        let reported_shards = serde_json::to_vec(&state.reported_shards)?;
        let txn = Txn::new().and_then([
            TxnOp::put(
                self.executor_key(namespace, id, HEARTBEAT_KEY),
                timestamp_now().to_string(),
            ),
            TxnOp::put(
                self.executor_key(namespace, id, STATE_KEY),
                state.state.as_str(),
            ),
            TxnOp::put(
                self.executor_key(namespace, id, REPORTED_SHARDS_KEY),
                reported_shards,
            ),
        ]);

        self.backend.txn(txn).await?;
        tracing::trace!(namespace, executor_id = %id, state = %state.state, "heartbeat recorded");
        Ok(())
    }

    async fn get_heartbeat(&self, namespace: &str, executor_id: &str) -> Result<HeartbeatState> {
        let executor_prefix = self.executor_key(namespace, executor_id, "");
        let resp = self.backend.get(&executor_prefix, true).await?;

        let not_found = || Error::ExecutorNotFound {
            namespace: namespace.to_string(),
            executor_id: executor_id.to_string(),
        };
        if resp.kvs.is_empty() {
            return Err(not_found());
        }

        let mut state = HeartbeatState {
            executor_id: executor_id.to_string(),
            ..Default::default()
        };
        let mut found = false;
        let namespace_prefix = self.executor_prefix(namespace);
        for kv in &resp.kvs {
            let Some((_, key_type)) = parse_executor_key(&namespace_prefix, &kv.key) else {
                continue;
            };
            found = true;
            match key_type {
                HEARTBEAT_KEY => state.last_heartbeat = parse_timestamp(&kv.value)?,
                STATE_KEY => state.state = parse_state(&kv.value)?,
                REPORTED_SHARDS_KEY => state.reported_shards = serde_json::from_slice(&kv.value)?,
                _ => {}
            }
        }

        if !found {
            return Err(not_found());
        }
        Ok(state)
    }

    async fn get_state(&self, namespace: &str) -> Result<NamespaceState> {
        let executor_prefix = self.executor_prefix(namespace);
        let resp = self.backend.get(&executor_prefix, true).await?;

        let mut snapshot = NamespaceState {
            revision: resp.revision,
            ..Default::default()
        };

        for kv in &resp.kvs {
            let Some((executor_id, key_type)) = parse_executor_key(&executor_prefix, &kv.key)
            else {
                continue;
            };
            let heartbeat = snapshot
                .heartbeats
                .entry(executor_id.to_string())
                .or_insert_with(|| HeartbeatState {
                    executor_id: executor_id.to_string(),
                    ..Default::default()
                });
            let assigned = snapshot
                .assignments
                .entry(executor_id.to_string())
                .or_insert_with(|| AssignedState::new(executor_id));

            match key_type {
                HEARTBEAT_KEY => heartbeat.last_heartbeat = parse_timestamp(&kv.value)?,
                STATE_KEY => heartbeat.state = parse_state(&kv.value)?,
                REPORTED_SHARDS_KEY => {
                    heartbeat.reported_shards = serde_json::from_slice(&kv.value)?;
                    assigned.reported_shards = heartbeat.reported_shards.clone();
                }
                ASSIGNED_SHARDS_KEY => assigned.assigned_shards = serde_json::from_slice(&kv.value)?,
                _ => {}
            }
        }

        Ok(snapshot)
    }

    async fn subscribe(&self, namespace: &str, cancel: CancellationToken) -> Result<Subscription> {
        let executor_prefix = self.executor_prefix(namespace);
        let mut stream = self.backend.watch(&executor_prefix).await?;
        let (tx, rx) = watch::channel(0i64);
        let namespace = namespace.to_string();

        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    item = stream.next() => item,
                };
                match item {
                    Some(Ok(resp)) => {
                        if resp.events.iter().any(|e| is_significant(&executor_prefix, e)) {
                            // Replaces an undelivered revision rather than queueing
                            tx.send_replace(resp.revision);
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(namespace = %namespace, error = %e, "subscription watch failed");
                        break;
                    }
                    None => break,
                }
            }
            tracing::debug!(namespace = %namespace, "subscription closed");
        });

        Ok(rx)
    }

    async fn assign_shards(
        &self,
        namespace: &str,
        new_state: HashMap<String, AssignedState>,
        guard: &Guard,
    ) -> Result<()> {
        let mut ops = Vec::with_capacity(new_state.len());
        for (executor_id, state) in &new_state {
            let value = serde_json::to_vec(&state.assigned_shards)?;
            ops.push(TxnOp::put(
                self.executor_key(namespace, executor_id, ASSIGNED_SHARDS_KEY),
                value,
            ));
        }
        if ops.is_empty() {
            return Ok(());
        }

        let resp = self.backend.txn(Txn::new().guarded_by(guard).and_then(ops)).await?;
        if !resp.succeeded {
            return Err(Error::LeadershipLost(format!(
                "assign shards in {}: transaction failed, leadership may have changed",
                namespace
            )));
        }
        tracing::debug!(namespace, executors = new_state.len(), revision = resp.revision, "shards assigned");
        Ok(())
    }

    async fn delete_executors(
        &self,
        namespace: &str,
        executor_ids: &[String],
        guard: &Guard,
    ) -> Result<()> {
        if executor_ids.is_empty() {
            return Ok(());
        }
        let ops = executor_ids
            .iter()
            .map(|id| TxnOp::delete_prefix(self.executor_key(namespace, id, "")));

        let resp = self.backend.txn(Txn::new().guarded_by(guard).and_then(ops)).await?;
        if !resp.succeeded {
            return Err(Error::LeadershipLost(format!(
                "delete executors in {}: transaction failed, leadership may have changed",
                namespace
            )));
        }
        tracing::info!(namespace, executors = ?executor_ids, "executors deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::kv::EventKind;
    use crate::store::{ExecutorState, MemoryBackend, ShardState};
    use std::collections::BTreeMap;

    const NS: &str = "test-namespace";

    fn store() -> (Arc<MemoryBackend>, ExecutorStore) {
        let backend = Arc::new(MemoryBackend::new());
        let store = ExecutorStore::new(backend.clone(), "/test");
        (backend, store)
    }

    fn heartbeat(id: &str, state: ExecutorState, shards: &[&str]) -> HeartbeatState {
        HeartbeatState {
            executor_id: id.to_string(),
            last_heartbeat: 0,
            state,
            reported_shards: shards
                .iter()
                .map(|s| (s.to_string(), ShardState::default()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_parse_executor_key() {
        let prefix = "/p/ns/executors/";
        assert_eq!(
            parse_executor_key(prefix, "/p/ns/executors/exec-1/state"),
            Some(("exec-1", "state"))
        );
        assert_eq!(parse_executor_key(prefix, "/p/other/executors/exec-1/state"), None);
        assert_eq!(parse_executor_key(prefix, "/p/ns/executors/exec-1"), None);
        assert_eq!(parse_executor_key(prefix, "/p/ns/executors/a/b/c"), None);
    }

    #[test]
    fn test_significance() {
        let prefix = "/p/ns/executors/";
        let event = |key_type: &str, prev: Option<&str>, value: &str| WatchEvent {
            kind: EventKind::Put,
            key: format!("{}exec-1/{}", prefix, key_type),
            value: value.as_bytes().to_vec(),
            prev_value: prev.map(|p| p.as_bytes().to_vec()),
            create_revision: 1,
            mod_revision: 2,
        };

        assert!(!is_significant(prefix, &event(HEARTBEAT_KEY, Some("1"), "2")));
        assert!(!is_significant(prefix, &event(ASSIGNED_SHARDS_KEY, None, "{}")));
        assert!(!is_significant(prefix, &event(STATE_KEY, Some("ACTIVE"), "ACTIVE")));
        assert!(is_significant(prefix, &event(STATE_KEY, Some("ACTIVE"), "DRAINING")));
        assert!(is_significant(prefix, &event(REPORTED_SHARDS_KEY, None, "{}")));

        let mut delete = event(HEARTBEAT_KEY, Some("1"), "");
        delete.kind = EventKind::Delete;
        assert!(is_significant(prefix, &delete));
    }

    #[tokio::test]
    async fn test_heartbeat_upsert_and_read() {
        let (_, store) = store();
        store
            .record_heartbeat(NS, heartbeat("exec-1", ExecutorState::Active, &["1", "2"]))
            .await
            .unwrap();

        let got = store.get_heartbeat(NS, "exec-1").await.unwrap();
        assert_eq!(got.executor_id, "exec-1");
        assert_eq!(got.state, ExecutorState::Active);
        assert_eq!(got.reported_shards.len(), 2);
        assert!(got.last_heartbeat > 0);
    }

    #[tokio::test]
    async fn test_get_heartbeat_not_found() {
        let (_, store) = store();
        store
            .record_heartbeat(NS, heartbeat("exec-10", ExecutorState::Active, &[]))
            .await
            .unwrap();

        // "exec-1" must not match keys of "exec-10"
        let err = store.get_heartbeat(NS, "exec-1").await.unwrap_err();
        assert!(matches!(err, Error::ExecutorNotFound { .. }));
    }

    #[tokio::test]
    async fn test_invalid_executor_id_rejected() {
        let (_, store) = store();
        let err = store
            .record_heartbeat(NS, heartbeat("a/b", ExecutorState::Active, &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_malformed_shards_is_serialization_error() {
        let (backend, store) = store();
        backend
            .txn(Txn::new().and_then([TxnOp::put(
                format!("/test/{}/executors/exec-1/reported_shards", NS),
                "not json",
            )]))
            .await
            .unwrap();

        assert!(matches!(
            store.get_heartbeat(NS, "exec-1").await,
            Err(Error::Serialization(_))
        ));
        assert!(matches!(store.get_state(NS).await, Err(Error::Serialization(_))));
    }

    #[tokio::test]
    async fn test_get_state_snapshot() {
        let (backend, store) = store();
        store
            .record_heartbeat(NS, heartbeat("exec-1", ExecutorState::Active, &["1"]))
            .await
            .unwrap();
        store
            .record_heartbeat(NS, heartbeat("exec-2", ExecutorState::Draining, &[]))
            .await
            .unwrap();
        store
            .record_heartbeat("other", heartbeat("exec-3", ExecutorState::Active, &[]))
            .await
            .unwrap();

        let snapshot = store.get_state(NS).await.unwrap();
        assert_eq!(snapshot.heartbeats.len(), 2);
        assert_eq!(snapshot.assignments.len(), 2);
        assert_eq!(snapshot.heartbeats["exec-2"].state, ExecutorState::Draining);
        assert_eq!(snapshot.assignments["exec-1"].reported_shards.len(), 1);
        assert!(snapshot.assignments["exec-1"].assigned_shards.is_empty());
        assert_eq!(snapshot.revision, backend.revision());
    }

    #[tokio::test]
    async fn test_empty_mutations_are_noops() {
        let (backend, store) = store();
        let stale = Guard::new("/nowhere", 99);
        let before = backend.revision();

        store.assign_shards(NS, HashMap::new(), &stale).await.unwrap();
        store.delete_executors(NS, &[], &stale).await.unwrap();
        assert_eq!(backend.revision(), before);
    }

    #[tokio::test]
    async fn test_subscription_closes_when_watch_fails() {
        let backend = Arc::new(MemoryBackend::with_watch_capacity(1));
        let store = ExecutorStore::new(backend.clone(), "/test");
        let mut sub = store.subscribe(NS, CancellationToken::new()).await.unwrap();

        // The watcher cannot keep up and lags
        for i in 0..10 {
            let id = format!("exec-{}", i);
            store
                .record_heartbeat(NS, heartbeat(&id, ExecutorState::Active, &[]))
                .await
                .unwrap();
        }

        let closed = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while sub.changed().await.is_ok() {}
        })
        .await;
        assert!(closed.is_ok(), "subscription still open after watch failure");
    }
}
