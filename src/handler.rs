//! Executor-facing heartbeat entry point.

use crate::common::config::Namespace;
use crate::common::{Error, Result};
use crate::store::{ExecutorState, HeartbeatState, ShardState, Store};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub namespace: String,
    pub executor_id: String,
    #[serde(default)]
    pub state: ExecutorState,
    #[serde(default)]
    pub reported_shards: BTreeMap<String, ShardState>,
}

pub struct HeartbeatHandler {
    store: Arc<dyn Store>,
    namespaces: HashSet<String>,
}

impl HeartbeatHandler {
    pub fn new(store: Arc<dyn Store>, namespaces: &[Namespace]) -> Self {
        Self {
            store,
            namespaces: namespaces.iter().map(|ns| ns.name.clone()).collect(),
        }
    }

    /// Record an executor heartbeat in a configured namespace.
    pub async fn heartbeat(&self, request: HeartbeatRequest) -> Result<()> {
        if !self.namespaces.contains(&request.namespace) {
            return Err(Error::NamespaceNotFound(request.namespace));
        }
        if request.executor_id.is_empty() {
            return Err(Error::InvalidConfig("executor_id cannot be empty".into()));
        }

        tracing::debug!(
            namespace = %request.namespace,
            executor_id = %request.executor_id,
            state = %request.state,
            shards = request.reported_shards.len(),
            "heartbeat"
        );
        self.store
            .record_heartbeat(
                &request.namespace,
                HeartbeatState {
                    executor_id: request.executor_id,
                    last_heartbeat: 0,
                    state: request.state,
                    reported_shards: request.reported_shards,
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ExecutorStore, MemoryBackend};

    fn handler() -> (Arc<ExecutorStore>, HeartbeatHandler) {
        let store = Arc::new(ExecutorStore::new(Arc::new(MemoryBackend::new()), "/store"));
        let handler = HeartbeatHandler::new(store.clone(), &[Namespace::new("orders")]);
        (store, handler)
    }

    #[tokio::test]
    async fn test_heartbeat_recorded() {
        let (store, handler) = handler();
        handler
            .heartbeat(HeartbeatRequest {
                namespace: "orders".into(),
                executor_id: "exec-1".into(),
                state: ExecutorState::Draining,
                ..Default::default()
            })
            .await
            .unwrap();

        let hb = store.get_heartbeat("orders", "exec-1").await.unwrap();
        assert_eq!(hb.state, ExecutorState::Draining);
        assert!(hb.last_heartbeat > 0);
    }

    #[tokio::test]
    async fn test_unknown_namespace_rejected() {
        let (_, handler) = handler();
        let err = handler
            .heartbeat(HeartbeatRequest {
                namespace: "refunds".into(),
                executor_id: "exec-1".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NamespaceNotFound(ns) if ns == "refunds"));
    }

    #[tokio::test]
    async fn test_empty_executor_rejected() {
        let (_, handler) = handler();
        let err = handler
            .heartbeat(HeartbeatRequest {
                namespace: "orders".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_request_from_json() {
        let req: HeartbeatRequest = serde_json::from_str(
            r#"{"namespace":"orders","executor_id":"e1","reported_shards":{"3":{"status":"DONE"}}}"#,
        )
        .unwrap();
        assert_eq!(req.state, ExecutorState::Active);
        assert_eq!(req.reported_shards["3"].status, crate::store::ShardStatus::Done);
    }
}
