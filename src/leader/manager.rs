//! Runs one elector per configured namespace.

use crate::common::config::Namespace;
use crate::common::Result;
use crate::leader::election::ElectionFactory;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct NamespaceManager {
    factory: Arc<ElectionFactory>,
    namespaces: Vec<Namespace>,
    enabled: bool,
    cancel: CancellationToken,
    leading: Arc<Mutex<HashMap<String, bool>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl NamespaceManager {
    pub fn new(factory: Arc<ElectionFactory>, namespaces: Vec<Namespace>, enabled: bool) -> Self {
        Self {
            factory,
            namespaces,
            enabled,
            cancel: CancellationToken::new(),
            leading: Arc::new(Mutex::new(HashMap::new())),
            tasks: Vec::new(),
        }
    }

    /// Start an elector for every namespace. Does nothing when leader
    /// election is disabled.
    pub fn start(&mut self) -> Result<()> {
        if !self.enabled {
            tracing::info!("Leader election disabled, not starting electors");
            return Ok(());
        }

        for namespace in &self.namespaces {
            let elector = self.factory.create_elector(namespace.clone())?;
            let mut leadership = elector.run(self.cancel.child_token());
            let leading = self.leading.clone();
            let name = namespace.name.clone();

            self.tasks.push(tokio::spawn(async move {
                while let Some(is_leader) = leadership.recv().await {
                    if is_leader {
                        tracing::info!(namespace = %name, "gained leadership");
                    } else {
                        tracing::info!(namespace = %name, "lost leadership");
                    }
                    leading
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(name.clone(), is_leader);
                }
                leading
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&name);
            }));
        }

        tracing::info!("Started {} namespace electors", self.tasks.len());
        Ok(())
    }

    /// Is this instance currently leading `namespace`?
    pub fn is_leader(&self, namespace: &str) -> bool {
        self.leading
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .copied()
            .unwrap_or(false)
    }

    /// Stop every elector and wait until each has stepped down.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!("Elector task failed: {}", e);
            }
        }
        tracing::info!("All namespace electors stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::{ElectionConfig, LeaderElectionConfig};
    use crate::leader::election::FactoryParams;
    use crate::leader::process::ShardProcessorFactory;
    use crate::store::{ExecutorStore, KvBackend, KvElectionStore, MemoryBackend};
    use std::time::Duration;

    fn factory(backend: Arc<MemoryBackend>, enabled: bool) -> Arc<ElectionFactory> {
        let cfg = LeaderElectionConfig {
            enabled,
            election: ElectionConfig {
                max_random_delay: Duration::from_millis(10),
                ..Default::default()
            },
            ..Default::default()
        };
        Arc::new(ElectionFactory::new(FactoryParams {
            hostname: "host-a".to_string(),
            leader_store: Arc::new(KvElectionStore::new(
                backend.clone(),
                "/election",
                cfg.election.session_ttl,
            )),
            store: Arc::new(ExecutorStore::new(backend, "/store")),
            process_factory: Arc::new(ShardProcessorFactory::new(Default::default())),
            cfg,
        }))
    }

    fn namespaces() -> Vec<Namespace> {
        ["orders", "payments"]
            .into_iter()
            .map(|name| Namespace {
                shard_num: 4,
                ..Namespace::new(name)
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_leads_every_namespace_then_stops() {
        let backend = Arc::new(MemoryBackend::new());
        let mut manager = NamespaceManager::new(factory(backend.clone(), true), namespaces(), true);
        manager.start().unwrap();

        tokio::time::timeout(Duration::from_secs(30), async {
            while !(manager.is_leader("orders") && manager.is_leader("payments")) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        manager.stop().await;
        assert!(!manager.is_leader("orders"));
        assert!(backend.get("/election/", true).await.unwrap().kvs.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_starts_nothing() {
        let backend = Arc::new(MemoryBackend::new());
        let mut manager = NamespaceManager::new(factory(backend, false), namespaces(), false);
        manager.start().unwrap();
        assert!(manager.tasks.is_empty());
        manager.stop().await;
    }
}
