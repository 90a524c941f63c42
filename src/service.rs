//! Shard distributor service wiring

use crate::common::{Config, Result};
use crate::handler::HeartbeatHandler;
use crate::leader::{ElectionFactory, FactoryParams, NamespaceManager, ShardProcessorFactory};
use crate::store::{BackendTable, ExecutorStore, KvBackend, KvElectionStore, Store};
use std::future::Future;
use std::sync::Arc;

pub struct ShardDistributor {
    config: Config,
    hostname: String,
    backend: Arc<dyn KvBackend>,
    manager: NamespaceManager,
    handler: Arc<HeartbeatHandler>,
}

impl ShardDistributor {
    /// Wire store, election and processors on the backend named in `config`.
    pub fn new(config: Config, hostname: String, backends: &BackendTable) -> Result<Self> {
        config.validate()?;
        let backend = backends.build(&config.leader_election.store)?;
        Ok(Self::with_backend(config, hostname, backend))
    }

    /// Wire everything on an existing backend.
    pub fn with_backend(config: Config, hostname: String, backend: Arc<dyn KvBackend>) -> Self {
        let store_cfg = &config.leader_election.store;
        let store: Arc<dyn Store> = Arc::new(ExecutorStore::new(backend.clone(), store_cfg.prefix.clone()));
        let leader_store = Arc::new(KvElectionStore::new(
            backend.clone(),
            store_cfg.election_prefix.clone(),
            config.leader_election.election.session_ttl,
        ));

        let factory = Arc::new(ElectionFactory::new(FactoryParams {
            hostname: hostname.clone(),
            cfg: config.leader_election.clone(),
            leader_store,
            store: store.clone(),
            process_factory: Arc::new(ShardProcessorFactory::new(config.process.clone())),
        }));
        let manager = NamespaceManager::new(
            factory,
            config.namespaces.clone(),
            config.leader_election.enabled,
        );
        let handler = Arc::new(HeartbeatHandler::new(store, &config.namespaces));

        Self {
            config,
            hostname,
            backend,
            manager,
            handler,
        }
    }

    pub fn handler(&self) -> Arc<HeartbeatHandler> {
        self.handler.clone()
    }

    pub fn backend(&self) -> Arc<dyn KvBackend> {
        self.backend.clone()
    }

    pub fn is_leader(&self, namespace: &str) -> bool {
        self.manager.is_leader(namespace)
    }

    pub fn start(&mut self) -> Result<()> {
        tracing::info!("Starting shard distributor: {}", self.hostname);
        tracing::info!("  Backend: {}", self.config.leader_election.store.backend);
        tracing::info!("  Leader election: {}", self.config.leader_election.enabled);
        for ns in &self.config.namespaces {
            tracing::info!(
                "  Namespace: {} ({:?}, {:?}, {} shards)",
                ns.name,
                ns.namespace_type,
                ns.mode,
                ns.shard_num
            );
        }
        self.manager.start()?;
        tracing::info!("Shard distributor ready");
        Ok(())
    }

    pub async fn stop(&mut self) {
        self.manager.stop().await;
        tracing::info!("Shard distributor stopped");
    }

    /// Run until `shutdown` resolves, then step down everywhere.
    pub async fn serve(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        self.start()?;
        shutdown.await;
        tracing::info!("Shutdown requested");
        self.stop().await;
        Ok(())
    }
}
