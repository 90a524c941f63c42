//! Leader-only work: keep a namespace's shard assignment reconciled.

use crate::common::config::{Namespace, NamespaceMode, ProcessConfig};
use crate::common::utils::{retry_with_backoff, timestamp_now};
use crate::common::{Error, Result};
use crate::leader::assignment;
use crate::store::{Election, Store, Subscription};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const STATE_READ_RETRIES: usize = 3;
const STATE_READ_BACKOFF: Duration = Duration::from_millis(100);

/// Work that runs only while leading a namespace.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Start leader work. Implementations may return once background work is
    /// started, or block until `cancel` fires. `cancel` fires when the
    /// leadership episode ends, before [`Processor::terminate`] is called.
    /// An error returned at any point ends leadership.
    async fn run(&self, cancel: CancellationToken) -> Result<()>;

    /// Stop background work and wait for it to finish.
    async fn terminate(&self) -> Result<()>;
}

/// Creates one [`Processor`] per leadership episode.
pub trait ProcessorFactory: Send + Sync {
    fn create_processor(
        &self,
        namespace: &Namespace,
        store: Arc<dyn Store>,
        election: Arc<dyn Election>,
    ) -> Box<dyn Processor>;
}

pub struct ShardProcessorFactory {
    cfg: ProcessConfig,
}

impl ShardProcessorFactory {
    pub fn new(cfg: ProcessConfig) -> Self {
        Self { cfg }
    }
}

impl ProcessorFactory for ShardProcessorFactory {
    fn create_processor(
        &self,
        namespace: &Namespace,
        store: Arc<dyn Store>,
        election: Arc<dyn Election>,
    ) -> Box<dyn Processor> {
        Box::new(ShardProcessor::new(
            namespace.clone(),
            store,
            election,
            self.cfg.clone(),
        ))
    }
}

struct Reconciler {
    namespace: Namespace,
    store: Arc<dyn Store>,
    election: Arc<dyn Election>,
    cfg: ProcessConfig,
}

/// Reconciles on every significant namespace change, and periodically.
pub struct ShardProcessor {
    reconciler: Arc<Reconciler>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ShardProcessor {
    pub fn new(
        namespace: Namespace,
        store: Arc<dyn Store>,
        election: Arc<dyn Election>,
        cfg: ProcessConfig,
    ) -> Self {
        Self {
            reconciler: Arc::new(Reconciler {
                namespace,
                store,
                election,
                cfg,
            }),
            running: Mutex::new(None),
        }
    }

    /// Run a single reconciliation pass.
    pub async fn rebalance(&self) -> Result<()> {
        self.reconciler.rebalance().await
    }
}

#[async_trait]
impl Processor for ShardProcessor {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::Internal(format!(
                "processor for {} already running",
                self.reconciler.namespace.name
            )));
        }

        let token = cancel.child_token();
        let subscription = self
            .reconciler
            .store
            .subscribe(&self.reconciler.namespace.name, token.clone())
            .await?;

        let handle = tokio::spawn(self.reconciler.clone().run_loop(token.clone(), subscription));
        *running = Some((token, handle));
        tracing::info!("Processor started for namespace {}", self.reconciler.namespace.name);
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        let Some((token, handle)) = self.running.lock().await.take() else {
            return Ok(());
        };
        token.cancel();
        handle
            .await
            .map_err(|e| Error::Internal(format!("processor task failed: {}", e)))?;
        tracing::info!("Processor stopped for namespace {}", self.reconciler.namespace.name);
        Ok(())
    }
}

/// Next subscription value, or `None` once it closed. Pends forever without one.
async fn next_change(subscription: &mut Option<Subscription>) -> Option<i64> {
    match subscription {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

impl Reconciler {
    async fn run_loop(self: Arc<Self>, cancel: CancellationToken, subscription: Subscription) {
        let namespace = self.namespace.name.clone();
        let mut subscription = Some(subscription);
        let mut ticker = tokio::time::interval(self.cfg.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if subscription.is_none() {
                        match self.store.subscribe(&namespace, cancel.clone()).await {
                            Ok(rx) => subscription = Some(rx),
                            Err(e) => tracing::warn!(namespace = %namespace, error = %e, "resubscribe failed"),
                        }
                    }
                }
                change = next_change(&mut subscription) => match change {
                    Some(revision) => tracing::debug!(namespace = %namespace, revision, "namespace changed"),
                    None => {
                        tracing::warn!(namespace = %namespace, "subscription closed, falling back to periodic reconciliation");
                        subscription = None;
                        continue;
                    }
                },
            }

            if let Err(e) = self.rebalance().await {
                if e.is_leadership_lost() {
                    tracing::warn!(namespace = %namespace, error = %e, "reconciliation aborted, leadership lost");
                } else {
                    tracing::error!(namespace = %namespace, error = %e, "reconciliation failed");
                }
            }
        }
    }

    async fn rebalance(&self) -> Result<()> {
        let namespace = &self.namespace.name;
        let state = retry_with_backoff(
            || self.store.get_state(namespace),
            STATE_READ_RETRIES,
            STATE_READ_BACKOFF,
        )
        .await?;

        let plan = assignment::plan(&self.namespace, &state, timestamp_now(), self.cfg.heartbeat_ttl);
        if !plan.unassigned.is_empty() {
            tracing::warn!(
                namespace = %namespace,
                shards = plan.unassigned.len(),
                "no ACTIVE executor for some shards"
            );
        }
        if plan.is_noop() {
            return Ok(());
        }

        if self.namespace.mode == NamespaceMode::Shadow {
            tracing::info!(
                namespace = %namespace,
                stale = ?plan.stale,
                changed = ?plan.changed.keys().collect::<Vec<_>>(),
                "shadow mode, assignment not written"
            );
            return Ok(());
        }

        let guard = self.election.guard()?;
        if !plan.stale.is_empty() {
            self.store.delete_executors(namespace, &plan.stale, &guard).await?;
            tracing::info!(namespace = %namespace, executors = ?plan.stale, "removed stale executors");
        }
        if !plan.changed.is_empty() {
            let count = plan.changed.len();
            self.store.assign_shards(namespace, plan.changed, &guard).await?;
            tracing::info!(namespace = %namespace, executors = count, revision = state.revision, "assignment updated");
        }
        Ok(())
    }
}
