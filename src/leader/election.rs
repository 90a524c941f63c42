//! Per-namespace leader elector.
//!
//! ```text
//! Idle -> Waiting (jitter) -> Campaigning -> Leading -> Resigning -+
//!              ^                  |  ^                             |
//!              |                  v  |                             |
//!              |               Cooldown                            |
//!              +---------------------------------------------------+
//! ```
//!
//! Each contention cycle opens a fresh [`Election`], so a lost session is
//! never reused. While leading, the namespace processor runs; stepping down
//! always terminates the processor before resigning, and resigns before
//! `false` is published on the leadership channel.

use crate::common::config::{ElectionConfig, LeaderElectionConfig, Namespace};
use crate::common::utils::random_delay;
use crate::common::{Error, Result};
use crate::leader::process::{Processor, ProcessorFactory};
use crate::store::{Election, ElectionStore, Store};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Everything an [`ElectionFactory`] needs, passed in explicitly.
pub struct FactoryParams {
    pub hostname: String,
    pub cfg: LeaderElectionConfig,
    pub leader_store: Arc<dyn ElectionStore>,
    pub store: Arc<dyn Store>,
    pub process_factory: Arc<dyn ProcessorFactory>,
}

/// Builds one [`Elector`] per namespace from shared dependencies.
pub struct ElectionFactory {
    hostname: String,
    cfg: LeaderElectionConfig,
    leader_store: Arc<dyn ElectionStore>,
    store: Arc<dyn Store>,
    process_factory: Arc<dyn ProcessorFactory>,
}

impl ElectionFactory {
    pub fn new(params: FactoryParams) -> Self {
        Self {
            hostname: params.hostname,
            cfg: params.cfg,
            leader_store: params.leader_store,
            store: params.store,
            process_factory: params.process_factory,
        }
    }

    pub fn create_elector(&self, namespace: Namespace) -> Result<Elector> {
        if !self.cfg.enabled {
            return Err(Error::InvalidConfig(format!(
                "leader election is disabled, no elector for {}",
                namespace.name
            )));
        }
        Ok(Elector {
            hostname: self.hostname.clone(),
            namespace,
            cfg: self.cfg.election.clone(),
            leader_store: self.leader_store.clone(),
            store: self.store.clone(),
            process_factory: self.process_factory.clone(),
        })
    }
}

pub struct Elector {
    hostname: String,
    namespace: Namespace,
    cfg: ElectionConfig,
    leader_store: Arc<dyn ElectionStore>,
    store: Arc<dyn Store>,
    process_factory: Arc<dyn ProcessorFactory>,
}

impl Elector {
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Start contending in the background.
    ///
    /// The returned channel carries `true` on gaining leadership and `false`
    /// on losing it, and closes once `cancel` fired and the elector stopped.
    pub fn run(self, cancel: CancellationToken) -> mpsc::Receiver<bool> {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move { self.run_loop(cancel, tx).await });
        rx
    }

    async fn run_loop(self, cancel: CancellationToken, tx: mpsc::Sender<bool>) {
        tracing::info!(namespace = %self.namespace.name, hostname = %self.hostname, "elector started");
        let mut jitter = true;

        while !cancel.is_cancelled() {
            match self.run_election(&cancel, &tx, jitter).await {
                Ok(()) => jitter = true,
                Err(_) if cancel.is_cancelled() => break,
                Err(e) => {
                    tracing::error!(
                        namespace = %self.namespace.name,
                        error = %e,
                        cooldown = ?self.cfg.failed_election_cooldown,
                        "election failed, cooling down"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.cfg.failed_election_cooldown) => {}
                    }
                    jitter = false;
                }
            }
        }

        tracing::info!(namespace = %self.namespace.name, "elector stopped");
    }

    /// One contention cycle on a fresh election. Returns `Ok` after a
    /// completed leadership episode, `Err` when campaigning or the processor
    /// failed.
    async fn run_election(
        &self,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<bool>,
        jitter: bool,
    ) -> Result<()> {
        let election = self.leader_store.create_election(&self.namespace.name).await?;
        let elected = self.campaign(election.as_ref(), cancel, jitter).await;
        let led = elected.is_ok();
        let result = match elected {
            Ok(()) => self.lead(election.clone(), cancel, tx).await,
            Err(e) => Err(e),
        };

        if let Err(e) = election.cleanup().await {
            tracing::warn!(namespace = %self.namespace.name, error = %e, "election cleanup failed");
        }
        if led {
            self.publish(tx, false, cancel).await;
        }
        result
    }

    async fn campaign(&self, election: &dyn Election, cancel: &CancellationToken, jitter: bool) -> Result<()> {
        let namespace = &self.namespace.name;

        if jitter {
            let delay = random_delay(self.cfg.max_random_delay);
            tracing::debug!(namespace = %namespace, ?delay, "waiting before campaign");
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::debug!(namespace = %namespace, "campaigning");
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = election.campaign(&self.hostname) => res.map_err(|e| match e {
                Error::Campaign(_) => e,
                other => Error::Campaign(other.to_string()),
            }),
        }
    }

    /// Lead until the session is lost, the leader period elapses, the
    /// elector is cancelled or the processor fails, then step down.
    async fn lead(
        &self,
        election: Arc<dyn Election>,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<bool>,
    ) -> Result<()> {
        let namespace = &self.namespace.name;
        let processor =
            self.process_factory
                .create_processor(&self.namespace, self.store.clone(), election.clone());
        let episode = cancel.child_token();
        let done = election.done();

        // A run still pending after its first poll has started; it may keep
        // running until the episode token fires.
        let mut run = processor.run(episode.clone());
        let started = tokio::select! {
            biased;
            res = &mut run => Some(res),
            _ = std::future::ready(()) => None,
        };
        let mut running = started.is_none();

        let outcome = match started {
            Some(Err(e)) => Err(Error::on_leader(e)),
            _ => {
                tracing::info!(namespace = %namespace, hostname = %self.hostname, "became leader");
                let announce = tx.send(true);
                tokio::pin!(announce);
                let mut announced = false;
                let period = tokio::time::sleep(self.cfg.leader_period);
                tokio::pin!(period);

                loop {
                    tokio::select! {
                        _ = &mut announce, if !announced => announced = true,
                        res = &mut run, if running => {
                            running = false;
                            if let Err(e) = res {
                                break Err(Error::on_leader(e));
                            }
                        }
                        _ = done.cancelled() => break Ok("leadership lost"),
                        _ = &mut period => break Ok("leader period elapsed"),
                        _ = cancel.cancelled() => break Ok("elector stopping"),
                    }
                }
            }
        };

        episode.cancel();
        if running {
            let limit = self.cfg.shutdown_timeout;
            match timeout(limit, &mut run).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(namespace = %namespace, error = %e, "processor run failed while stopping"),
                Err(_) => tracing::warn!(namespace = %namespace, ?limit, "processor run did not stop"),
            }
        }

        match outcome {
            Ok(reason) => {
                tracing::info!(namespace = %namespace, reason, "stepping down");
                self.step_down(processor.as_ref(), election.as_ref()).await;
                Ok(())
            }
            Err(err) => {
                tracing::error!(namespace = %namespace, error = %err, "leader processor failed");
                self.step_down(processor.as_ref(), election.as_ref()).await;
                Err(err)
            }
        }
    }

    /// Deliver a leadership transition. Once `cancel` fired, a transition
    /// the consumer has no room for is dropped.
    async fn publish(&self, tx: &mpsc::Sender<bool>, leading: bool, cancel: &CancellationToken) {
        tokio::select! {
            biased;
            _ = tx.send(leading) => {}
            _ = cancel.cancelled() => {
                tracing::debug!(namespace = %self.namespace.name, leading, "leadership channel full, transition dropped");
            }
        }
    }

    /// Terminate the processor, then resign. Failures are logged; leadership
    /// is given up either way.
    async fn step_down(&self, processor: &dyn Processor, election: &dyn Election) {
        let namespace = &self.namespace.name;
        let limit = self.cfg.shutdown_timeout;

        match timeout(limit, processor.terminate()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(namespace = %namespace, error = %e, "onResign: processor terminate failed")
            }
            Err(_) => {
                tracing::error!(namespace = %namespace, ?limit, "onResign: processor terminate timed out")
            }
        }

        match timeout(limit, election.resign()).await {
            Ok(Ok(())) => tracing::info!(namespace = %namespace, "resigned"),
            Ok(Err(e)) => tracing::error!(namespace = %namespace, error = %e, "resign failed"),
            Err(_) => tracing::error!(namespace = %namespace, ?limit, "resign timed out"),
        }
    }
}
