//! Leader election on top of [`KvBackend`] leases.
//!
//! Each election owns a session: a lease kept alive in the background. A
//! candidate writes `<election_prefix>/<namespace>/<lease-hex>` attached to
//! that lease and becomes leader once its key has the lowest create revision
//! under the namespace prefix. Losing the session deletes the key, which both
//! hands leadership to the next candidate and invalidates the old guard.

use crate::common::{Error, Result};
use crate::store::kv::{Compare, KvBackend, LeaseId, Txn, TxnOp};
use crate::store::{Election, ElectionStore, Guard};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Creates [`KvElection`]s under a dedicated key prefix.
pub struct KvElectionStore {
    backend: Arc<dyn KvBackend>,
    prefix: String,
    session_ttl: Duration,
}

impl KvElectionStore {
    pub fn new(backend: Arc<dyn KvBackend>, prefix: impl Into<String>, session_ttl: Duration) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            session_ttl,
        }
    }
}

#[async_trait]
impl ElectionStore for KvElectionStore {
    async fn create_election(&self, namespace: &str) -> Result<Arc<dyn Election>> {
        let election = KvElection::open(
            self.backend.clone(),
            namespace,
            format!("{}/{}/", self.prefix, namespace),
            self.session_ttl,
        )
        .await?;
        Ok(Arc::new(election))
    }
}

pub struct KvElection {
    backend: Arc<dyn KvBackend>,
    namespace: String,
    election_prefix: String,
    lease: LeaseId,
    leader: Mutex<Option<Guard>>,
    /// Fired when the session is lost
    done: CancellationToken,
    /// Stops the keep-alive task
    session: CancellationToken,
}

impl KvElection {
    /// Open a session of `ttl` and start keeping it alive.
    pub async fn open(
        backend: Arc<dyn KvBackend>,
        namespace: &str,
        election_prefix: String,
        ttl: Duration,
    ) -> Result<Self> {
        let lease = backend.grant_lease(ttl).await?;
        let done = CancellationToken::new();
        let session = CancellationToken::new();

        tokio::spawn(keep_alive(
            backend.clone(),
            lease,
            ttl,
            namespace.to_string(),
            session.clone(),
            done.clone(),
        ));

        tracing::debug!(namespace, lease, "election session opened");
        Ok(Self {
            backend,
            namespace: namespace.to_string(),
            election_prefix,
            lease,
            leader: Mutex::new(None),
            done,
            session,
        })
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    fn leader_key(&self) -> String {
        format!("{}{:x}", self.election_prefix, self.lease)
    }

    fn leader(&self) -> MutexGuard<'_, Option<Guard>> {
        self.leader.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Refresh the lease every `ttl / 3`. The session is lost once the backend
/// forgets the lease, or when no refresh succeeded for a whole `ttl`.
async fn keep_alive(
    backend: Arc<dyn KvBackend>,
    lease: LeaseId,
    ttl: Duration,
    namespace: String,
    session: CancellationToken,
    done: CancellationToken,
) {
    let mut ticker = tokio::time::interval((ttl / 3).max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut last_ok = Instant::now();

    loop {
        tokio::select! {
            _ = session.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match backend.keep_alive(lease).await {
            Ok(()) => last_ok = Instant::now(),
            Err(e) if matches!(e, Error::LeaseNotFound(_)) || last_ok.elapsed() >= ttl => {
                tracing::warn!(namespace = %namespace, error = %e, "election session lost");
                done.cancel();
                return;
            }
            Err(e) => {
                tracing::warn!(namespace = %namespace, error = %e, "lease keep-alive failed, retrying");
            }
        }
    }
}

#[async_trait]
impl Election for KvElection {
    async fn campaign(&self, hostname: &str) -> Result<()> {
        if self.done.is_cancelled() {
            return Err(Error::Campaign("election session expired".into()));
        }
        let key = self.leader_key();

        // Watch before the first read so no deletion is missed
        let mut changes = self.backend.watch(&self.election_prefix).await?;
        self.backend
            .txn(
                Txn::new()
                    .when(Compare::absent(key.clone()))
                    .and_then([TxnOp::put_with_lease(key.clone(), hostname, self.lease)]),
            )
            .await?;

        loop {
            let resp = self.backend.get(&self.election_prefix, true).await?;
            let ours = resp
                .kvs
                .iter()
                .find(|kv| kv.key == key)
                .map(|kv| kv.create_revision)
                .ok_or_else(|| Error::Campaign("candidate key vanished, session lost".into()))?;

            let ahead = resp.kvs.iter().filter(|kv| kv.create_revision < ours).count();
            if ahead == 0 {
                *self.leader() = Some(Guard::new(key.clone(), ours));
                tracing::info!(namespace = %self.namespace, hostname, "leadership acquired");
                return Ok(());
            }
            tracing::debug!(namespace = %self.namespace, ahead, "waiting for earlier candidates");

            tokio::select! {
                _ = self.done.cancelled() => {
                    return Err(Error::Campaign("election session expired while campaigning".into()));
                }
                change = changes.next() => match change {
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(Error::Campaign(format!("election watch failed: {}", e))),
                    None => return Err(Error::Campaign("election watch closed".into())),
                }
            }
        }
    }

    async fn resign(&self) -> Result<()> {
        let Some(guard) = self.leader().take() else {
            return Ok(());
        };
        let resp = self
            .backend
            .txn(
                Txn::new()
                    .guarded_by(&guard)
                    .and_then([TxnOp::delete(guard.leader_key())]),
            )
            .await
            .map_err(|e| Error::Resign(e.to_string()))?;

        if resp.succeeded {
            tracing::info!(namespace = %self.namespace, "leadership resigned");
        } else {
            tracing::debug!(namespace = %self.namespace, "leadership was already lost");
        }
        Ok(())
    }

    fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    fn guard(&self) -> Result<Guard> {
        if self.done.is_cancelled() {
            return Err(Error::NotLeader(self.namespace.clone()));
        }
        self.leader()
            .clone()
            .ok_or_else(|| Error::NotLeader(self.namespace.clone()))
    }

    async fn cleanup(&self) -> Result<()> {
        self.session.cancel();
        self.leader().take();
        match self.backend.revoke_lease(self.lease).await {
            Ok(()) | Err(Error::LeaseNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for KvElection {
    fn drop(&mut self) {
        self.session.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;

    const TTL: Duration = Duration::from_secs(15);

    async fn election(backend: &Arc<MemoryBackend>) -> KvElection {
        KvElection::open(backend.clone(), "ns", "/election/ns/".to_string(), TTL)
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_campaign_grants_guard() {
        let backend = Arc::new(MemoryBackend::new());
        let e = election(&backend).await;

        assert!(matches!(e.guard(), Err(Error::NotLeader(_))));
        e.campaign("host-a").await.unwrap();

        let guard = e.guard().unwrap();
        assert_eq!(guard.leader_key(), format!("/election/ns/{:x}", e.lease()));
        let stored = backend.get(guard.leader_key(), false).await.unwrap();
        assert_eq!(stored.kvs[0].value, b"host-a".to_vec());
        assert_eq!(stored.kvs[0].create_revision, guard.create_revision());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_candidate_waits_for_resign() {
        let backend = Arc::new(MemoryBackend::new());
        let first = election(&backend).await;
        let second = Arc::new(election(&backend).await);

        first.campaign("host-a").await.unwrap();

        let waiting = {
            let second = second.clone();
            tokio::spawn(async move { second.campaign("host-b").await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiting.is_finished());

        let stale = first.guard().unwrap();
        first.resign().await.unwrap();
        waiting.await.unwrap().unwrap();

        assert_ne!(second.guard().unwrap(), stale);
        assert!(matches!(first.guard(), Err(Error::NotLeader(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resign_without_leadership_is_noop() {
        let backend = Arc::new(MemoryBackend::new());
        let e = election(&backend).await;
        e.resign().await.unwrap();
        e.campaign("host-a").await.unwrap();
        e.resign().await.unwrap();
        e.resign().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_loss_fires_done() {
        let backend = Arc::new(MemoryBackend::new());
        let e = election(&backend).await;
        e.campaign("host-a").await.unwrap();

        let done = e.done();
        assert!(!done.is_cancelled());

        // Leases revoked behind our back, as after a partition
        backend.revoke_lease(e.lease()).await.unwrap();
        tokio::time::timeout(TTL, done.cancelled()).await.unwrap();

        assert!(matches!(e.guard(), Err(Error::NotLeader(_))));
        assert!(e.campaign("host-a").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_holds_session() {
        let backend = Arc::new(MemoryBackend::new());
        let e = election(&backend).await;
        e.campaign("host-a").await.unwrap();

        tokio::time::sleep(TTL * 4).await;
        assert!(!e.done().is_cancelled());
        assert!(e.guard().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_releases_key() {
        let backend = Arc::new(MemoryBackend::new());
        let e = election(&backend).await;
        e.campaign("host-a").await.unwrap();

        e.cleanup().await.unwrap();
        assert!(backend.get("/election/ns/", true).await.unwrap().kvs.is_empty());
        e.cleanup().await.unwrap();
    }
}
