//! In-process linearizable backend.
//!
//! One mutex serializes every operation, so reads and transactions observe a
//! single total order. Watch events are published under that same lock, which
//! keeps them in revision order. Lease expiry is reaped on every access and
//! uses tokio's clock, so paused-time tests can drive it.

use crate::common::{Error, Result};
use crate::store::kv::{
    Compare, EventKind, GetResponse, KeyValue, KvBackend, LeaseId, Txn, TxnOp, TxnResponse,
    WatchEvent, WatchResponse, WatchStream,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

const DEFAULT_WATCH_CAPACITY: usize = 1024;
const FIRST_LEASE_ID: LeaseId = 0x1000;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    create_revision: i64,
    mod_revision: i64,
    lease: Option<LeaseId>,
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    ttl: Duration,
    deadline: Instant,
}

#[derive(Debug)]
struct MemState {
    data: BTreeMap<String, Entry>,
    revision: i64,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
}

impl MemState {
    fn create_revision(&self, key: &str) -> i64 {
        self.data.get(key).map(|e| e.create_revision).unwrap_or(0)
    }

    fn holds(&self, compare: &Compare) -> bool {
        match compare {
            Compare::CreateRevision { key, revision } => self.create_revision(key) == *revision,
        }
    }

    fn keys_under(&self, prefix: &str) -> Vec<String> {
        self.data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn remove(&mut self, key: &str, revision: i64, events: &mut Vec<WatchEvent>) {
        if let Some(entry) = self.data.remove(key) {
            events.push(WatchEvent {
                kind: EventKind::Delete,
                key: key.to_string(),
                value: Vec::new(),
                prev_value: Some(entry.value),
                create_revision: entry.create_revision,
                mod_revision: revision,
            });
        }
    }

    fn apply(&mut self, op: TxnOp, revision: i64, events: &mut Vec<WatchEvent>) {
        match op {
            TxnOp::Put { key, value, lease } => {
                let prev = self.data.get(&key);
                let create_revision = prev.map(|e| e.create_revision).unwrap_or(revision);
                let prev_value = prev.map(|e| e.value.clone());
                self.data.insert(
                    key.clone(),
                    Entry {
                        value: value.clone(),
                        create_revision,
                        mod_revision: revision,
                        lease,
                    },
                );
                events.push(WatchEvent {
                    kind: EventKind::Put,
                    key,
                    value,
                    prev_value,
                    create_revision,
                    mod_revision: revision,
                });
            }
            TxnOp::Delete { key, prefix: false } => self.remove(&key, revision, events),
            TxnOp::Delete { key, prefix: true } => {
                for k in self.keys_under(&key) {
                    self.remove(&k, revision, events);
                }
            }
        }
    }

    fn drop_lease_keys(&mut self, lease: LeaseId, revision: i64, events: &mut Vec<WatchEvent>) {
        let owned: Vec<String> = self
            .data
            .iter()
            .filter(|(_, e)| e.lease == Some(lease))
            .map(|(k, _)| k.clone())
            .collect();
        for key in owned {
            self.remove(&key, revision, events);
        }
    }
}

/// Linearizable in-memory KV backend with revisions, leases and watches.
pub struct MemoryBackend {
    state: Mutex<MemState>,
    events: broadcast::Sender<WatchResponse>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_watch_capacity(DEFAULT_WATCH_CAPACITY)
    }

    /// Watchers lagging more than `capacity` revisions behind are failed.
    pub fn with_watch_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Mutex::new(MemState {
                data: BTreeMap::new(),
                revision: 0,
                leases: HashMap::new(),
                next_lease: FIRST_LEASE_ID,
            }),
            events,
        }
    }

    /// Current store revision.
    pub fn revision(&self) -> i64 {
        self.lock().revision
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the state with expired leases already reaped.
    fn lock_live(&self) -> MutexGuard<'_, MemState> {
        let mut state = self.lock();
        let now = Instant::now();
        let expired: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        if !expired.is_empty() {
            let revision = state.revision + 1;
            let mut events = Vec::new();
            for id in expired {
                tracing::debug!(lease = id, "lease expired");
                state.leases.remove(&id);
                state.drop_lease_keys(id, revision, &mut events);
            }
            self.commit(&mut state, revision, events);
        }
        state
    }

    /// Advance the revision and publish, if anything changed.
    fn commit(&self, state: &mut MemState, revision: i64, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        state.revision = revision;
        // No receivers is not an error for the writer
        let _ = self.events.send(WatchResponse { revision, events });
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str, prefix: bool) -> Result<GetResponse> {
        let state = self.lock_live();
        let keys = if prefix {
            state.keys_under(key)
        } else {
            vec![key.to_string()]
        };
        let kvs = keys
            .into_iter()
            .filter_map(|k| {
                state.data.get(&k).map(|e| KeyValue {
                    key: k,
                    value: e.value.clone(),
                    create_revision: e.create_revision,
                    mod_revision: e.mod_revision,
                    lease: e.lease,
                })
            })
            .collect();
        Ok(GetResponse {
            kvs,
            revision: state.revision,
        })
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        let mut state = self.lock_live();
        let (compares, ops) = txn.into_parts();

        if !compares.iter().all(|c| state.holds(c)) {
            return Ok(TxnResponse {
                succeeded: false,
                revision: state.revision,
            });
        }

        for op in &ops {
            if let TxnOp::Put {
                lease: Some(lease), ..
            } = op
            {
                if !state.leases.contains_key(lease) {
                    return Err(Error::LeaseNotFound(*lease));
                }
            }
        }

        let revision = state.revision + 1;
        let mut events = Vec::new();
        for op in ops {
            state.apply(op, revision, &mut events);
        }
        self.commit(&mut state, revision, events);

        Ok(TxnResponse {
            succeeded: true,
            revision: state.revision,
        })
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        // Subscribe under the lock so no revision slips between the caller's
        // last read and the first event.
        let mut rx = {
            let _state = self.lock();
            self.events.subscribe()
        };
        let prefix = prefix.to_string();

        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(resp) => {
                        let events: Vec<WatchEvent> = resp
                            .events
                            .into_iter()
                            .filter(|e| e.key.starts_with(&prefix))
                            .collect();
                        if !events.is_empty() {
                            yield Ok(WatchResponse { revision: resp.revision, events });
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        yield Err(Error::BackendUnavailable(format!(
                            "watch on {} lagged by {} revisions",
                            prefix, missed
                        )));
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let mut state = self.lock_live();
        let id = state.next_lease;
        state.next_lease += 1;
        state.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.lock_live();
        match state.leases.get_mut(&lease) {
            Some(l) => {
                l.deadline = Instant::now() + l.ttl;
                Ok(())
            }
            None => Err(Error::LeaseNotFound(lease)),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.lock_live();
        if state.leases.remove(&lease).is_none() {
            return Err(Error::LeaseNotFound(lease));
        }
        let revision = state.revision + 1;
        let mut events = Vec::new();
        state.drop_lease_keys(lease, revision, &mut events);
        self.commit(&mut state, revision, events);
        Ok(())
    }
}
