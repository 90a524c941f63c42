//! Shard assignment policy.
//!
//! Pure function of a namespace snapshot: which executors are gone, and which
//! executors need a new `assigned_shards` map. Shards stay with a live ACTIVE
//! owner; everything else goes to the least loaded ACTIVE executor, ties
//! broken by HRW weight so every leader makes the same choice.

use crate::common::config::{Namespace, NamespaceType};
use crate::common::hash::hrw_hash;
use crate::store::{AssignedState, NamespaceState, ShardAssignment, ShardStatus};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Plan {
    /// Executors whose heartbeat expired, to be deleted
    pub stale: Vec<String>,
    /// New assignment for every executor whose assignment changes
    pub changed: HashMap<String, AssignedState>,
    /// Shards no executor can take right now
    pub unassigned: Vec<String>,
}

impl Plan {
    pub fn is_noop(&self) -> bool {
        self.stale.is_empty() && self.changed.is_empty()
    }
}

/// Has this executor been silent for longer than `ttl` at `now` (unix seconds)?
fn is_stale(last_heartbeat: i64, now: i64, ttl: Duration) -> bool {
    let silent = now.saturating_sub(last_heartbeat).max(0) as u64;
    Duration::from_secs(silent) > ttl
}

/// The shards that should exist in the namespace.
fn shard_universe(namespace: &Namespace, state: &NamespaceState, live: &BTreeSet<String>) -> BTreeSet<String> {
    match namespace.namespace_type {
        NamespaceType::Fixed => (0..namespace.shard_num).map(|i| i.to_string()).collect(),
        NamespaceType::Ephemeral => {
            let mut shards = BTreeSet::new();
            for id in live {
                let Some(assigned) = state.assignments.get(id) else {
                    continue;
                };
                let reported = state
                    .heartbeats
                    .get(id)
                    .map(|hb| &hb.reported_shards)
                    .unwrap_or(&assigned.reported_shards);
                for (shard, report) in reported {
                    if report.status != ShardStatus::Done {
                        shards.insert(shard.clone());
                    }
                }
                for shard in assigned.assigned_shards.keys() {
                    let finished = reported
                        .get(shard)
                        .map(|r| r.status == ShardStatus::Done)
                        .unwrap_or(false);
                    if !finished {
                        shards.insert(shard.clone());
                    }
                }
            }
            shards
        }
    }
}

/// Compute the reconciliation plan for `state` at `now` (unix seconds).
pub fn plan(namespace: &Namespace, state: &NamespaceState, now: i64, heartbeat_ttl: Duration) -> Plan {
    let mut result = Plan::default();

    let executors: BTreeSet<&String> = state
        .heartbeats
        .keys()
        .chain(state.assignments.keys())
        .collect();

    let mut live = BTreeSet::new();
    for id in executors {
        let last = state.heartbeats.get(id).map(|hb| hb.last_heartbeat).unwrap_or(0);
        if is_stale(last, now, heartbeat_ttl) {
            result.stale.push(id.clone());
        } else {
            live.insert(id.clone());
        }
    }

    let eligible: Vec<String> = live
        .iter()
        .filter(|id| {
            state
                .heartbeats
                .get(*id)
                .map(|hb| hb.state.accepts_shards())
                .unwrap_or(false)
        })
        .cloned()
        .collect();

    // Current owner of each shard among live executors (first id wins on conflict)
    let mut owners: BTreeMap<&str, &str> = BTreeMap::new();
    for id in &live {
        if let Some(assigned) = state.assignments.get(id) {
            for shard in assigned.assigned_shards.keys() {
                owners.entry(shard.as_str()).or_insert(id.as_str());
            }
        }
    }

    let mut target: BTreeMap<&str, BTreeSet<String>> =
        live.iter().map(|id| (id.as_str(), BTreeSet::new())).collect();
    let mut orphans = Vec::new();

    for shard in shard_universe(namespace, state, &live) {
        match owners.get(shard.as_str()) {
            Some(owner) if eligible.iter().any(|e| e == owner) => {
                if let Some(set) = target.get_mut(owner) {
                    set.insert(shard);
                }
            }
            // Nobody can take over: leave it with its current (draining) owner
            Some(owner) if eligible.is_empty() => {
                if let Some(set) = target.get_mut(owner) {
                    set.insert(shard);
                }
            }
            _ => orphans.push(shard),
        }
    }

    for shard in orphans {
        if eligible.is_empty() {
            result.unassigned.push(shard);
            continue;
        }
        let ranked = hrw_hash(&shard, &eligible);
        let chosen = ranked
            .iter()
            .enumerate()
            .min_by_key(|(rank, id)| (target.get(id.as_str()).map(|s| s.len()).unwrap_or(0), *rank))
            .map(|(_, id)| id.clone());
        if let Some(id) = chosen {
            if let Some(set) = target.get_mut(id.as_str()) {
                set.insert(shard);
            }
        }
    }

    for (id, shards) in target {
        let assigned_shards: BTreeMap<String, ShardAssignment> = shards
            .into_iter()
            .map(|shard| (shard, ShardAssignment::default()))
            .collect();
        let current = state.assignments.get(id);
        let unchanged = current
            .map(|c| c.assigned_shards == assigned_shards)
            .unwrap_or(assigned_shards.is_empty());
        if unchanged {
            continue;
        }
        result.changed.insert(
            id.to_string(),
            AssignedState {
                executor_id: id.to_string(),
                reported_shards: current.map(|c| c.reported_shards.clone()).unwrap_or_default(),
                assigned_shards,
            },
        );
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ExecutorState, HeartbeatState, ShardState};

    const NOW: i64 = 1_700_000_000;
    const TTL: Duration = Duration::from_secs(10);

    fn fixed(shards: u32) -> Namespace {
        Namespace {
            shard_num: shards,
            ..Namespace::new("ns")
        }
    }

    fn ephemeral() -> Namespace {
        Namespace {
            namespace_type: NamespaceType::Ephemeral,
            ..Namespace::new("ns")
        }
    }

    struct Snapshot(NamespaceState);

    impl Snapshot {
        fn new() -> Self {
            Snapshot(NamespaceState::default())
        }

        fn executor(mut self, id: &str, age: i64, state: ExecutorState, assigned: &[&str], reported: &[(&str, ShardStatus)]) -> Self {
            let reported_shards: BTreeMap<String, ShardState> = reported
                .iter()
                .map(|(s, status)| (s.to_string(), ShardState { status: *status, load: 0.0 }))
                .collect();
            self.0.heartbeats.insert(
                id.to_string(),
                HeartbeatState {
                    executor_id: id.to_string(),
                    last_heartbeat: NOW - age,
                    state,
                    reported_shards: reported_shards.clone(),
                },
            );
            self.0.assignments.insert(
                id.to_string(),
                AssignedState {
                    executor_id: id.to_string(),
                    reported_shards,
                    assigned_shards: assigned
                        .iter()
                        .map(|s| (s.to_string(), ShardAssignment::default()))
                        .collect(),
                },
            );
            self
        }
    }

    fn owned(plan: &Plan, id: &str) -> Vec<String> {
        plan.changed[id].assigned_shards.keys().cloned().collect()
    }

    #[test]
    fn test_staleness_keeps_subsecond_ttl() {
        let ttl = Duration::from_millis(500);
        assert!(!is_stale(NOW, NOW, ttl));
        assert!(is_stale(NOW - 1, NOW, ttl));
        assert!(!is_stale(NOW - 10, NOW, Duration::from_secs(10)));
        assert!(is_stale(NOW - 11, NOW, Duration::from_secs(10)));
        // Clock skew never makes an executor stale
        assert!(!is_stale(NOW + 5, NOW, ttl));
    }

    #[test]
    fn test_initial_assignment_is_balanced() {
        let state = Snapshot::new()
            .executor("a", 0, ExecutorState::Active, &[], &[])
            .executor("b", 0, ExecutorState::Active, &[], &[])
            .0;

        let plan = plan(&fixed(8), &state, NOW, TTL);
        assert!(plan.stale.is_empty());
        assert_eq!(owned(&plan, "a").len(), 4);
        assert_eq!(owned(&plan, "b").len(), 4);
    }

    #[test]
    fn test_stable_assignment_is_noop() {
        let state = Snapshot::new()
            .executor("a", 1, ExecutorState::Active, &["0", "1"], &[])
            .executor("b", 1, ExecutorState::Active, &["2", "3"], &[])
            .0;

        let plan = plan(&fixed(4), &state, NOW, TTL);
        assert!(plan.is_noop());
    }

    #[test]
    fn test_stale_executor_shards_move() {
        let state = Snapshot::new()
            .executor("a", 1, ExecutorState::Active, &["0", "1"], &[])
            .executor("b", 60, ExecutorState::Active, &["2", "3"], &[])
            .0;

        let plan = plan(&fixed(4), &state, NOW, TTL);
        assert_eq!(plan.stale, vec!["b".to_string()]);
        assert_eq!(owned(&plan, "a"), vec!["0", "1", "2", "3"]);
        assert!(!plan.changed.contains_key("b"));
    }

    #[test]
    fn test_draining_executor_is_emptied() {
        let state = Snapshot::new()
            .executor("a", 0, ExecutorState::Active, &["0"], &[])
            .executor("b", 0, ExecutorState::Draining, &["1", "2"], &[])
            .0;

        let plan = plan(&fixed(3), &state, NOW, TTL);
        assert_eq!(owned(&plan, "a"), vec!["0", "1", "2"]);
        assert!(owned(&plan, "b").is_empty());
    }

    #[test]
    fn test_no_eligible_executor() {
        let state = Snapshot::new()
            .executor("b", 0, ExecutorState::Draining, &["1"], &[])
            .0;

        let plan = plan(&fixed(2), &state, NOW, TTL);
        assert!(plan.changed.is_empty());
        assert_eq!(plan.unassigned, vec!["0".to_string()]);
    }

    #[test]
    fn test_ephemeral_follows_reports() {
        let state = Snapshot::new()
            .executor("a", 0, ExecutorState::Active, &["x"], &[("x", ShardStatus::Done), ("y", ShardStatus::Ready)])
            .0;

        let plan = plan(&ephemeral(), &state, NOW, TTL);
        assert_eq!(owned(&plan, "a"), vec!["y"]);
    }

    #[test]
    fn test_orphan_placement_is_deterministic() {
        let state = Snapshot::new()
            .executor("a", 0, ExecutorState::Active, &[], &[])
            .executor("b", 0, ExecutorState::Active, &[], &[])
            .executor("c", 0, ExecutorState::Active, &[], &[])
            .0;

        let first = plan(&fixed(16), &state, NOW, TTL);
        let second = plan(&fixed(16), &state.clone(), NOW, TTL);
        assert_eq!(first, second);
    }
}
