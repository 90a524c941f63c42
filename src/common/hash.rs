//! Hashing utilities for shard placement
//!
//! HRW (Highest Random Weight) hashing gives every (shard, executor) pair a
//! stable weight, so placement ties resolve the same way on every leader.

/// Weight of an executor for a shard (BLAKE3 of the concatenated ids).
pub fn hrw_weight(shard_id: &str, executor_id: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(shard_id.as_bytes());
    hasher.update(b"/");
    hasher.update(executor_id.as_bytes());
    let hash = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(head)
}

/// HRW hashing: executors sorted by their weight for `shard_id` (descending).
pub fn hrw_hash<'a>(shard_id: &str, executors: impl IntoIterator<Item = &'a String>) -> Vec<String> {
    let mut weights: Vec<(&String, u64)> = executors
        .into_iter()
        .map(|executor| (executor, hrw_weight(shard_id, executor)))
        .collect();

    // Sort by weight (descending), id breaks the (unlikely) tie
    weights.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    weights.into_iter().map(|(executor, _)| executor.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hrw_is_deterministic() {
        let executors = vec!["exec-a".to_string(), "exec-b".to_string(), "exec-c".to_string()];
        let first = hrw_hash("shard-1", &executors);
        let second = hrw_hash("shard-1", executors.iter().rev());
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn test_hrw_spreads_shards() {
        let executors = vec!["exec-a".to_string(), "exec-b".to_string(), "exec-c".to_string()];
        let winners: std::collections::HashSet<String> = (0..64)
            .map(|i| hrw_hash(&i.to_string(), &executors)[0].clone())
            .collect();
        assert!(winners.len() > 1);
    }
}
