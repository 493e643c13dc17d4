//! Deterministic bucketing of users into traffic allocation ranges.
use crate::project_config::TrafficAllocation;

/// Total number of buckets a traffic allocation is expressed in.
pub const TOTAL_BUCKETS: u64 = 10_000;

pub trait Sharder {
    fn get_shard(&self, input: &str, total_shards: u64) -> u64;
}

/// The default sharder: first four bytes of the md5 digest, big-endian.
pub struct Md5Sharder;

impl Sharder for Md5Sharder {
    fn get_shard(&self, input: &str, total_shards: u64) -> u64 {
        let hash = md5::compute(input);
        let value = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
        (value as u64) % total_shards
    }
}

/// Return the entity id (variation id) whose range contains the user's bucket for the given
/// experiment, or `None` if the bucket falls outside all allocated ranges.
pub fn bucket<'a>(
    sharder: &dyn Sharder,
    user_id: &str,
    experiment_id: &str,
    allocations: &'a [TrafficAllocation],
) -> Option<&'a str> {
    let bucket = sharder.get_shard(&format!("{user_id}{experiment_id}"), TOTAL_BUCKETS);

    allocations
        .iter()
        .find(|allocation| bucket < allocation.end_of_range)
        .map(|allocation| allocation.entity_id.as_str())
        .filter(|entity_id| !entity_id.is_empty())
}

#[cfg(test)]
pub struct DeterministicSharder(pub std::collections::HashMap<String, u64>);

#[cfg(test)]
impl Sharder for DeterministicSharder {
    fn get_shard(&self, input: &str, total_shards: u64) -> u64 {
        self.0.get(input).copied().unwrap_or(0) % total_shards
    }
}
