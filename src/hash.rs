//! Stable hashing utilities for job sharding.
//!
//! Goals:
//! - Use a stable, explicit hash (not std::DefaultHasher) so that a given job key
//!   always lands on the same worker of a multi-threaded processor, across runs
//!   and toolchains.

use std::hash::Hasher;
use twox_hash::XxHash64;

use crate::jobs::JobKey;

/// Seed для шардирования задач (фиксированный, не менять: влияет на раскладку по воркерам).
const SHARD_SEED: u64 = 0x51A7_C0DE_0B5E_ED00;

/// Compute 64-bit stable hash of a job key.
pub fn job_key_hash64(key: &JobKey) -> u64 {
    let mut h = XxHash64::with_seed(SHARD_SEED);
    match key {
        JobKey::Identity(addr) => {
            h.write_u8(0);
            h.write_u64(*addr as u64);
        }
        JobKey::Logical(name, id) => {
            h.write_u8(1);
            h.write(name.as_bytes());
            h.write_u64(*id);
        }
    }
    h.finish()
}

/// Stable mapping from job key -> shard index.
#[inline]
pub fn shard_of(key: &JobKey, shards: usize) -> usize {
    debug_assert!(shards > 0, "shards must be > 0");
    (job_key_hash64(key) % (shards as u64)) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_is_stable_and_in_range() {
        let k = JobKey::Logical("clean", 42);
        let a = shard_of(&k, 7);
        let b = shard_of(&k, 7);
        assert_eq!(a, b);
        assert!(a < 7);
        assert_eq!(shard_of(&k, 1), 0);
    }

    #[test]
    fn identity_and_logical_differ() {
        let a = job_key_hash64(&JobKey::Identity(42));
        let b = job_key_hash64(&JobKey::Logical("", 42));
        assert_ne!(a, b);
    }
}
