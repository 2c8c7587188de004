//! Deterministic key-to-partition mapping and stream naming.
//!
//! The hash is the classic 32-bit multiplicative string hash
//! (`h = h * 31 + unit` with wrap-around over UTF-16 code units). It is
//! the de-facto interchange hash for partitioned keys: producers written
//! in other languages compute the same value, so the same key lands on
//! the same partition from anywhere in the fleet. Do not change it.

use rand::Rng;

use crate::error::{QTaskError, Result};

/// Maps partition keys to partition indices for a fixed fleet-wide
/// partition count, and derives the physical stream names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partitioner {
    total_partitions: u32,
}

impl Partitioner {
    /// Create a partitioner for `total_partitions` partitions.
    ///
    /// The count is a fleet-wide constant: every producer and consumer
    /// must be constructed with the same value.
    pub fn new(total_partitions: u32) -> Result<Self> {
        if total_partitions == 0 {
            return Err(QTaskError::Config(
                "total_partitions must be a positive integer".to_string(),
            ));
        }
        Ok(Self { total_partitions })
    }

    /// The fleet-wide partition count.
    pub fn total_partitions(&self) -> u32 {
        self.total_partitions
    }

    /// 32-bit string hash with wrap-around, seeded at 0.
    ///
    /// Iterates UTF-16 code units so the result matches what string
    /// hashing produces in JVM- and JS-family producers bit for bit.
    pub fn hash(key: &str) -> i32 {
        let mut h: i32 = 0;
        for unit in key.encode_utf16() {
            h = h.wrapping_shl(5).wrapping_sub(h).wrapping_add(unit as i32);
        }
        h
    }

    /// Map a key to a partition index in `[0, total_partitions)`.
    ///
    /// An absent key spreads load uniformly at random instead of pinning
    /// everything to one partition.
    pub fn partition_for(&self, key: Option<&str>) -> u32 {
        match key {
            Some(key) => Self::hash(key).unsigned_abs() % self.total_partitions,
            None => rand::thread_rng().gen_range(0..self.total_partitions),
        }
    }

    /// Physical stream name for a partition of a logical topic.
    pub fn stream_name(&self, base_topic: &str, index: u32) -> Result<String> {
        if index >= self.total_partitions {
            return Err(QTaskError::InvalidPartitionIndex {
                index,
                total: self.total_partitions,
            });
        }
        Ok(format!("{}:{}", base_topic, index))
    }

    /// Stream name for the partition a key maps to.
    pub fn stream_for(&self, base_topic: &str, key: Option<&str>) -> String {
        let index = self.partition_for(key);
        format!("{}:{}", base_topic, index)
    }

    /// All stream names of a logical topic, in partition order.
    pub fn all_streams(&self, base_topic: &str) -> Vec<String> {
        (0..self.total_partitions)
            .map(|i| format!("{}:{}", base_topic, i))
            .collect()
    }
}
