//! Static fleet assignment.
//!
//! Horizontal scaling without a coordinator: every process knows its
//! own index and the fleet size, and owns exactly the partitions whose
//! index is congruent to its own. The union over a consistent fleet
//! covers every partition with no overlap. Resizing the fleet means
//! redeploying with updated values on every member.

use tracing::debug;

use crate::error::{QTaskError, Result};

/// Environment variable holding this process's index in the fleet.
pub const INSTANCE_ID_VAR: &str = "INSTANCE_ID";
/// Environment variable holding the fleet size.
pub const INSTANCE_COUNT_VAR: &str = "INSTANCE_COUNT";

/// A process's slot in the worker fleet. Immutable for the lifetime of
/// the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FleetAssignment {
    instance_id: u32,
    instance_count: u32,
}

impl FleetAssignment {
    /// Create an assignment, validating `0 <= instance_id < instance_count`.
    pub fn new(instance_id: u32, instance_count: u32) -> Result<Self> {
        if instance_count == 0 {
            return Err(QTaskError::Config(
                "instance_count must be at least 1".to_string(),
            ));
        }
        if instance_id >= instance_count {
            return Err(QTaskError::Config(format!(
                "instance_id {} out of range for instance_count {}",
                instance_id, instance_count
            )));
        }
        Ok(Self {
            instance_id,
            instance_count,
        })
    }

    /// Resolve the assignment from `INSTANCE_ID` / `INSTANCE_COUNT`,
    /// defaulting to the single-instance assignment `(0, 1)` when unset.
    /// Values that are present but unparseable are configuration errors,
    /// not silently defaulted.
    pub fn from_env() -> Result<Self> {
        let instance_id = read_env_u32(INSTANCE_ID_VAR)?.unwrap_or(0);
        let instance_count = read_env_u32(INSTANCE_COUNT_VAR)?.unwrap_or(1);
        let assignment = Self::new(instance_id, instance_count)?;
        debug!(
            instance_id = instance_id,
            instance_count = instance_count,
            "Resolved fleet assignment"
        );
        Ok(assignment)
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// Whether this instance owns the given partition index.
    pub fn owns(&self, partition: u32) -> bool {
        partition % self.instance_count == self.instance_id
    }

    /// The partition indices this instance owns, in ascending order.
    ///
    /// May be empty when the fleet is larger than the partition count;
    /// that is a valid scale-out configuration, not an error.
    pub fn owned_partitions(&self, total_partitions: u32) -> Vec<u32> {
        (0..total_partitions).filter(|i| self.owns(*i)).collect()
    }
}

impl Default for FleetAssignment {
    fn default() -> Self {
        Self {
            instance_id: 0,
            instance_count: 1,
        }
    }
}

fn read_env_u32(key: &str) -> Result<Option<u32>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|e| QTaskError::Config(format!("invalid {}: {}", key, e))),
        Err(_) => Ok(None),
    }
}
