//! Ghost-row exchange between neighboring partitions.
//!
//! Before every sweep worker `p` sends its first real row to `p - 1` and its
//! last real row to `p + 1`, and fills its north and south ghost rows from
//! those same neighbors. Sides without a neighbor are the sink border and
//! are never written. An implementation must not return from
//! [`HaloExchange::exchange`] until both ghost rows hold this iteration's
//! data, and must never write another partition's rows.
//!
//! Two transports implement the contract:
//! - [`HaloEndpoint`](super::broker::HaloEndpoint): message passing through a
//!   broker with per-rank mailboxes.
//! - [`SharedHaloPort`](super::shared::SharedHaloPort): edge slots in shared
//!   memory published and read around a phase barrier.

use std::fmt;

use super::partition::Partition;
use crate::error::Result;

/// Side of a partition that exchanges a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HaloDirection {
    /// Towards lower row indices (rank - 1).
    North,
    /// Towards higher row indices (rank + 1).
    South,
}

impl HaloDirection {
    /// Get the opposite direction.
    pub fn opposite(self) -> Self {
        match self {
            HaloDirection::North => HaloDirection::South,
            HaloDirection::South => HaloDirection::North,
        }
    }

    /// All directions.
    pub const ALL: [HaloDirection; 2] = [HaloDirection::North, HaloDirection::South];
}

impl fmt::Display for HaloDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaloDirection::North => f.write_str("north"),
            HaloDirection::South => f.write_str("south"),
        }
    }
}

/// Synchronizes a partition's ghost rows with its neighbors.
pub trait HaloExchange: Send {
    /// Rank of the worker this exchanger serves.
    fn rank(&self) -> usize;

    /// Complete all sends and receives for `iteration`, leaving both ghost
    /// rows of `partition` consistent with the neighbors' current rows.
    fn exchange(&mut self, iteration: u64, partition: &mut Partition) -> Result<()>;
}

/// Exchanger for a lone partition: both ghost rows are sink rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoloExchange;

impl HaloExchange for SoloExchange {
    fn rank(&self) -> usize {
        0
    }

    fn exchange(&mut self, _iteration: u64, _partition: &mut Partition) -> Result<()> {
        Ok(())
    }
}
