//! Global convergence detection.
//!
//! After each sweep every worker contributes its local changed flag and all
//! workers receive the same logical OR. Workers stop together: a partition
//! whose own rows are stable keeps sweeping while any other partition still
//! changes, since a neighbor's topples can reach its boundary later.

use crate::error::{Result, SandpileError};

/// What the workers do after a reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Some cell changed: swap and sweep again.
    Continue,
    /// Nothing changed anywhere: the grid is at its fixed point.
    Stable,
}

/// Logical OR over per-worker changed flags.
pub fn reduce_changed<I>(flags: I) -> bool
where
    I: IntoIterator<Item = bool>,
{
    flags.into_iter().fold(false, |any, changed| any | changed)
}

/// All-reduce of the changed flag across workers.
pub trait ChangeReduction: Send {
    /// Contribute `local_changed` for `iteration` and return the global OR.
    ///
    /// Blocks until every worker has contributed for this iteration.
    fn all_reduce_changed(&mut self, iteration: u64, local_changed: bool) -> Result<bool>;
}

/// Reduction for a lone worker: the local flag is the global flag.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoloReduction;

impl ChangeReduction for SoloReduction {
    fn all_reduce_changed(&mut self, _iteration: u64, local_changed: bool) -> Result<bool> {
        Ok(local_changed)
    }
}

/// Per-worker loop control.
///
/// Every worker owns one and feeds it the same global flags, so all of them
/// reach the same verdict on the same iteration.
#[derive(Debug, Clone)]
pub struct ConvergenceCoordinator {
    iterations: u64,
    max_iterations: Option<u64>,
}

impl ConvergenceCoordinator {
    /// Create a coordinator with an optional iteration cap.
    pub fn new(max_iterations: Option<u64>) -> Self {
        Self {
            iterations: 0,
            max_iterations,
        }
    }

    /// Sweeps completed so far.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Record one completed sweep and its global changed flag.
    ///
    /// Returns [`SandpileError::IterationLimit`] when the cap is reached while
    /// the grid is still changing.
    pub fn observe(&mut self, global_changed: bool) -> Result<Verdict> {
        self.iterations += 1;
        if !global_changed {
            return Ok(Verdict::Stable);
        }
        match self.max_iterations {
            Some(limit) if self.iterations >= limit => {
                Err(SandpileError::IterationLimit { limit })
            }
            _ => Ok(Verdict::Continue),
        }
    }
}
