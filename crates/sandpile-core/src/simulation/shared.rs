//! Shared-memory halo transport.
//!
//! Workers publish their two boundary rows into per-rank edge slots, meet at
//! a barrier, then copy their neighbors' slots into their own ghost rows.
//! The changed-flag reduction works the same way with one atomic flag per
//! worker and a second barrier.
//!
//! Two barriers per iteration keep the slots safe to reuse: a worker cannot
//! publish the edges of iteration `k + 1` before every worker has passed the
//! reduction barrier of iteration `k`, and every worker has finished reading
//! the edges of iteration `k` before it arrives there.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use super::convergence::{reduce_changed, ChangeReduction};
use super::grid::Cell;
use super::halo::{HaloDirection, HaloExchange};
use super::partition::{Partition, RowBand};
use crate::error::{try_zeroed, Phase, Result, SandpileError};

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    aborted: bool,
}

/// Reusable barrier that can be aborted and gives up after a timeout.
///
/// Once aborted (explicitly or by a timeout) every current and future wait
/// fails, so a lost worker cannot leave its peers blocked.
#[derive(Debug)]
pub struct PhaseBarrier {
    workers: usize,
    timeout: Duration,
    state: Mutex<BarrierState>,
    condvar: Condvar,
}

impl PhaseBarrier {
    /// Create a barrier for `workers` participants.
    pub fn new(workers: usize, timeout: Duration) -> Self {
        Self {
            workers,
            timeout,
            state: Mutex::new(BarrierState::default()),
            condvar: Condvar::new(),
        }
    }

    /// Block until all participants have arrived.
    pub fn wait(&self, rank: usize, phase: Phase) -> Result<()> {
        let mut state = self.state.lock();
        if state.aborted {
            return Err(Self::aborted_error(rank, phase));
        }

        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.workers {
            state.arrived = 0;
            state.generation += 1;
            self.condvar.notify_all();
            return Ok(());
        }

        let deadline = Instant::now() + self.timeout;
        while state.generation == generation && !state.aborted {
            if self.condvar.wait_until(&mut state, deadline).timed_out()
                && state.generation == generation
            {
                state.aborted = true;
                self.condvar.notify_all();
                return Err(SandpileError::communication(
                    rank,
                    phase,
                    format!("timed out after {:?} waiting for peers at barrier", self.timeout),
                ));
            }
        }

        if state.generation != generation {
            Ok(())
        } else {
            Err(Self::aborted_error(rank, phase))
        }
    }

    /// Fail every current and future wait.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        self.condvar.notify_all();
    }

    /// Whether the barrier has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    fn aborted_error(rank: usize, phase: Phase) -> SandpileError {
        SandpileError::communication(rank, phase, "barrier aborted by a failing peer")
    }
}

fn slot_index(direction: HaloDirection) -> usize {
    match direction {
        HaloDirection::North => 0,
        HaloDirection::South => 1,
    }
}

/// Edge slots, changed flags and the barrier shared by all workers.
pub struct SharedHalo {
    bands: Vec<RowBand>,
    /// `[north edge, south edge]` per rank.
    edges: Vec<[RwLock<Vec<Cell>>; 2]>,
    flags: Vec<AtomicBool>,
    barrier: PhaseBarrier,
}

impl SharedHalo {
    /// Allocate slots for `bands` with `width` interior columns.
    pub fn new(bands: &[RowBand], width: usize, timeout: Duration) -> Result<Arc<Self>> {
        let row_len = width.checked_add(2).ok_or(SandpileError::ResourceExhausted {
            what: "halo edge slot",
            cells: usize::MAX,
        })?;
        let mut edges = Vec::with_capacity(bands.len());
        for _ in bands {
            edges.push([
                RwLock::new(try_zeroed("halo edge slot", row_len)?),
                RwLock::new(try_zeroed("halo edge slot", row_len)?),
            ]);
        }

        Ok(Arc::new(Self {
            bands: bands.to_vec(),
            edges,
            flags: bands.iter().map(|_| AtomicBool::new(false)).collect(),
            barrier: PhaseBarrier::new(bands.len(), timeout),
        }))
    }

    /// Number of workers.
    pub fn workers(&self) -> usize {
        self.bands.len()
    }

    /// Port for worker `rank`.
    pub fn port(self: &Arc<Self>, rank: usize) -> Result<SharedHaloPort> {
        let band = *self
            .bands
            .get(rank)
            .ok_or_else(|| SandpileError::config(format!("no band for worker {}", rank)))?;
        Ok(SharedHaloPort {
            band,
            hub: Arc::clone(self),
        })
    }

    /// Abort the barrier so blocked workers return.
    pub fn abort(&self) {
        self.barrier.abort();
    }
}

/// One worker's view of the [`SharedHalo`].
pub struct SharedHaloPort {
    band: RowBand,
    hub: Arc<SharedHalo>,
}

impl HaloExchange for SharedHaloPort {
    fn rank(&self) -> usize {
        self.band.rank
    }

    fn exchange(&mut self, _iteration: u64, partition: &mut Partition) -> Result<()> {
        let rank = self.band.rank;
        let own = &self.hub.edges[rank];

        for direction in HaloDirection::ALL {
            if self.band.neighbor(direction).is_some() {
                own[slot_index(direction)]
                    .write()
                    .copy_from_slice(partition.edge_row(direction));
            }
        }

        self.hub.barrier.wait(rank, Phase::HaloExchange)?;

        for side in HaloDirection::ALL {
            if let Some(neighbor) = self.band.neighbor(side) {
                let slot = self.hub.edges[neighbor][slot_index(side.opposite())].read();
                partition.write_ghost(side, &slot)?;
            }
        }

        Ok(())
    }
}

impl ChangeReduction for SharedHaloPort {
    fn all_reduce_changed(&mut self, _iteration: u64, local_changed: bool) -> Result<bool> {
        let rank = self.band.rank;
        self.hub.flags[rank].store(local_changed, Ordering::Release);
        self.hub.barrier.wait(rank, Phase::Reduction)?;
        Ok(reduce_changed(
            self.hub.flags.iter().map(|flag| flag.load(Ordering::Acquire)),
        ))
    }
}
