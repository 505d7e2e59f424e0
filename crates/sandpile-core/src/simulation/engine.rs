//! Lock-step relaxation driver.
//!
//! Every worker runs the same loop on its own [`Partition`]:
//!
//! ```text
//! loop {
//!     exchange ghost rows      (blocks on neighbors)
//!     sweep owned rows         (local changed flag)
//!     all-reduce changed flag  (blocks on everyone)
//!     swap buffers
//!     stop if nothing changed anywhere
//! }
//! ```
//!
//! The first worker to fail records its error and aborts the transport so
//! its peers return promptly instead of waiting out their timeouts.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::assembler::{ResultAssembler, StableGrid};
use super::broker::{BrokerStats, HaloBroker};
use super::convergence::{ChangeReduction, ConvergenceCoordinator, SoloReduction, Verdict};
use super::grid::{Cell, InitialFill, SandpileGrid};
use super::halo::{HaloExchange, SoloExchange};
use super::partition::{partition_rows, Partition, RowBand};
use super::shared::SharedHalo;
use crate::config::RelaxConfig;
use crate::error::{Result, SandpileError};

/// How the relaxation is parallelized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One partition, sequential sweep.
    Serial,
    /// One partition, rows of each sweep relaxed in parallel.
    Rayon,
    /// One thread per partition, ghost rows through shared edge slots.
    #[default]
    SharedMemory,
    /// One thread per partition, ghost rows through broker mailboxes.
    MessagePassing,
}

impl ExecutionMode {
    /// All modes.
    pub const ALL: [ExecutionMode; 4] = [
        ExecutionMode::Serial,
        ExecutionMode::Rayon,
        ExecutionMode::SharedMemory,
        ExecutionMode::MessagePassing,
    ];

    /// Whether the grid is split across worker threads.
    pub fn is_partitioned(&self) -> bool {
        matches!(
            self,
            ExecutionMode::SharedMemory | ExecutionMode::MessagePassing
        )
    }

    /// Short name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Serial => "serial",
            ExecutionMode::Rayon => "rayon",
            ExecutionMode::SharedMemory => "shared-memory",
            ExecutionMode::MessagePassing => "message-passing",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = SandpileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "serial" => Ok(ExecutionMode::Serial),
            "rayon" | "parallel" => Ok(ExecutionMode::Rayon),
            "shared-memory" | "shared" => Ok(ExecutionMode::SharedMemory),
            "message-passing" | "mp" => Ok(ExecutionMode::MessagePassing),
            other => Err(SandpileError::config(format!(
                "unknown execution mode '{}' (expected serial, rayon, shared-memory or message-passing)",
                other
            ))),
        }
    }
}

/// Outcome of a completed relaxation.
#[derive(Debug, Clone)]
pub struct RelaxReport {
    /// The stable configuration.
    pub grid: StableGrid,
    /// Mode the run used.
    pub mode: ExecutionMode,
    /// Workers that took part.
    pub workers: usize,
    /// Sweeps performed, including the final one that changed nothing.
    pub iterations: u64,
    /// Relaxation time of the slowest worker.
    pub elapsed: Duration,
    /// Relaxation time per worker, by rank.
    pub worker_elapsed: Vec<Duration>,
    /// Grains before relaxation.
    pub initial_grains: u64,
    /// Grains left at the fixed point.
    pub final_grains: u64,
    /// Broker traffic, for the message-passing mode.
    pub messages: Option<BrokerStats>,
}

impl RelaxReport {
    /// Grains that fell into the sink.
    pub fn grains_lost(&self) -> u64 {
        self.initial_grains.saturating_sub(self.final_grains)
    }
}

/// Where partition contents come from.
#[derive(Clone, Copy)]
enum Initial<'a> {
    Fill(InitialFill),
    Grid(&'a SandpileGrid),
}

impl Initial<'_> {
    fn load(&self, band: RowBand, height: usize, width: usize) -> Result<Partition> {
        match self {
            Initial::Fill(fill) => Partition::with_fill(band, height, width, *fill),
            Initial::Grid(grid) => Partition::from_grid(band, grid),
        }
    }
}

/// What a worker hands back after the loop.
struct WorkerOutcome {
    rank: usize,
    interior: Vec<Cell>,
    iterations: u64,
    elapsed: Duration,
}

/// Joins a separate exchanger and reduction into one transport.
struct Split<H, R> {
    halo: H,
    reduction: R,
}

impl<H: HaloExchange, R: ChangeReduction> HaloExchange for Split<H, R> {
    fn rank(&self) -> usize {
        self.halo.rank()
    }

    fn exchange(&mut self, iteration: u64, partition: &mut Partition) -> Result<()> {
        self.halo.exchange(iteration, partition)
    }
}

impl<H: HaloExchange, R: ChangeReduction> ChangeReduction for Split<H, R> {
    fn all_reduce_changed(&mut self, iteration: u64, local_changed: bool) -> Result<bool> {
        self.reduction.all_reduce_changed(iteration, local_changed)
    }
}

/// First error raised by any worker.
#[derive(Default)]
struct FaultLatch {
    first: Mutex<Option<SandpileError>>,
}

impl FaultLatch {
    /// Keep `err` if it is the first fault. Returns whether it was.
    fn record(&self, rank: usize, err: SandpileError) -> bool {
        let mut first = self.first.lock();
        if first.is_some() {
            debug!("Worker {} also failed: {}", rank, err);
            return false;
        }
        warn!("Worker {} failed, aborting peers: {}", rank, err);
        *first = Some(err);
        true
    }

    fn into_inner(self) -> Option<SandpileError> {
        self.first.into_inner()
    }
}

/// Run one worker until the global verdict is stable.
fn drive<T>(
    mut partition: Partition,
    transport: &mut T,
    max_iterations: Option<u64>,
    parallel_sweep: bool,
) -> Result<WorkerOutcome>
where
    T: HaloExchange + ChangeReduction,
{
    let rank = transport.rank();
    let mut coordinator = ConvergenceCoordinator::new(max_iterations);
    let started = Instant::now();

    loop {
        let iteration = coordinator.iterations();
        transport.exchange(iteration, &mut partition)?;

        let local_changed = if parallel_sweep {
            partition.sweep_parallel()
        } else {
            partition.sweep()
        };

        let global_changed = transport.all_reduce_changed(iteration, local_changed)?;
        partition.swap();
        trace!(
            rank,
            iteration,
            local_changed,
            global_changed,
            "sweep complete"
        );

        if coordinator.observe(global_changed)? == Verdict::Stable {
            break;
        }
    }

    let elapsed = started.elapsed();
    debug!(
        "Worker {} (rows {}..{}) stable after {} iterations in {:?}",
        rank,
        partition.band().start,
        partition.band().end,
        coordinator.iterations(),
        elapsed
    );

    Ok(WorkerOutcome {
        rank,
        interior: partition.interior(),
        iterations: coordinator.iterations(),
        elapsed,
    })
}

/// Runs sandpile relaxations.
pub struct SandpileEngine {
    config: RelaxConfig,
}

impl SandpileEngine {
    /// Create an engine, rejecting invalid configurations up front.
    pub fn new(config: RelaxConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The configuration.
    pub fn config(&self) -> &RelaxConfig {
        &self.config
    }

    /// Relax a grid populated from the configured fill.
    pub fn run(&self) -> Result<RelaxReport> {
        self.execute(&self.config, Initial::Fill(self.config.fill))
    }

    /// Relax a copy of `grid`. Its dimensions replace the configured ones.
    pub fn run_from(&self, grid: &SandpileGrid) -> Result<RelaxReport> {
        let config = self.config.clone().with_size(grid.height, grid.width);
        config.validate()?;
        self.execute(&config, Initial::Grid(grid))
    }

    fn execute(&self, config: &RelaxConfig, initial: Initial<'_>) -> Result<RelaxReport> {
        let (height, width) = (config.height, config.width);
        let bands = partition_rows(height, width, config.effective_workers())?;

        // Every buffer is allocated before the first iteration.
        let partitions = bands
            .iter()
            .map(|&band| initial.load(band, height, width))
            .collect::<Result<Vec<_>>>()?;
        let initial_grains: u64 = partitions.iter().map(Partition::total_grains).sum();

        info!(
            "Relaxing {}x{} grid ({} grains) with {} worker(s), mode {}",
            height,
            width,
            initial_grains,
            bands.len(),
            config.mode
        );

        let (outcomes, messages) = match config.mode {
            ExecutionMode::Serial | ExecutionMode::Rayon => {
                let outcomes = self.run_single(partitions, config)?;
                (outcomes, None)
            }
            ExecutionMode::SharedMemory => {
                let hub = SharedHalo::new(&bands, width, config.exchange_timeout())?;
                let transports = bands
                    .iter()
                    .map(|band| hub.port(band.rank))
                    .collect::<Result<Vec<_>>>()?;
                let outcomes = run_workers(partitions, transports, config.max_iterations, || {
                    hub.abort()
                })?;
                (outcomes, None)
            }
            ExecutionMode::MessagePassing => {
                let broker = HaloBroker::new(config.halo_config());
                let transports: Vec<_> = bands
                    .iter()
                    .map(|band| broker.register(band.rank, bands.len()))
                    .collect();
                let outcomes = run_workers(partitions, transports, config.max_iterations, || {
                    broker.shutdown()
                })?;
                (outcomes, Some(broker.stats()))
            }
        };

        let iterations = outcomes.first().map_or(0, |o| o.iterations);
        debug_assert!(outcomes.iter().all(|o| o.iterations == iterations));
        let worker_elapsed: Vec<Duration> = outcomes.iter().map(|o| o.elapsed).collect();
        let elapsed = worker_elapsed.iter().copied().max().unwrap_or_default();

        let mut assembler = ResultAssembler::new(&bands, width)?;
        for outcome in &outcomes {
            assembler.contribute(outcome.rank, &outcome.interior)?;
        }
        let grid = assembler.finish()?;
        let final_grains = grid.total_grains();

        info!(
            "Stable after {} iterations in {:?} ({} grains left)",
            iterations, elapsed, final_grains
        );

        Ok(RelaxReport {
            grid,
            mode: config.mode,
            workers: bands.len(),
            iterations,
            elapsed,
            worker_elapsed,
            initial_grains,
            final_grains,
            messages,
        })
    }

    fn run_single(
        &self,
        partitions: Vec<Partition>,
        config: &RelaxConfig,
    ) -> Result<Vec<WorkerOutcome>> {
        let mut outcomes = Vec::with_capacity(1);
        for partition in partitions {
            let mut solo = Split {
                halo: SoloExchange,
                reduction: SoloReduction,
            };
            outcomes.push(drive(
                partition,
                &mut solo,
                config.max_iterations,
                config.mode == ExecutionMode::Rayon,
            )?);
        }
        Ok(outcomes)
    }
}

/// Run one scoped thread per partition and collect their outcomes by rank.
fn run_workers<T, F>(
    partitions: Vec<Partition>,
    transports: Vec<T>,
    max_iterations: Option<u64>,
    abort: F,
) -> Result<Vec<WorkerOutcome>>
where
    T: HaloExchange + ChangeReduction,
    F: Fn() + Sync,
{
    let latch = FaultLatch::default();

    let outcomes: Vec<Option<WorkerOutcome>> = thread::scope(|s| {
        let mut handles = Vec::with_capacity(partitions.len());
        for (partition, mut transport) in partitions.into_iter().zip(transports) {
            let rank = partition.rank();
            let latch = &latch;
            let abort = &abort;

            let spawned = thread::Builder::new()
                .name(format!("sandpile-worker-{}", rank))
                .spawn_scoped(s, move || {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| {
                        drive(partition, &mut transport, max_iterations, false)
                    }))
                    .unwrap_or_else(|_| Err(SandpileError::WorkerPanicked { worker: rank }));

                    match result {
                        Ok(outcome) => Some(outcome),
                        Err(err) => {
                            latch.record(rank, err);
                            abort();
                            None
                        }
                    }
                });

            match spawned {
                Ok(handle) => handles.push((rank, handle)),
                Err(err) => {
                    latch.record(rank, SandpileError::Io(err));
                    abort();
                    break;
                }
            }
        }

        handles
            .into_iter()
            .map(|(rank, handle)| {
                handle.join().unwrap_or_else(|_| {
                    latch.record(rank, SandpileError::WorkerPanicked { worker: rank });
                    None
                })
            })
            .collect()
    });

    if let Some(err) = latch.into_inner() {
        return Err(err);
    }

    outcomes
        .into_iter()
        .enumerate()
        .map(|(rank, outcome)| outcome.ok_or(SandpileError::WorkerPanicked { worker: rank }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("serial".parse::<ExecutionMode>().unwrap(), ExecutionMode::Serial);
        assert_eq!(
            "message_passing".parse::<ExecutionMode>().unwrap(),
            ExecutionMode::MessagePassing
        );
        assert_eq!(
            "Shared-Memory".parse::<ExecutionMode>().unwrap(),
            ExecutionMode::SharedMemory
        );
        assert!("gpu".parse::<ExecutionMode>().unwrap_err().is_configuration());

        for mode in ExecutionMode::ALL {
            assert_eq!(mode.to_string().parse::<ExecutionMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_single_cell_drains() {
        let engine = SandpileEngine::new(
            RelaxConfig::new(1, 1)
                .with_workers(1)
                .with_mode(ExecutionMode::Serial),
        )
        .unwrap();
        let report = engine.run().unwrap();

        assert_eq!(report.grid.cells(), &[0]);
        assert_eq!(report.iterations, 2);
        assert_eq!(report.initial_grains, 4);
        assert_eq!(report.grains_lost(), 4);
        assert!(report.messages.is_none());
    }

    #[test]
    fn test_two_by_two_all_modes() {
        for mode in ExecutionMode::ALL {
            let engine =
                SandpileEngine::new(RelaxConfig::new(2, 2).with_workers(2).with_mode(mode)).unwrap();
            let report = engine.run().unwrap();

            assert_eq!(report.grid.cells(), &[2, 2, 2, 2], "mode {}", mode);
            assert_eq!(report.iterations, 2, "mode {}", mode);
            assert_eq!(report.worker_elapsed.len(), report.workers);
        }
    }

    #[test]
    fn test_message_passing_reports_traffic() {
        let engine = SandpileEngine::new(
            RelaxConfig::new(6, 4)
                .with_workers(3)
                .with_mode(ExecutionMode::MessagePassing),
        )
        .unwrap();
        let report = engine.run().unwrap();
        let stats = report.messages.unwrap();

        // Per iteration: 4 rows, 2 flags to the root, 2 verdicts back.
        assert_eq!(stats.messages_delivered, 8 * report.iterations);
        assert_eq!(stats.cells_delivered, 4 * 6 * report.iterations);
    }

    #[test]
    fn test_iteration_cap_is_reported() {
        for mode in ExecutionMode::ALL {
            let engine = SandpileEngine::new(
                RelaxConfig::new(8, 8)
                    .with_workers(2)
                    .with_mode(mode)
                    .with_max_iterations(2),
            )
            .unwrap();

            let err = engine.run().unwrap_err();
            assert!(
                matches!(err, SandpileError::IterationLimit { limit: 2 }),
                "mode {}: {}",
                mode,
                err
            );
        }
    }

    #[test]
    fn test_run_from_uses_grid_dimensions() {
        let engine = SandpileEngine::new(RelaxConfig::default()).unwrap();
        let grid = SandpileGrid::from_interior(3, 3, &[0, 0, 0, 0, 10, 0, 0, 0, 0]).unwrap();

        let report = engine.run_from(&grid).unwrap();
        assert_eq!(report.grid.cells(), &[0, 2, 0, 2, 2, 2, 0, 2, 0]);
        assert_eq!(report.workers, 3);
    }

    #[test]
    fn test_run_from_rejects_too_many_workers() {
        let engine = SandpileEngine::new(RelaxConfig::default().with_workers(4)).unwrap();
        let grid = SandpileGrid::new(3, 3).unwrap();

        assert!(engine.run_from(&grid).unwrap_err().is_configuration());
    }

    #[test]
    fn test_worker_failure_aborts_peers() {
        struct Faulty;

        impl HaloExchange for Faulty {
            fn rank(&self) -> usize {
                1
            }

            fn exchange(&mut self, _iteration: u64, _partition: &mut Partition) -> Result<()> {
                Err(SandpileError::communication(
                    1,
                    crate::error::Phase::HaloExchange,
                    "injected",
                ))
            }
        }

        let bands = partition_rows(4, 2, 2).unwrap();
        let hub = SharedHalo::new(&bands, 2, Duration::from_secs(30)).unwrap();
        let partitions: Vec<Partition> = bands
            .iter()
            .map(|&band| Partition::with_fill(band, 4, 2, InitialFill::default()).unwrap())
            .collect();

        let healthy = hub.port(0).unwrap();
        let faulty = Split {
            halo: Faulty,
            reduction: SoloReduction,
        };
        let transports: Vec<Box<dyn Transport>> = vec![Box::new(healthy), Box::new(faulty)];

        let started = Instant::now();
        let err = run_workers(partitions, transports, None, || hub.abort())
            .err()
            .unwrap();

        assert!(err.to_string().contains("injected"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    trait Transport: HaloExchange + ChangeReduction {}
    impl<T: HaloExchange + ChangeReduction> Transport for T {}

    impl HaloExchange for Box<dyn Transport> {
        fn rank(&self) -> usize {
            (**self).rank()
        }

        fn exchange(&mut self, iteration: u64, partition: &mut Partition) -> Result<()> {
            (**self).exchange(iteration, partition)
        }
    }

    impl ChangeReduction for Box<dyn Transport> {
        fn all_reduce_changed(&mut self, iteration: u64, local_changed: bool) -> Result<bool> {
            (**self).all_reduce_changed(iteration, local_changed)
        }
    }
}
