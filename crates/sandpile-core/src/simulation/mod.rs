//! Sandpile relaxation: grid storage, the update kernel, row partitioning,
//! halo transports, convergence detection and result assembly.

pub mod assembler;
pub mod broker;
pub mod convergence;
pub mod engine;
pub mod grid;
pub mod halo;
pub mod kernel;
pub mod partition;
pub mod shared;

pub use assembler::{ResultAssembler, StableGrid};
pub use broker::{BrokerStats, DeliveryStatus, HaloBroker, HaloConfig, HaloEndpoint};
pub use convergence::{reduce_changed, ChangeReduction, ConvergenceCoordinator, Verdict};
pub use engine::{ExecutionMode, RelaxReport, SandpileEngine};
pub use grid::{Cell, InitialFill, SandpileGrid, TOPPLE_THRESHOLD};
pub use halo::{HaloDirection, HaloExchange};
pub use kernel::DoubleBuffer;
pub use partition::{partition_rows, Partition, RowBand};
pub use shared::{PhaseBarrier, SharedHalo, SharedHaloPort};
