//! # Sandpile Core
//!
//! Parallel relaxation of the two-dimensional Abelian sandpile.
//!
//! A rectangular grid of grain counts is surrounded by a sink border that
//! swallows every grain toppled onto it. Each sweep applies the synchronous
//! update rule to all interior cells at once; sweeps repeat until nothing
//! changes. The grid can be split into row bands, each relaxed by its own
//! worker thread, with ghost rows kept consistent by one of two transports:
//!
//! - shared memory: edge slots read and written around a phase barrier
//! - message passing: tagged messages through per-worker mailboxes
//!
//! Every worker count and every mode reaches the same fixed point.
//!
//! ## Example
//!
//! ```no_run
//! use sandpile_core::{ExecutionMode, RelaxConfig, SandpileEngine};
//!
//! let config = RelaxConfig::new(513, 513)
//!     .with_workers(8)
//!     .with_mode(ExecutionMode::MessagePassing);
//! let report = SandpileEngine::new(config)?.run()?;
//! println!("stable after {} iterations", report.iterations);
//! # Ok::<(), sandpile_core::SandpileError>(())
//! ```

pub mod config;
pub mod error;
pub mod simulation;

pub use config::RelaxConfig;
pub use error::{Phase, Result, SandpileError};
pub use simulation::{
    ExecutionMode, InitialFill, RelaxReport, SandpileEngine, SandpileGrid, StableGrid,
};
