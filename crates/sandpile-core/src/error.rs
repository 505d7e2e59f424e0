//! Error types for sandpile relaxation.

use std::fmt;

use thiserror::Error;

/// Result type for sandpile operations.
pub type Result<T> = std::result::Result<T, SandpileError>;

/// Protocol step in which a communication fault was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Ghost-row exchange before a sweep.
    HaloExchange,
    /// Global OR-reduction of the changed flags after a sweep.
    Reduction,
    /// Collection of interior rows after convergence.
    Gather,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::HaloExchange => "halo exchange",
            Phase::Reduction => "convergence reduction",
            Phase::Gather => "result gather",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while configuring or running a relaxation.
///
/// None of these are recoverable mid-run: a fault in any worker aborts the
/// whole relaxation.
#[derive(Error, Debug)]
pub enum SandpileError {
    /// Invalid grid dimensions, worker count or transport settings.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A grid or partition buffer could not be allocated.
    #[error("Failed to allocate {what} ({cells} cells)")]
    ResourceExhausted {
        /// Which buffer was being allocated.
        what: &'static str,
        /// Requested length in cells.
        cells: usize,
    },

    /// A halo exchange, reduction or gather did not complete.
    #[error("Communication error on worker {worker} during {phase}: {reason}")]
    Communication {
        /// Rank of the worker that observed the fault.
        worker: usize,
        /// Protocol step that failed.
        phase: Phase,
        /// Human readable cause.
        reason: String,
    },

    /// The host-imposed iteration cap was reached before the grid stabilized.
    #[error("Grid did not stabilize within {limit} iterations")]
    IterationLimit {
        /// The configured cap.
        limit: u64,
    },

    /// A worker thread panicked.
    #[error("Worker {worker} panicked")]
    WorkerPanicked {
        /// Rank of the panicking worker.
        worker: usize,
    },

    /// Configuration file could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandpileError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a communication error for `worker` in `phase`.
    pub fn communication(worker: usize, phase: Phase, reason: impl Into<String>) -> Self {
        Self::Communication {
            worker,
            phase,
            reason: reason.into(),
        }
    }

    /// Whether this error is a configuration error.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Whether this error is a communication error.
    pub fn is_communication(&self) -> bool {
        matches!(self, Self::Communication { .. })
    }
}

/// Allocate a zeroed cell buffer, reporting allocation failure instead of aborting.
pub(crate) fn try_zeroed<T: Copy + Default>(what: &'static str, len: usize) -> Result<Vec<T>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| SandpileError::ResourceExhausted { what, cells: len })?;
    buffer.resize(len, T::default());
    Ok(buffer)
}

/// Cells in a `rows x cols` block.
pub(crate) fn cell_count(what: &'static str, rows: usize, cols: usize) -> Result<usize> {
    rows.checked_mul(cols).ok_or(SandpileError::ResourceExhausted {
        what,
        cells: usize::MAX,
    })
}

/// Cells in a `rows x cols` interior surrounded by a one-cell border.
pub(crate) fn padded_len(what: &'static str, rows: usize, cols: usize) -> Result<usize> {
    let overflow = SandpileError::ResourceExhausted {
        what,
        cells: usize::MAX,
    };
    match (rows.checked_add(2), cols.checked_add(2)) {
        (Some(rows), Some(cols)) => cell_count(what, rows, cols),
        _ => Err(overflow),
    }
}
