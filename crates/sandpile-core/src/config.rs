//! Run configuration.
//!
//! A [`RelaxConfig`] can be built in code or loaded from TOML:
//!
//! ```toml
//! height = 513
//! width = 513
//! workers = 8
//! mode = "message_passing"
//! max_iterations = 100000
//!
//! [fill]
//! kind = "center_pile"
//! grains = 0
//! ```
//!
//! Every field is optional in the file and falls back to its default.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandpileError};
use crate::simulation::broker::HaloConfig;
use crate::simulation::engine::ExecutionMode;
use crate::simulation::grid::InitialFill;

/// Parameters of one relaxation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaxConfig {
    /// Interior rows.
    #[serde(default = "default_extent")]
    pub height: usize,

    /// Interior columns.
    #[serde(default = "default_extent")]
    pub width: usize,

    /// Worker count for the partitioned modes.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Initial grain placement.
    #[serde(default)]
    pub fill: InitialFill,

    /// How the sweep is parallelized.
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Fail instead of sweeping past this many iterations.
    #[serde(default)]
    pub max_iterations: Option<u64>,

    /// How long a worker waits on a peer before giving up, in milliseconds.
    #[serde(default = "default_exchange_timeout")]
    pub exchange_timeout_ms: u64,

    /// Minimum mailbox capacity for the message-passing transport.
    #[serde(default = "default_max_pending")]
    pub max_pending_messages: usize,
}

fn default_extent() -> usize {
    512
}

fn default_workers() -> usize {
    4
}

fn default_exchange_timeout() -> u64 {
    30_000
}

fn default_max_pending() -> usize {
    64
}

impl Default for RelaxConfig {
    fn default() -> Self {
        Self {
            height: default_extent(),
            width: default_extent(),
            workers: default_workers(),
            fill: InitialFill::default(),
            mode: ExecutionMode::default(),
            max_iterations: None,
            exchange_timeout_ms: default_exchange_timeout(),
            max_pending_messages: default_max_pending(),
        }
    }
}

impl RelaxConfig {
    /// Create a configuration for a `height x width` grid.
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            ..Default::default()
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Set grid dimensions.
    pub fn with_size(mut self, height: usize, width: usize) -> Self {
        self.height = height;
        self.width = width;
        self
    }

    /// Set the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the execution mode.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the initial fill.
    pub fn with_fill(mut self, fill: InitialFill) -> Self {
        self.fill = fill;
        self
    }

    /// Cap the number of iterations.
    pub fn with_max_iterations(mut self, limit: u64) -> Self {
        self.max_iterations = Some(limit);
        self
    }

    /// Set the peer timeout.
    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Peer timeout as a [`Duration`].
    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    /// Workers actually started: the single-partition modes always use one.
    pub fn effective_workers(&self) -> usize {
        if self.mode.is_partitioned() {
            self.workers
        } else {
            1
        }
    }

    /// Broker settings for the message-passing mode.
    pub fn halo_config(&self) -> HaloConfig {
        HaloConfig {
            max_pending_messages: self.max_pending_messages,
            receive_timeout: self.exchange_timeout(),
        }
    }

    /// Check the configuration before any buffer is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.height == 0 || self.width == 0 {
            return Err(SandpileError::config(format!(
                "grid dimensions must be positive, got {}x{}",
                self.height, self.width
            )));
        }
        if self.workers == 0 {
            return Err(SandpileError::config("worker count must be at least 1"));
        }
        if self.effective_workers() > self.height {
            return Err(SandpileError::config(format!(
                "{} workers for {} rows would leave a worker with zero rows",
                self.workers, self.height
            )));
        }
        if self.exchange_timeout_ms == 0 {
            return Err(SandpileError::config("exchange timeout must be positive"));
        }
        if self.max_iterations == Some(0) {
            return Err(SandpileError::config("iteration cap must be positive"));
        }
        Ok(())
    }
}
