//! Error types for the sandpile CLI.

use thiserror::Error;

/// CLI result type alias.
pub type CliResult<T> = Result<T, CliError>;

/// CLI error type.
#[derive(Error, Debug)]
pub enum CliError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The relaxation itself failed.
    #[error(transparent)]
    Sandpile(#[from] sandpile_core::SandpileError),

    /// A blocking task was cancelled or panicked.
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// A flag value could not be interpreted.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}
