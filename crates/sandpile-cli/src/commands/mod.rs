//! CLI command implementations.

pub mod bench;
pub mod run;

use crate::error::{CliError, CliResult};

/// Parse a comma-separated list of positive integers.
pub fn parse_counts(list: &str, what: &str) -> CliResult<Vec<usize>> {
    let counts = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| match s.parse::<usize>() {
            Ok(0) | Err(_) => Err(CliError::InvalidArgument(format!(
                "'{}' is not a valid {}",
                s, what
            ))),
            Ok(n) => Ok(n),
        })
        .collect::<CliResult<Vec<_>>>()?;

    if counts.is_empty() {
        return Err(CliError::InvalidArgument(format!("no {} given", what)));
    }
    Ok(counts)
}
