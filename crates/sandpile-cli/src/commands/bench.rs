//! `sandpile bench` command - Batch timing over grid sizes and worker counts.

use std::time::Duration;

use colored::Colorize;
use sandpile_core::{ExecutionMode, RelaxConfig, SandpileEngine};
use tracing::debug;

use super::parse_counts;
use crate::error::{CliError, CliResult};

/// One measured configuration.
#[derive(Debug, Clone)]
pub struct BenchRow {
    /// Grid edge length.
    pub size: usize,
    /// Workers used.
    pub workers: usize,
    /// Sweeps to the fixed point.
    pub iterations: u64,
    /// Relaxation time of every repeat.
    pub times: Vec<Duration>,
}

impl BenchRow {
    /// Mean relaxation time.
    pub fn average(&self) -> Duration {
        if self.times.is_empty() {
            return Duration::ZERO;
        }
        self.times.iter().sum::<Duration>() / self.times.len() as u32
    }

    /// Fastest repeat.
    pub fn best(&self) -> Duration {
        self.times.iter().copied().min().unwrap_or_default()
    }
}

/// Relax a saturated `size x size` grid `repeats` times.
pub fn measure(
    size: usize,
    workers: usize,
    mode: ExecutionMode,
    repeats: usize,
) -> CliResult<BenchRow> {
    let engine = SandpileEngine::new(
        RelaxConfig::new(size, size)
            .with_workers(workers)
            .with_mode(mode),
    )?;

    let mut times = Vec::with_capacity(repeats);
    let mut iterations = 0;
    for _ in 0..repeats {
        let report = engine.run()?;
        iterations = report.iterations;
        times.push(report.elapsed);
    }

    Ok(BenchRow {
        size,
        workers,
        iterations,
        times,
    })
}

/// Execute the `bench` command.
pub async fn execute(sizes: &str, workers: &str, mode: ExecutionMode, repeats: usize) -> CliResult<()> {
    if repeats == 0 {
        return Err(CliError::InvalidArgument(
            "repeats must be at least 1".to_string(),
        ));
    }
    let sizes = parse_counts(sizes, "grid size")?;
    let worker_counts = if mode.is_partitioned() {
        parse_counts(workers, "worker count")?
    } else {
        vec![1]
    };

    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║              Sandpile Relaxation Benchmark                       ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();
    println!(
        "Mode: {}   Repeats: {}",
        mode.to_string().bright_yellow(),
        repeats
    );
    println!();
    println!(
        "{:<12} {:>8} {:>12} {:>14} {:>14} {:>10}",
        "Grid Size", "Workers", "Iterations", "Avg (s)", "Best (s)", "Speedup"
    );
    println!("{}", "-".repeat(75));

    for &size in &sizes {
        let mut baseline: Option<Duration> = None;
        for &count in &worker_counts {
            if count > size {
                println!(
                    "{:<12} {:>8} {}",
                    format!("{}x{}", size, size),
                    count,
                    "skipped (more workers than rows)".dimmed()
                );
                continue;
            }

            let row = tokio::task::spawn_blocking(move || measure(size, count, mode, repeats))
                .await??;
            let average = row.average();
            debug!(
                "{}x{} with {} worker(s): {:?}",
                size, size, count, row.times
            );
            let base = *baseline.get_or_insert(average);
            let speedup = if average.is_zero() {
                1.0
            } else {
                base.as_secs_f64() / average.as_secs_f64()
            };

            println!(
                "{:<12} {:>8} {:>12} {:>14.6} {:>14.6} {:>9.2}x",
                format!("{}x{}", size, size),
                row.workers,
                row.iterations,
                average.as_secs_f64(),
                row.best().as_secs_f64(),
                speedup
            );
        }
    }
    println!();
    Ok(())
}
