//! `sandpile run` command - Relax one grid and render it.

use std::path::PathBuf;

use clap::{Args, ValueEnum};
use colored::Colorize;
use sandpile_core::{ExecutionMode, InitialFill, RelaxConfig, RelaxReport, SandpileEngine};
use tracing::info;

use crate::error::CliResult;
use crate::ppm;

/// Initial fill rule selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FillKind {
    /// Same number of grains on every cell
    Uniform,
    /// One pile at the center cell
    Center,
}

/// Arguments of the `run` command.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Interior rows
    #[arg(long)]
    pub height: Option<usize>,

    /// Interior columns
    #[arg(long)]
    pub width: Option<usize>,

    /// Worker threads for the partitioned modes
    #[arg(short = 'p', long)]
    pub workers: Option<usize>,

    /// Execution mode (serial, rayon, shared-memory, message-passing)
    #[arg(short, long)]
    pub mode: Option<ExecutionMode>,

    /// Initial fill rule
    #[arg(long, value_enum)]
    pub fill: Option<FillKind>,

    /// Grains per cell (uniform) or on the pile (center, 0 = height*width)
    #[arg(short, long)]
    pub grains: Option<u32>,

    /// Fail if the grid is not stable after this many sweeps
    #[arg(long)]
    pub max_iterations: Option<u64>,

    /// TOML configuration file; flags override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Output image
    #[arg(short, long, default_value = "sandpile.ppm")]
    pub output: PathBuf,
}

impl RunArgs {
    /// Merge the flags over the file (or default) configuration.
    pub fn to_config(&self) -> CliResult<RelaxConfig> {
        let mut config = match &self.config {
            Some(path) => RelaxConfig::load(path)?,
            None => RelaxConfig::default(),
        };

        if let Some(height) = self.height {
            config.height = height;
        }
        if let Some(width) = self.width {
            config.width = width;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(limit) = self.max_iterations {
            config.max_iterations = Some(limit);
        }

        config.fill = match (self.fill, self.grains, config.fill) {
            (Some(FillKind::Uniform), grains, _) => InitialFill::Uniform {
                grains: grains.unwrap_or(4),
            },
            (Some(FillKind::Center), grains, _) => InitialFill::CenterPile {
                grains: grains.unwrap_or(0),
            },
            (None, Some(grains), InitialFill::Uniform { .. }) => InitialFill::Uniform { grains },
            (None, Some(grains), InitialFill::CenterPile { .. }) => {
                InitialFill::CenterPile { grains }
            }
            (None, None, fill) => fill,
        };

        Ok(config)
    }
}

/// Execute the `run` command.
pub async fn execute(args: RunArgs, quiet: bool) -> CliResult<()> {
    let config = args.to_config()?;
    let engine = SandpileEngine::new(config.clone())?;

    if !quiet {
        println!("{} Relaxing sandpile", "→".bright_cyan());
        println!(
            "  {} Grid: {}",
            "•".dimmed(),
            format!("{}x{}", config.height, config.width).bright_yellow()
        );
        println!(
            "  {} Mode: {} ({} worker(s))",
            "•".dimmed(),
            config.mode.to_string().bright_yellow(),
            config.effective_workers()
        );
        println!("  {} Fill: {:?}", "•".dimmed(), config.fill);
        println!();
    }

    let report = tokio::task::spawn_blocking(move || engine.run()).await??;

    let output = args.output.clone();
    let grid = report.grid.clone();
    tokio::task::spawn_blocking(move || ppm::save_ppm(&output, &grid)).await??;
    info!(
        "Wrote {}x{} image to {}",
        report.grid.width(),
        report.grid.height(),
        args.output.display()
    );

    if !quiet {
        print_report(&report);
        println!(
            "{} Wrote {}",
            "✓".bright_green(),
            args.output.display().to_string().bright_white()
        );
    }
    Ok(())
}

fn print_report(report: &RelaxReport) {
    println!("{}:", "Result".bright_white().underline());
    println!(
        "  Ran in ({:.6}) seconds over {} iterations",
        report.elapsed.as_secs_f64(),
        report.iterations
    );
    println!(
        "  Grains: {} -> {} ({} lost to the sink)",
        report.initial_grains,
        report.final_grains,
        report.grains_lost()
    );

    let [zero, one, two, three] = report.grid.histogram();
    println!(
        "  Cells: {} x0, {} x1, {} x2, {} x3",
        zero, one, two, three
    );

    if report.workers > 1 {
        let slowest = report
            .worker_elapsed
            .iter()
            .enumerate()
            .max_by_key(|(_, elapsed)| **elapsed)
            .map(|(rank, _)| rank)
            .unwrap_or(0);
        println!("  Slowest worker: {}", slowest);
    }

    if let Some(stats) = &report.messages {
        println!(
            "  Messages: {} ({} halo cells)",
            stats.messages_delivered, stats.cells_delivered
        );
    }
    println!();
}
