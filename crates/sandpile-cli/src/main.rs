//! Sandpile CLI - Relax Abelian sandpiles, render them, and time the engine.
//!
//! # Commands
//!
//! - `sandpile run` - Relax one grid and write it as a PPM image
//! - `sandpile bench` - Time relaxations over grid sizes and worker counts
//! - `sandpile completions <shell>` - Generate shell completions
//!
//! # Examples
//!
//! ```bash
//! # 513x513 saturated grid on 8 message-passing workers
//! sandpile run --height 513 --width 513 -p 8 --mode message-passing
//!
//! # Single center pile, serial reference run
//! sandpile run --fill center --grains 100000 --mode serial -o pile.ppm
//!
//! # Scaling sweep
//! sandpile bench --sizes 128,256,513 --workers 1,2,4,8 --repeats 3
//! ```

use clap::{Parser, Subcommand};
use colored::Colorize;
use sandpile_core::ExecutionMode;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;
mod error;
mod ppm;

use commands::{bench, run};

/// Sandpile CLI - parallel Abelian sandpile relaxation
#[derive(Parser)]
#[command(name = "sandpile")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Relax a grid to its stable configuration and render it
    Run(run::RunArgs),

    /// Time relaxations over grid sizes and worker counts
    Bench {
        /// Grid edge lengths (comma-separated)
        #[arg(short, long, default_value = "128,256,513")]
        sizes: String,

        /// Worker counts (comma-separated)
        #[arg(short = 'p', long, default_value = "1,2,4,8")]
        workers: String,

        /// Execution mode
        #[arg(short, long, default_value = "message-passing")]
        mode: ExecutionMode,

        /// Runs per configuration
        #[arg(short, long, default_value = "3")]
        repeats: usize,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn setup_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    let result = match cli.command {
        Commands::Run(args) => run::execute(args, cli.quiet).await,

        Commands::Bench {
            sizes,
            workers,
            mode,
            repeats,
        } => bench::execute(&sizes, &workers, mode, repeats).await,

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "sandpile",
                &mut std::io::stdout(),
            );
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
