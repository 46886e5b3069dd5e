//! Strand command-line tool
//!
//! Instruments, checks, and runs JSON programs on the fiber engine, and
//! runs the ring relay benchmark.

mod commands;
mod output;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;

#[derive(Parser)]
#[command(name = "strand")]
#[command(about = "Fiber instrumentation and runtime toolchain", long_about = None)]
#[command(version)]
struct Cli {
    /// Color output: auto, always, never
    #[arg(long, global = true)]
    color: Option<String>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Instrument a program and write the result
    Instrument {
        /// Program file (JSON)
        file: PathBuf,
        /// Output file; defaults to stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Print the instrumented program as a listing instead of JSON
        #[arg(short, long)]
        print: bool,
        #[command(flatten)]
        options: commands::InstrumentArgs,
    },

    /// Analyze and link a program without running it
    Check {
        /// Program file (JSON)
        file: PathBuf,
        #[command(flatten)]
        options: commands::InstrumentArgs,
    },

    /// Run a program
    Run {
        /// Program file (JSON)
        file: PathBuf,
        /// Entry method
        #[arg(short, long, default_value = "Main.main")]
        entry: String,
        /// Arguments for the entry method (integers, floats, booleans, or strings)
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
        /// Verification mode: off, warn, fail
        #[arg(long)]
        verify: Option<String>,
        /// Worker threads (0 = one per CPU)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Give up after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Runtime config file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Relay a counter around a ring of fibers
    Ring {
        /// Fibers in the ring
        #[arg(short = 'n', long, default_value_t = 100)]
        fibers: i64,
        /// Full rounds around the ring
        #[arg(short = 'm', long, default_value_t = 1000)]
        rounds: i64,
        /// Worker threads (0 = one per CPU)
        #[arg(short, long)]
        workers: Option<usize>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    strand_engine::logging::init(level);
    let color = output::resolve_color_choice(cli.color.as_deref());

    match cli.command {
        Commands::Instrument {
            file,
            out,
            print,
            options,
        } => commands::instrument::execute(&file, out.as_deref(), print, &options, color),

        Commands::Check { file, options } => commands::check::execute(&file, &options, color),

        Commands::Run {
            file,
            entry,
            args,
            verify,
            workers,
            timeout_ms,
            config,
        } => commands::run::execute(
            commands::run::RunArgs {
                file,
                entry,
                args,
                verify,
                workers,
                timeout_ms,
                config,
            },
            color,
        ),

        Commands::Ring {
            fibers,
            rounds,
            workers,
        } => commands::ring::execute(fibers, rounds, workers, color),
    }
}
