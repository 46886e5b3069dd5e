//! Subcommand implementations

pub mod check;
pub mod instrument;
pub mod ring;
pub mod run;

use anyhow::Context;
use clap::Args;
use std::path::{Path, PathBuf};
use strand_engine::{InstrumentOptions, Instrumentor, Program, RuntimeConfig};

/// Instrumentation flags shared by `instrument` and `check`
#[derive(Args, Debug, Default)]
pub struct InstrumentArgs {
    /// File listing suspendable methods, one name or `Owner.*` per line
    #[arg(long)]
    pub suspendables: Option<PathBuf>,
    /// File listing methods that never suspend
    #[arg(long)]
    pub non_suspendables: Option<PathBuf>,
    /// Allow suspendable synchronized methods
    #[arg(long)]
    pub allow_monitors: bool,
    /// Allow thread-blocking natives in suspendable methods
    #[arg(long)]
    pub allow_blocking: bool,
    /// Never rewrite methods matching this pattern
    #[arg(long)]
    pub exclude: Vec<String>,
    /// Runtime config file (TOML); its [instrument] section is the base
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl InstrumentArgs {
    /// Merge the flags over the config file
    pub fn options(&self) -> anyhow::Result<InstrumentOptions> {
        let mut options = RuntimeConfig::load(self.config.as_deref())?.instrument;
        options.allow_monitors |= self.allow_monitors;
        options.allow_blocking |= self.allow_blocking;
        options.exclude.extend(self.exclude.iter().cloned());
        options.suspendables.extend(read_list(self.suspendables.as_deref())?);
        options.non_suspendables.extend(read_list(self.non_suspendables.as_deref())?);
        Ok(options)
    }

    /// Build the instrumentor
    pub fn instrumentor(&self) -> anyhow::Result<Instrumentor> {
        Ok(Instrumentor::new(self.options()?))
    }
}

fn read_list(path: Option<&Path>) -> anyhow::Result<Vec<String>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(strand_engine::instrument::classifier::parse_list(&text))
}

/// Read and validate a JSON program
pub fn load_program(path: &Path) -> anyhow::Result<Program> {
    let source = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    Program::from_json(&source).with_context(|| format!("invalid program {}", path.display()))
}
