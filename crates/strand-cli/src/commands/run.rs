//! `strand run`: instrument, link, and execute a program on the scheduler.

use super::load_program;
use crate::output::StyledOutput;
use anyhow::{anyhow, Context};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use strand_engine::{Runtime, RuntimeConfig, Value, VerifyMode};
use termcolor::ColorChoice;

pub struct RunArgs {
    pub file: PathBuf,
    pub entry: String,
    pub args: Vec<String>,
    pub verify: Option<String>,
    pub workers: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub config: Option<PathBuf>,
}

pub fn execute(args: RunArgs, color: ColorChoice) -> anyhow::Result<()> {
    let program = load_program(&args.file)?;
    let mut config = RuntimeConfig::load(args.config.as_deref())?;
    if let Some(mode) = &args.verify {
        config.verify.mode = mode
            .parse::<VerifyMode>()
            .map_err(|_| anyhow!("unknown verification mode `{}`", mode))?;
    }
    if let Some(workers) = args.workers {
        config.scheduler.workers = workers;
    }

    let runtime = Runtime::new(program, config).context("failed to start runtime")?;
    let entry_args = args.args.iter().map(|a| parse_arg(a)).collect();

    let started = Instant::now();
    let result = match args.timeout_ms {
        Some(ms) => runtime.run_timeout(&args.entry, entry_args, Duration::from_millis(ms)),
        None => runtime.run(&args.entry, entry_args),
    };
    let elapsed = started.elapsed();
    runtime.shutdown();

    let mut output = StyledOutput::new(color);
    match result {
        Ok(value) => {
            if !value.is_null() {
                output.info(&value.to_string());
                output.newline();
            }
            output.dim(&format!("finished in {:.2?}", elapsed));
            output.newline();
            output.flush();
            Ok(())
        }
        Err(e) => {
            output.error("error: ");
            output.plain(&e.to_string());
            output.newline();
            output.flush();
            Err(anyhow!("{} failed", args.entry))
        }
    }
}

/// Integers, floats, and booleans are passed as such; anything else as a string
fn parse_arg(arg: &str) -> Value {
    if let Ok(v) = arg.parse::<i64>() {
        Value::Int(v)
    } else if let Ok(v) = arg.parse::<f64>() {
        Value::Float(v)
    } else if let Ok(v) = arg.parse::<bool>() {
        Value::Bool(v)
    } else {
        Value::from(arg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arg() {
        assert_eq!(parse_arg("42"), Value::Int(42));
        assert_eq!(parse_arg("1.5"), Value::Float(1.5));
        assert_eq!(parse_arg("true"), Value::Bool(true));
        assert_eq!(parse_arg("Main.f"), Value::from("Main.f"));
    }
}
