//! `strand instrument`: rewrite suspendable methods and write the program back out.

use super::{load_program, InstrumentArgs};
use crate::output::StyledOutput;
use anyhow::Context;
use std::path::Path;
use strand_engine::PrettyPrint;
use termcolor::ColorChoice;

pub fn execute(
    file: &Path,
    out: Option<&Path>,
    print: bool,
    args: &InstrumentArgs,
    color: ColorChoice,
) -> anyhow::Result<()> {
    let mut program = load_program(file)?;
    let report = args.instrumentor()?.instrument(&mut program)?;

    let rendered = if print {
        program.pretty_print()
    } else {
        program.to_json()?
    };

    match out {
        Some(path) => {
            std::fs::write(path, rendered).with_context(|| format!("failed to write {}", path.display()))?;
            let mut output = StyledOutput::new(color);
            output.report(&report);
            output.success("Wrote ");
            output.plain(&path.display().to_string());
            output.newline();
            output.flush();
        }
        None => {
            // stdout carries the program
            tracing::info!("{} instrumented, {} skipped", report.instrumented.len(), report.skipped.len());
            println!("{}", rendered);
        }
    }
    Ok(())
}
