//! `strand check`: suspendability analysis, an instrumentation dry run, and a link check.

use super::{load_program, InstrumentArgs};
use crate::output::StyledOutput;
use strand_engine::instrument::link;
use strand_engine::NativeRegistry;
use termcolor::ColorChoice;

pub fn execute(file: &std::path::Path, args: &InstrumentArgs, color: ColorChoice) -> anyhow::Result<()> {
    let mut program = load_program(file)?;
    let instrumentor = args.instrumentor()?;
    let mut output = StyledOutput::new(color);

    let analysis = instrumentor.analyze(&program);
    output.bold(&format!("{}", file.display()));
    output.newline();
    output.field("methods", &program.len().to_string());
    output.field("suspendable", &analysis.suspendable_count().to_string());
    for name in &analysis.assumed {
        output.field("assumed", name);
    }

    let result = instrumentor.instrument(&mut program).map_err(anyhow::Error::from).and_then(|report| {
        output.report(&report);
        let natives = NativeRegistry::with_defaults();
        link(&program, |name| natives.contains(name))?;
        Ok(())
    });

    match result {
        Ok(()) => {
            output.success("ok");
            output.newline();
            output.flush();
            Ok(())
        }
        Err(e) => {
            output.error("error: ");
            output.plain(&e.to_string());
            output.newline();
            output.flush();
            anyhow::bail!("check failed")
        }
    }
}
