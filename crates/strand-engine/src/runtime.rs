//! Runtime facade
//!
//! Wires the pipeline together: instrument the program, link it against the
//! natives, start the scheduler, and run entry methods as fibers.
//!
//! ```ignore
//! let runtime = Runtime::new(program, RuntimeConfig::load(None)?)?;
//! let value = runtime.run("Main.main", vec![])?;
//! runtime.shutdown();
//! ```

use crate::config::{ConfigError, RuntimeConfig};
use crate::fiber::{Fiber, FiberError, JoinError};
use crate::instrument::{link, InstrumentError, InstrumentReport, Instrumentor, LinkError};
use crate::interpreter::{Engine, ExecError, NativeRegistry};
use crate::ir::{IrError, Program};
use crate::scheduler::{Scheduler, SchedulerError};
use crate::value::Value;
use crate::verify::Verifier;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Runtime errors
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The program is malformed
    #[error("invalid program: {0}")]
    Program(#[from] IrError),

    /// Instrumentation refused the program
    #[error("instrumentation failed: {0}")]
    Instrument(#[from] InstrumentError),

    /// Linking failed
    #[error("link failed: {0}")]
    Link(#[from] LinkError),

    /// Worker or timer threads could not start
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Configuration could not be loaded
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The entry fiber could not be created
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// The entry fiber could not be started
    #[error(transparent)]
    Fiber(#[from] FiberError),

    /// The entry fiber failed or timed out
    #[error(transparent)]
    Join(#[from] JoinError),
}

/// An instrumented, linked program running on its own scheduler
#[derive(Debug)]
pub struct Runtime {
    engine: Arc<Engine>,
    scheduler: Arc<Scheduler>,
    report: InstrumentReport,
}

impl Runtime {
    /// Build a runtime with the standard natives
    pub fn new(program: Program, config: RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::with_natives(program, config, NativeRegistry::with_defaults())
    }

    /// Build a runtime with a custom native registry
    pub fn with_natives(program: Program, config: RuntimeConfig, natives: NativeRegistry) -> Result<Self, RuntimeError> {
        let instrumentor = Instrumentor::new(config.instrument.clone());
        Self::build(program, config, natives, instrumentor)
    }

    /// Build a runtime with a caller-configured instrumentor
    pub fn with_instrumentor(
        program: Program,
        config: RuntimeConfig,
        instrumentor: Instrumentor,
    ) -> Result<Self, RuntimeError> {
        Self::build(program, config, NativeRegistry::with_defaults(), instrumentor)
    }

    fn build(
        mut program: Program,
        config: RuntimeConfig,
        natives: NativeRegistry,
        instrumentor: Instrumentor,
    ) -> Result<Self, RuntimeError> {
        program.validate()?;
        let report = instrumentor.instrument(&mut program)?;
        link(&program, |name| natives.contains(name))?;

        let scheduler = Arc::new(Scheduler::new(&config.scheduler)?);
        let engine = Engine::new(program, natives, Verifier::new(config.verify));
        engine.set_scheduler(&scheduler);
        tracing::info!(
            instrumented = report.instrumented.len(),
            workers = scheduler.worker_count(),
            "runtime started"
        );
        Ok(Self {
            engine,
            scheduler,
            report,
        })
    }

    /// What instrumentation did
    pub fn instrument_report(&self) -> &InstrumentReport {
        &self.report
    }

    /// The instrumented program
    pub fn program(&self) -> &Program {
        self.engine.program()
    }

    /// The engine executing the program
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// The scheduler
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Start a fiber running `entry`
    pub fn spawn(&self, entry: &str, args: Vec<Value>) -> Result<Fiber, RuntimeError> {
        let fiber = self.engine.fiber(entry, args)?;
        self.scheduler.start(&fiber)?;
        Ok(fiber)
    }

    /// Run `entry` to completion and return its result
    pub fn run(&self, entry: &str, args: Vec<Value>) -> Result<Value, RuntimeError> {
        Ok(self.spawn(entry, args)?.join()?)
    }

    /// Like [`run`](Self::run) with a deadline
    pub fn run_timeout(&self, entry: &str, args: Vec<Value>, timeout: Duration) -> Result<Value, RuntimeError> {
        Ok(self.spawn(entry, args)?.join_timeout(timeout)?)
    }

    /// Collect `print` output instead of writing it to stdout
    pub fn capture_output(&self) {
        self.engine.capture_output();
    }

    /// Drain captured output
    pub fn take_output(&self) -> Vec<String> {
        self.engine.take_output()
    }

    /// Stop the scheduler. Unfinished fibers are abandoned.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
