//! Program host shared by every fiber of a runtime

use super::interp::Interpreter;
use super::natives::NativeRegistry;
use super::{ExecError, ExecResult};
use crate::fiber::{Fiber, FiberContext, FiberError, FiberResult, Flow, Stack, Suspendable};
use crate::ir::Program;
use crate::scheduler::Scheduler;
use crate::value::Value;
use crate::verify::Verifier;
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock, Weak};

/// A linked program together with its natives, verifier, and the scheduler
/// its fibers spawn onto
pub struct Engine {
    program: Program,
    natives: NativeRegistry,
    verifier: Verifier,
    scheduler: OnceLock<Weak<Scheduler>>,
    output: Mutex<Option<Vec<String>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("methods", &self.program.len())
            .field("natives", &self.natives)
            .field("verify", &self.verifier.mode())
            .finish()
    }
}

impl Engine {
    /// Create an engine. The program should already be instrumented and linked.
    pub fn new(program: Program, natives: NativeRegistry, verifier: Verifier) -> Arc<Self> {
        Arc::new(Self {
            program,
            natives,
            verifier,
            scheduler: OnceLock::new(),
            output: Mutex::new(None),
        })
    }

    /// Attach the scheduler used by `fiber.spawn`. Only the first call has an effect.
    pub fn set_scheduler(&self, scheduler: &Arc<Scheduler>) {
        let _ = self.scheduler.set(Arc::downgrade(scheduler));
    }

    /// The program
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Registered natives
    pub fn natives(&self) -> &NativeRegistry {
        &self.natives
    }

    /// Suspension verifier
    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    /// Invoke `entry` on `stack`. Call again with the same stack after a
    /// suspension to resume.
    pub fn invoke(self: &Arc<Self>, stack: &mut Stack, entry: &str, args: Vec<Value>) -> Flow<ExecResult> {
        let Some(method) = self.program.get(entry) else {
            return Flow::Complete(Err(ExecError::UnknownMethod(entry.to_string())));
        };
        Interpreter::new(self, stack).invoke(method, args)
    }

    /// Create an unstarted fiber running `entry`
    pub fn fiber(self: &Arc<Self>, entry: &str, args: Vec<Value>) -> Result<Fiber, ExecError> {
        let target = self.target(entry, args)?;
        Ok(Fiber::from_target(entry, Stack::new(), target))
    }

    /// Start a fiber running `entry` on the attached scheduler
    pub fn spawn(self: &Arc<Self>, entry: &str, args: Vec<Value>) -> Result<Fiber, ExecError> {
        let target = self.target(entry, args)?;
        let scheduler = self
            .scheduler
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| spawn_error("no scheduler is running".to_string()))?;
        scheduler
            .spawn_target(entry, target)
            .map_err(|e| spawn_error(e.to_string()))
    }

    fn target(self: &Arc<Self>, entry: &str, args: Vec<Value>) -> Result<ProgramTarget, ExecError> {
        if !self.program.contains(entry) {
            return Err(ExecError::UnknownMethod(entry.to_string()));
        }
        Ok(ProgramTarget {
            engine: Arc::clone(self),
            entry: entry.to_string(),
            args,
        })
    }

    /// Write a line of program output
    pub fn print(&self, line: String) {
        let mut output = self.output.lock();
        match output.as_mut() {
            Some(lines) => lines.push(line),
            None => println!("{}", line),
        }
    }

    /// Collect program output instead of writing it to stdout
    pub fn capture_output(&self) {
        self.output.lock().get_or_insert_with(Vec::new);
    }

    /// Drain captured output
    pub fn take_output(&self) -> Vec<String> {
        self.output.lock().as_mut().map(std::mem::take).unwrap_or_default()
    }
}

fn spawn_error(message: String) -> ExecError {
    ExecError::Native {
        name: "fiber.spawn".to_string(),
        message,
    }
}

/// Fiber body running one program method
pub struct ProgramTarget {
    engine: Arc<Engine>,
    entry: String,
    args: Vec<Value>,
}

impl Suspendable for ProgramTarget {
    fn run(&mut self, ctx: &mut FiberContext<'_>) -> Flow<FiberResult> {
        self.engine
            .invoke(ctx.stack(), &self.entry, self.args.clone())
            .map(|result| result.map_err(FiberError::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::fiber::FiberState;
    use crate::instrument::{InstrumentOptions, Instrumentor};
    use crate::ir::{BinOp, Const, IntrinsicOp, MethodBuilder, Ty};
    use crate::verify::{VerifyConfig, VerifyMode};

    /// `Main.main(ch) = 5 * Worker.wait(ch)` where `Worker.wait(ch) = receive(ch) + 10`
    fn program() -> Program {
        let mut wait = MethodBuilder::new("Worker", "wait");
        let ch = wait.param(Ty::Ref);
        let msg = wait.reg(Ty::Ref);
        let ten = wait.reg(Ty::Int);
        let sum = wait.reg(Ty::Ref);
        wait.line(20).intrinsic(Some(msg), IntrinsicOp::Receive, &[ch]);
        wait.constant(ten, Const::Int(10));
        wait.binary(BinOp::Add, sum, msg, ten);
        wait.ret(Some(sum));

        let mut main = MethodBuilder::new("Main", "main");
        let ch = main.param(Ty::Ref);
        let five = main.reg(Ty::Int);
        let got = main.reg(Ty::Ref);
        let out = main.reg(Ty::Ref);
        main.line(10).constant(five, Const::Int(5));
        main.line(11).call(Some(got), "Worker.wait", &[ch]);
        main.binary(BinOp::Mul, out, five, got);
        main.ret(Some(out));

        Program::from_methods([wait.finish().unwrap(), main.finish().unwrap()]).unwrap()
    }

    fn engine(instrumented: bool, mode: VerifyMode) -> Arc<Engine> {
        let mut program = program();
        if instrumented {
            Instrumentor::new(InstrumentOptions::default()).instrument(&mut program).unwrap();
        }
        let verifier = Verifier::new(VerifyConfig { mode, waivers: Vec::new() });
        Engine::new(program, NativeRegistry::with_defaults(), verifier)
    }

    #[test]
    fn test_resume_restores_locals() {
        let engine = engine(true, VerifyMode::Fail);
        let channel: Channel<Value> = Channel::unbounded();
        let fiber = engine.fiber("Main.main", vec![Value::Channel(channel.clone())]).unwrap();

        assert_eq!(fiber.exec().unwrap(), FiberState::Suspended);
        assert_eq!(fiber.blocker().as_deref(), Some("channel-receive"));
        channel.try_send(Value::Int(2)).unwrap();
        assert_eq!(fiber.exec().unwrap(), FiberState::Finished);
        assert_eq!(fiber.join().unwrap(), Value::Int(60));
    }

    #[test]
    fn test_without_suspension_matches_plain_call() {
        let engine = engine(true, VerifyMode::Off);
        let channel: Channel<Value> = Channel::unbounded();
        channel.try_send(Value::Int(1)).unwrap();
        let fiber = engine.fiber("Main.main", vec![Value::Channel(channel)]).unwrap();
        assert_eq!(fiber.exec().unwrap(), FiberState::Finished);
        assert_eq!(fiber.join().unwrap(), Value::Int(55));
    }

    #[test]
    fn test_uninstrumented_suspension_fails_verification() {
        let engine = engine(false, VerifyMode::Fail);
        let channel: Channel<Value> = Channel::unbounded();
        let fiber = engine.fiber("Main.main", vec![Value::Channel(channel)]).unwrap();
        assert_eq!(fiber.exec().unwrap(), FiberState::Finished);
        let err = fiber.join().unwrap_err().to_string();
        assert!(err.contains("Worker.wait"), "{}", err);
        assert!(err.contains("!!"), "{}", err);
    }

    #[test]
    fn test_yield_loop_is_transparent() {
        // sum of 1..=4 with a yield in every iteration
        let mut b = MethodBuilder::new("Loop", "sum");
        let i = b.reg(Ty::Int);
        let acc = b.reg(Ty::Int);
        let one = b.reg(Ty::Int);
        let limit = b.reg(Ty::Int);
        let cond = b.reg(Ty::Bool);
        b.constant(one, Const::Int(1));
        b.constant(limit, Const::Int(4));
        let top = b.here();
        let body = b.label();
        let done = b.label();
        b.binary(BinOp::Lt, cond, i, limit);
        b.branch(cond, body, done);
        b.bind(body);
        b.binary(BinOp::Add, i, i, one);
        b.binary(BinOp::Add, acc, acc, i);
        b.intrinsic(None, IntrinsicOp::Yield, &[]);
        b.jump(top);
        b.bind(done);
        b.ret(Some(acc));
        let mut program = Program::from_methods([b.finish().unwrap()]).unwrap();
        Instrumentor::default().instrument(&mut program).unwrap();
        let engine = Engine::new(program, NativeRegistry::with_defaults(), Verifier::default());

        let fiber = engine.fiber("Loop.sum", Vec::new()).unwrap();
        let mut steps = 0;
        while fiber.exec().unwrap() != FiberState::Finished {
            steps += 1;
        }
        assert_eq!(steps, 4);
        assert_eq!(fiber.join().unwrap(), Value::Int(10));
    }

    #[test]
    fn test_unknown_entry() {
        let engine = engine(true, VerifyMode::Off);
        assert!(matches!(engine.fiber("Main.nope", Vec::new()), Err(ExecError::UnknownMethod(_))));
    }
}
