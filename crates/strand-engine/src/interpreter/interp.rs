//! Register interpreter
//!
//! Executes instrumented and plain method bodies alike. The suspend path is
//! carried by [`Flow`]: a suspending intrinsic returns `Flow::Suspend`, every
//! guarded call site on the way out jumps to its save block, and the save
//! block writes the frame's live registers into the fiber [`Stack`] before
//! `Propagate` forwards the suspension. On resumption `Dispatch` reads the
//! frame marker and jumps to the matching restore block, which reloads the
//! registers and re-enters the call that suspended.

use super::engine::Engine;
use super::intrinsics;
use super::natives::NativeContext;
use super::{ExecError, ExecResult};
use crate::fiber::{Fiber, Flow, FrameEntry, Stack, Suspension};
use crate::ir::{BinOp, Const, Instr, Method, Program, Reg, Ty};
use crate::value::Value;
use crate::verify::TraceFrame;
use std::sync::Arc;

/// Runs methods of one program on one fiber stack
pub struct Interpreter<'a> {
    engine: &'a Arc<Engine>,
    program: &'a Program,
    stack: &'a mut Stack,
    /// Active frames, outermost first
    trace: Vec<TraceFrame<'a>>,
}

impl<'a> Interpreter<'a> {
    /// Create an interpreter over `stack`
    pub fn new(engine: &'a Arc<Engine>, stack: &'a mut Stack) -> Self {
        Self {
            engine,
            program: engine.program(),
            stack,
            trace: Vec::new(),
        }
    }

    /// Invoke `method` with `args`
    pub fn invoke(&mut self, method: &'a Method, args: Vec<Value>) -> Flow<ExecResult> {
        if !method.has_body() {
            return Flow::Complete(Err(ExecError::NoBody(method.qualified_name())));
        }
        if args.len() != method.params {
            return Flow::Complete(Err(ExecError::Arity {
                method: method.qualified_name(),
                expected: method.params,
                got: args.len(),
            }));
        }
        let mut regs: Vec<Value> = method.regs.iter().map(|ty| zero(*ty)).collect();
        for (slot, arg) in regs.iter_mut().zip(args) {
            *slot = arg;
        }

        self.trace.push(TraceFrame { method, pc: 0 });
        let mut frame = None;
        let flow = self.execute(method, &mut regs, &mut frame);
        self.trace.pop();

        if !flow.is_suspend() {
            if let Some(frame) = frame {
                self.stack.leave(frame.index);
            }
        }
        flow
    }

    fn set_pc(&mut self, pc: usize) {
        if let Some(top) = self.trace.last_mut() {
            top.pc = pc;
        }
    }

    fn execute(&mut self, method: &'a Method, regs: &mut [Value], frame: &mut Option<FrameEntry>) -> Flow<ExecResult> {
        let program = self.program;
        let mut pc = 0;
        let mut pending: Option<Suspension> = None;

        macro_rules! raise {
            ($err:expr) => {
                match catch(method, pc, $err, regs) {
                    Ok(target) => {
                        pc = target;
                        continue;
                    }
                    Err(err) => return Flow::Complete(Err(err)),
                }
            };
        }

        macro_rules! suspend {
            ($s:expr) => {
                match method.guard_at(pc) {
                    Some(save) => {
                        pending = Some($s);
                        pc = save;
                        continue;
                    }
                    None => return Flow::Suspend($s),
                }
            };
        }

        loop {
            let Some(instr) = method.body.get(pc) else {
                return Flow::Complete(Err(corrupt(method, format!("pc {} is outside the body", pc))));
            };
            match instr {
                Instr::Const { dst, value } => {
                    regs[dst.index()] = constant(value);
                }
                Instr::Move { dst, src } => {
                    regs[dst.index()] = regs[src.index()].clone();
                }
                Instr::Binary { op, dst, lhs, rhs } => match binary(*op, &regs[lhs.index()], &regs[rhs.index()]) {
                    Ok(value) => regs[dst.index()] = value,
                    Err(err) => raise!(err),
                },
                Instr::Not { dst, src } => {
                    regs[dst.index()] = Value::Bool(!regs[src.index()].is_truthy());
                }
                Instr::Jump { target } => {
                    pc = *target;
                    continue;
                }
                Instr::Branch { cond, if_true, if_false } => {
                    pc = if regs[cond.index()].is_truthy() { *if_true } else { *if_false };
                    continue;
                }
                Instr::Call { dst, callee, args } => {
                    let Some(target) = program.get(callee) else {
                        return Flow::Complete(Err(ExecError::UnknownMethod(callee.clone())));
                    };
                    let values = collect(regs, args);
                    self.set_pc(pc);
                    match self.invoke(target, values) {
                        Flow::Complete(Ok(value)) => store(regs, *dst, value),
                        Flow::Complete(Err(err)) => raise!(err),
                        Flow::Suspend(s) => suspend!(s),
                    }
                }
                Instr::CallDynamic { dst, target, args } => {
                    let callee = match &regs[target.index()] {
                        Value::Method(name) | Value::Str(name) => name.clone(),
                        other => raise!(ExecError::type_error("method", other)),
                    };
                    let Some(target) = program.get(&callee) else {
                        raise!(ExecError::UnknownMethod(callee.to_string()));
                    };
                    let values = collect(regs, args);
                    self.set_pc(pc);
                    match self.invoke(target, values) {
                        Flow::Complete(Ok(value)) => store(regs, *dst, value),
                        Flow::Complete(Err(err)) => raise!(err),
                        Flow::Suspend(s) => suspend!(s),
                    }
                }
                Instr::Native { dst, name, args } => {
                    let Some(entry) = self.engine.natives().get(name) else {
                        return Flow::Complete(Err(ExecError::UnknownNative(name.clone())));
                    };
                    self.set_pc(pc);
                    if entry.blocking && Fiber::current().is_some() {
                        if let Err(err) = self.engine.verifier().check_blocking(name, &self.trace) {
                            return Flow::Complete(Err(err.into()));
                        }
                    }
                    let values = collect(regs, args);
                    match (entry.func)(&NativeContext { engine: self.engine }, &values) {
                        Ok(value) => store(regs, *dst, value),
                        Err(err) => raise!(err),
                    }
                }
                Instr::Intrinsic { dst, intrinsic, args, state } => {
                    self.set_pc(pc);
                    let values = collect(regs, args);
                    let flow = match state {
                        Some(reg) => intrinsics::execute(*intrinsic, &values, Some(&mut regs[reg.index()])),
                        None => intrinsics::execute(*intrinsic, &values, None),
                    };
                    match flow {
                        Flow::Complete(Ok(value)) => store(regs, *dst, value),
                        Flow::Complete(Err(err)) => raise!(err),
                        Flow::Suspend(s) => {
                            self.stack.begin_suspend();
                            if let Err(err) = self.engine.verifier().check_suspension(&self.trace) {
                                return Flow::Complete(Err(err.into()));
                            }
                            suspend!(s)
                        }
                    }
                }
                Instr::Return { value } => {
                    let value = value.map(|r| regs[r.index()].clone()).unwrap_or_default();
                    return Flow::Complete(Ok(value));
                }
                Instr::Throw { value } => {
                    raise!(ExecError::Thrown(regs[value.index()].clone()));
                }
                Instr::Dispatch { resume } => {
                    let entry = self.stack.enter();
                    *frame = Some(entry);
                    if entry.is_resuming() {
                        match resume.get(entry.entry - 1) {
                            Some(target) => {
                                pc = *target;
                                continue;
                            }
                            None => {
                                return Flow::Complete(Err(corrupt(
                                    method,
                                    format!("no restore block for entry {}", entry.entry),
                                )))
                            }
                        }
                    }
                }
                Instr::Restore { layout, resume_at, .. } => {
                    let Some(entry) = *frame else {
                        return Flow::Complete(Err(corrupt(method, "restore before dispatch".to_string())));
                    };
                    if let Err(err) = self.restore(method, entry.index, layout, regs) {
                        return Flow::Complete(Err(err));
                    }
                    pc = *resume_at;
                    continue;
                }
                Instr::Save { entry, layout } => {
                    let Some(frame) = *frame else {
                        return Flow::Complete(Err(corrupt(method, "save before dispatch".to_string())));
                    };
                    if let Err(err) = self.save(method, frame.index, *entry as usize, layout, regs) {
                        return Flow::Complete(Err(err));
                    }
                }
                Instr::Propagate => match pending.take() {
                    Some(s) => return Flow::Suspend(s),
                    None => {
                        return Flow::Complete(Err(corrupt(method, "propagate without a pending suspension".to_string())))
                    }
                },
            }
            pc += 1;
        }
    }

    fn restore(&mut self, method: &Method, index: usize, layout: &[Reg], regs: &mut [Value]) -> Result<(), ExecError> {
        let mut reader = self.stack.restore_frame(index, layout.len())?;
        for (slot, reg) in layout.iter().enumerate() {
            regs[reg.index()] = match method.regs[reg.index()] {
                Ty::Int => Value::Int(reader.prim(slot)? as i64),
                Ty::Float => Value::Float(f64::from_bits(reader.prim(slot)?)),
                Ty::Bool => Value::Bool(reader.prim(slot)? != 0),
                Ty::Ref => reader.take_ref(slot)?,
            };
        }
        Ok(())
    }

    fn save(&mut self, method: &Method, index: usize, entry: usize, layout: &[Reg], regs: &[Value]) -> Result<(), ExecError> {
        let mut writer = self.stack.save_frame(index, entry, layout.len())?;
        for (slot, reg) in layout.iter().enumerate() {
            let ty = method.regs[reg.index()];
            match (ty, &regs[reg.index()]) {
                (Ty::Int, Value::Int(v)) => writer.put_prim(slot, *v as u64)?,
                (Ty::Float, Value::Float(v)) => writer.put_prim(slot, v.to_bits())?,
                (Ty::Float, Value::Int(v)) => writer.put_prim(slot, (*v as f64).to_bits())?,
                (Ty::Bool, Value::Bool(v)) => writer.put_prim(slot, *v as u64)?,
                (Ty::Ref, value) => writer.put_ref(slot, value.clone())?,
                (ty, value) => {
                    return Err(ExecError::Type(format!(
                        "register {} of {} is declared {:?} but holds {}",
                        reg,
                        method.qualified_name(),
                        ty,
                        value.type_name()
                    )))
                }
            }
        }
        Ok(())
    }
}

fn zero(ty: Ty) -> Value {
    match ty {
        Ty::Int => Value::Int(0),
        Ty::Float => Value::Float(0.0),
        Ty::Bool => Value::Bool(false),
        Ty::Ref => Value::Null,
    }
}

fn constant(value: &Const) -> Value {
    match value {
        Const::Null => Value::Null,
        Const::Int(v) => Value::Int(*v),
        Const::Float(v) => Value::Float(*v),
        Const::Bool(v) => Value::Bool(*v),
        Const::Str(s) => Value::from(s.as_str()),
        Const::Method(m) => Value::Method(Arc::from(m.as_str())),
    }
}

fn collect(regs: &[Value], args: &[Reg]) -> Vec<Value> {
    args.iter().map(|r| regs[r.index()].clone()).collect()
}

fn store(regs: &mut [Value], dst: Option<Reg>, value: Value) {
    if let Some(dst) = dst {
        regs[dst.index()] = value;
    }
}

fn corrupt(method: &Method, reason: String) -> ExecError {
    ExecError::Corrupt {
        method: method.qualified_name(),
        reason,
    }
}

/// Find the handler for a thrown value at `pc`, binding the value to the
/// handler's catch register
fn catch(method: &Method, pc: usize, err: ExecError, regs: &mut [Value]) -> Result<usize, ExecError> {
    let ExecError::Thrown(value) = &err else {
        return Err(err);
    };
    match method.handlers.iter().find(|h| h.covers(pc)) {
        Some(handler) => {
            if let Some(reg) = handler.catch {
                regs[reg.index()] = value.clone();
            }
            Ok(handler.target)
        }
        None => Err(err),
    }
}

fn thrown(message: &str) -> ExecError {
    ExecError::Thrown(Value::from(message))
}

fn binary(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, ExecError> {
    match op {
        BinOp::Eq => return Ok(Value::Bool(lhs == rhs)),
        BinOp::Ne => return Ok(Value::Bool(lhs != rhs)),
        _ => {}
    }
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => int_op(op, *a, *b),
        (Value::Str(_), _) | (_, Value::Str(_)) if op == BinOp::Add => Ok(Value::from(format!("{}{}", lhs, rhs))),
        _ => match (lhs.as_float(), rhs.as_float()) {
            (Some(a), Some(b)) => Ok(float_op(op, a, b)),
            _ => Err(ExecError::Type(format!(
                "cannot apply {:?} to {} and {}",
                op,
                lhs.type_name(),
                rhs.type_name()
            ))),
        },
    }
}

fn int_op(op: BinOp, a: i64, b: i64) -> Result<Value, ExecError> {
    Ok(match op {
        BinOp::Add => Value::Int(a.wrapping_add(b)),
        BinOp::Sub => Value::Int(a.wrapping_sub(b)),
        BinOp::Mul => Value::Int(a.wrapping_mul(b)),
        BinOp::Div if b == 0 => return Err(thrown("division by zero")),
        BinOp::Rem if b == 0 => return Err(thrown("division by zero")),
        BinOp::Div => Value::Int(a.wrapping_div(b)),
        BinOp::Rem => Value::Int(a.wrapping_rem(b)),
        BinOp::Lt => Value::Bool(a < b),
        BinOp::Le => Value::Bool(a <= b),
        BinOp::Gt => Value::Bool(a > b),
        BinOp::Ge => Value::Bool(a >= b),
        BinOp::Eq => Value::Bool(a == b),
        BinOp::Ne => Value::Bool(a != b),
    })
}

fn float_op(op: BinOp, a: f64, b: f64) -> Value {
    match op {
        BinOp::Add => Value::Float(a + b),
        BinOp::Sub => Value::Float(a - b),
        BinOp::Mul => Value::Float(a * b),
        BinOp::Div => Value::Float(a / b),
        BinOp::Rem => Value::Float(a % b),
        BinOp::Lt => Value::Bool(a < b),
        BinOp::Le => Value::Bool(a <= b),
        BinOp::Gt => Value::Bool(a > b),
        BinOp::Ge => Value::Bool(a >= b),
        BinOp::Eq => Value::Bool(a == b),
        BinOp::Ne => Value::Bool(a != b),
    }
}
