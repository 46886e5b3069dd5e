//! Method builder with symbolic labels

use super::{BinOp, Const, Handler, Instr, IntrinsicOp, IrError, Method, MethodFlags, Reg, Ty};

/// Forward-referenceable jump target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

struct PendingHandler {
    start: Label,
    end: Label,
    target: Label,
    catch: Option<Reg>,
}

/// Incrementally builds a [`Method`].
///
/// ```ignore
/// let mut b = MethodBuilder::new("Main", "count");
/// let n = b.param(Ty::Int);
/// let top = b.label();
/// b.bind(top);
/// ...
/// let method = b.finish()?;
/// ```
pub struct MethodBuilder {
    method: Method,
    labels: Vec<Option<usize>>,
    fixups: Vec<usize>,
    handlers: Vec<PendingHandler>,
    line: u32,
}

impl MethodBuilder {
    /// Start a method
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            method: Method::new(owner, name),
            labels: Vec::new(),
            fixups: Vec::new(),
            handlers: Vec::new(),
            line: 0,
        }
    }

    /// Declare the next parameter. Parameters come before all other registers.
    pub fn param(&mut self, ty: Ty) -> Reg {
        assert_eq!(
            self.method.regs.len(),
            self.method.params,
            "parameters must be declared before other registers"
        );
        self.method.params += 1;
        self.reg(ty)
    }

    /// Allocate a register
    pub fn reg(&mut self, ty: Ty) -> Reg {
        let reg = Reg(self.method.regs.len() as u16);
        self.method.regs.push(ty);
        reg
    }

    /// Method attributes
    pub fn flags_mut(&mut self) -> &mut MethodFlags {
        &mut self.method.flags
    }

    /// Mark the method suspendable
    pub fn suspendable(&mut self) -> &mut Self {
        self.method.flags.suspendable = true;
        self
    }

    /// Source line for the following instructions
    pub fn line(&mut self, line: u32) -> &mut Self {
        self.line = line;
        self
    }

    /// Create an unbound label
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the next instruction
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.method.body.len());
    }

    /// Create a label bound to the next instruction
    pub fn here(&mut self) -> Label {
        let label = self.label();
        self.bind(label);
        label
    }

    /// Index of the next instruction
    pub fn pc(&self) -> usize {
        self.method.body.len()
    }

    /// Append a raw instruction
    pub fn emit(&mut self, instr: Instr) -> usize {
        self.method.body.push(instr);
        self.method.lines.push(self.line);
        self.method.body.len() - 1
    }

    /// `dst = value`
    pub fn constant(&mut self, dst: Reg, value: Const) {
        self.emit(Instr::Const { dst, value });
    }

    /// `dst = src`
    pub fn mov(&mut self, dst: Reg, src: Reg) {
        self.emit(Instr::Move { dst, src });
    }

    /// `dst = lhs <op> rhs`
    pub fn binary(&mut self, op: BinOp, dst: Reg, lhs: Reg, rhs: Reg) {
        self.emit(Instr::Binary { op, dst, lhs, rhs });
    }

    /// `dst = !src`
    pub fn not(&mut self, dst: Reg, src: Reg) {
        self.emit(Instr::Not { dst, src });
    }

    /// Jump to `label`
    pub fn jump(&mut self, label: Label) {
        let pc = self.emit(Instr::Jump { target: label.0 });
        self.fixups.push(pc);
    }

    /// Two-way branch on `cond`
    pub fn branch(&mut self, cond: Reg, if_true: Label, if_false: Label) {
        let pc = self.emit(Instr::Branch {
            cond,
            if_true: if_true.0,
            if_false: if_false.0,
        });
        self.fixups.push(pc);
    }

    /// Static call
    pub fn call(&mut self, dst: Option<Reg>, callee: impl Into<String>, args: &[Reg]) {
        self.emit(Instr::Call {
            dst,
            callee: callee.into(),
            args: args.to_vec(),
        });
    }

    /// Call through a method handle
    pub fn call_dynamic(&mut self, dst: Option<Reg>, target: Reg, args: &[Reg]) {
        self.emit(Instr::CallDynamic {
            dst,
            target,
            args: args.to_vec(),
        });
    }

    /// Runtime-library call
    pub fn native(&mut self, dst: Option<Reg>, name: impl Into<String>, args: &[Reg]) {
        self.emit(Instr::Native {
            dst,
            name: name.into(),
            args: args.to_vec(),
        });
    }

    /// Suspending operation. Timed operations get a fresh state register.
    pub fn intrinsic(&mut self, dst: Option<Reg>, op: IntrinsicOp, args: &[Reg]) {
        let state = op.is_timed().then(|| self.reg(Ty::Int));
        self.emit(Instr::Intrinsic {
            dst,
            intrinsic: op,
            args: args.to_vec(),
            state,
        });
    }

    /// Return
    pub fn ret(&mut self, value: Option<Reg>) {
        self.emit(Instr::Return { value });
    }

    /// Throw a user exception
    pub fn throw(&mut self, value: Reg) {
        self.emit(Instr::Throw { value });
    }

    /// Cover `start..end` with a handler at `target`
    pub fn handler(&mut self, start: Label, end: Label, target: Label, catch: Option<Reg>) {
        self.handlers.push(PendingHandler { start, end, target, catch });
    }

    /// Resolve labels and validate
    pub fn finish(self) -> Result<Method, IrError> {
        let MethodBuilder {
            mut method,
            labels,
            fixups,
            handlers,
            ..
        } = self;
        let name = method.qualified_name();
        let resolve = |label: Label| -> Result<usize, IrError> {
            labels[label.0].ok_or_else(|| IrError::UnboundLabel {
                method: name.clone(),
                label: label.0,
            })
        };

        for pc in fixups {
            let mut unbound = None;
            method.body[pc].remap_targets(|label| match labels[label] {
                Some(target) => target,
                None => {
                    unbound = Some(label);
                    label
                }
            });
            if let Some(label) = unbound {
                return Err(IrError::UnboundLabel { method: name.clone(), label });
            }
        }
        for pending in handlers {
            method.handlers.push(Handler {
                start: resolve(pending.start)?,
                end: resolve(pending.end)?,
                target: resolve(pending.target)?,
                catch: pending.catch,
            });
        }

        method.validate()?;
        Ok(method)
    }
}

/// Collects methods into a [`Program`]
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    methods: Vec<Method>,
}

impl ProgramBuilder {
    /// Empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Build `Owner.name` with `body` and add it
    pub fn define(
        &mut self,
        owner: impl Into<String>,
        name: impl Into<String>,
        body: impl FnOnce(&mut MethodBuilder),
    ) -> Result<&mut Self, IrError> {
        let mut builder = MethodBuilder::new(owner, name);
        body(&mut builder);
        self.methods.push(builder.finish()?);
        Ok(self)
    }

    /// Add a finished method
    pub fn add(&mut self, method: Method) -> &mut Self {
        self.methods.push(method);
        self
    }

    /// Assemble and validate the program
    pub fn finish(self) -> Result<super::Program, IrError> {
        super::Program::from_methods(self.methods)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_resolve_forward_and_backward() {
        let mut b = MethodBuilder::new("Loop", "count");
        let n = b.param(Ty::Int);
        let one = b.reg(Ty::Int);
        let zero = b.reg(Ty::Int);
        let cond = b.reg(Ty::Bool);
        let top = b.label();
        let body = b.label();
        let done = b.label();
        b.constant(one, Const::Int(1));
        b.constant(zero, Const::Int(0));
        b.bind(top);
        b.binary(BinOp::Gt, cond, n, zero);
        b.branch(cond, body, done);
        b.bind(body);
        b.binary(BinOp::Sub, n, n, one);
        b.jump(top);
        b.bind(done);
        b.ret(Some(n));
        let method = b.finish().unwrap();

        assert_eq!(method.params, 1);
        assert_eq!(method.body[3], Instr::Branch { cond, if_true: 4, if_false: 6 });
        assert_eq!(method.body[5], Instr::Jump { target: 2 });
    }

    #[test]
    fn test_unbound_label_is_an_error() {
        let mut b = MethodBuilder::new("A", "f");
        let nowhere = b.label();
        b.jump(nowhere);
        assert!(matches!(b.finish(), Err(IrError::UnboundLabel { .. })));
    }

    #[test]
    fn test_timed_intrinsic_gets_state_register() {
        let mut b = MethodBuilder::new("A", "nap");
        let ms = b.reg(Ty::Int);
        b.constant(ms, Const::Int(5));
        b.intrinsic(None, IntrinsicOp::Sleep, &[ms]);
        b.ret(None);
        let method = b.finish().unwrap();
        assert_eq!(method.regs, vec![Ty::Int, Ty::Int]);
        assert!(matches!(method.body[1], Instr::Intrinsic { state: Some(Reg(1)), .. }));
    }

    #[test]
    fn test_handler_labels() {
        let mut b = MethodBuilder::new("A", "guarded");
        let e = b.reg(Ty::Ref);
        let start = b.here();
        b.throw(e);
        let end = b.here();
        b.ret(Some(e));
        b.handler(start, end, end, Some(e));
        let method = b.finish().unwrap();
        assert_eq!(method.handlers[0].target, 1);
        assert!(method.handlers[0].covers(0));
        assert!(!method.handlers[0].covers(1));
    }

    #[test]
    fn test_program_builder_rejects_duplicates() {
        let mut p = ProgramBuilder::new();
        p.define("A", "f", |b| b.ret(None)).unwrap();
        p.define("A", "g", |b| b.ret(None)).unwrap();
        assert_eq!(p.finish().unwrap().len(), 2);

        let mut p = ProgramBuilder::new();
        p.define("A", "f", |b| b.ret(None)).unwrap();
        p.define("A", "f", |b| b.ret(None)).unwrap();
        assert!(matches!(p.finish(), Err(IrError::DuplicateMethod(_))));
    }
}
