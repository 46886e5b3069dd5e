//! Register IR for suspendable programs
//!
//! This is the "class file" format the instrumentor rewrites and the
//! interpreter executes. A [`Program`] is a flat set of [`Method`]s addressed
//! by qualified name (`Owner.name`). Method bodies are linear instruction
//! vectors over typed virtual registers; branch targets are instruction
//! indices.
//!
//! # Structure
//!
//! - `Program` - all methods, indexed by qualified name
//! - `Method` - registers, body, line table, handler and guard tables
//! - `Instr` - three-address instructions, including the suspending
//!   `Intrinsic` operations and the instrumentation-only `Dispatch`,
//!   `Restore`, `Save` and `Propagate`
//!
//! Programs are serde types and load from JSON.

mod builder;
mod pretty;

pub use builder::{Label, MethodBuilder, ProgramBuilder};
pub use pretty::PrettyPrint;

use crate::defaults::RUNTIME_OWNER;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Malformed program errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IrError {
    /// Two methods share a qualified name
    #[error("duplicate method {0}")]
    DuplicateMethod(String),

    /// A register operand is out of range
    #[error("{method}: instruction {pc} uses register r{reg} but only {count} are declared")]
    BadRegister {
        /// Qualified method name
        method: String,
        /// Offending instruction
        pc: usize,
        /// Register index
        reg: u16,
        /// Declared registers
        count: usize,
    },

    /// A jump, handler, or guard points outside the body
    #[error("{method}: target {target} at instruction {pc} is outside the body")]
    BadTarget {
        /// Qualified method name
        method: String,
        /// Offending instruction
        pc: usize,
        /// Target index
        target: usize,
    },

    /// The line table does not cover the body
    #[error("{method}: line table has {lines} entries for {body} instructions")]
    BadLineTable {
        /// Qualified method name
        method: String,
        /// Line entries
        lines: usize,
        /// Instructions
        body: usize,
    },

    /// The last instruction can fall off the end of the body
    #[error("{method}: body does not end in return, throw, or jump")]
    FallsThrough {
        /// Qualified method name
        method: String,
    },

    /// A builder label was used but never bound
    #[error("{method}: label {label} was never bound")]
    UnboundLabel {
        /// Qualified method name
        method: String,
        /// Label number
        label: usize,
    },

    /// A timed intrinsic has no register to keep its deadline in
    #[error("{method}: timed intrinsic `{op}` at instruction {pc} has no state register")]
    MissingState {
        /// Qualified method name
        method: String,
        /// Offending instruction
        pc: usize,
        /// Intrinsic name
        op: &'static str,
    },

    /// The JSON document is not a program
    #[error("invalid program JSON: {0}")]
    Json(String),
}

/// Virtual register index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reg(pub u16);

impl Reg {
    /// Index into the register file
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Register type. Primitive registers save into primitive stack slots,
/// `Ref` registers into reference slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ty {
    /// 64-bit integer
    Int,
    /// 64-bit float
    Float,
    /// Boolean
    Bool,
    /// Any reference value
    Ref,
}

impl Ty {
    /// Whether values of this type live in primitive slots
    pub fn is_primitive(self) -> bool {
        !matches!(self, Ty::Ref)
    }
}

/// Constant operand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "value")]
pub enum Const {
    /// Null reference
    Null,
    /// Integer
    Int(i64),
    /// Float
    Float(f64),
    /// Boolean
    Bool(bool),
    /// String
    Str(String),
    /// Method handle (qualified name) for dynamic calls
    Method(String),
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::Null => write!(f, "null"),
            Const::Int(i) => write!(f, "{}", i),
            Const::Float(x) => write!(f, "{:?}", x),
            Const::Bool(b) => write!(f, "{}", b),
            Const::Str(s) => write!(f, "{:?}", s),
            Const::Method(m) => write!(f, "&{}", m),
        }
    }
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Rem,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::Rem => "rem",
            BinOp::Eq => "eq",
            BinOp::Ne => "ne",
            BinOp::Lt => "lt",
            BinOp::Le => "le",
            BinOp::Gt => "gt",
            BinOp::Ge => "ge",
        };
        f.write_str(s)
    }
}

/// Suspending runtime operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntrinsicOp {
    /// `park([blocker])`: suspend until unparked
    Park,
    /// `yield()`: let other fibers run
    Yield,
    /// `sleep(ms)`
    Sleep,
    /// `send(channel, message)`
    Send,
    /// `receive(channel)`: message, or null at end-of-stream
    Receive,
    /// `receive_timeout(channel, ms)`: message, or null on timeout or end-of-stream
    ReceiveTimeout,
    /// `join(fiber[, ms])`: the fiber's result, or null on timeout
    Join,
}

impl IntrinsicOp {
    /// Whether the operation waits against a deadline kept in a state register
    pub fn is_timed(self) -> bool {
        matches!(self, IntrinsicOp::Sleep | IntrinsicOp::ReceiveTimeout | IntrinsicOp::Join)
    }

    /// Name used in call-site metadata and listings
    pub fn name(self) -> &'static str {
        match self {
            IntrinsicOp::Park => "park",
            IntrinsicOp::Yield => "yield",
            IntrinsicOp::Sleep => "sleep",
            IntrinsicOp::Send => "send",
            IntrinsicOp::Receive => "receive",
            IntrinsicOp::ReceiveTimeout => "receive_timeout",
            IntrinsicOp::Join => "join",
        }
    }
}

/// One instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "instr")]
pub enum Instr {
    /// `dst = value`
    Const {
        /// Destination
        dst: Reg,
        /// Literal
        value: Const,
    },
    /// `dst = src`
    Move {
        /// Destination
        dst: Reg,
        /// Source
        src: Reg,
    },
    /// `dst = lhs <op> rhs`
    Binary {
        /// Operator
        op: BinOp,
        /// Destination
        dst: Reg,
        /// Left operand
        lhs: Reg,
        /// Right operand
        rhs: Reg,
    },
    /// `dst = !src`
    Not {
        /// Destination
        dst: Reg,
        /// Operand
        src: Reg,
    },
    /// Unconditional jump
    Jump {
        /// Instruction index
        target: usize,
    },
    /// Jump to `if_true` when `cond` is truthy, else to `if_false`
    Branch {
        /// Condition
        cond: Reg,
        /// Taken when truthy
        if_true: usize,
        /// Taken otherwise
        if_false: usize,
    },
    /// Static call of a program method
    Call {
        /// Receives the return value
        #[serde(default)]
        dst: Option<Reg>,
        /// Qualified callee name
        callee: String,
        /// Arguments, in parameter order
        #[serde(default)]
        args: Vec<Reg>,
    },
    /// Call through a method handle held in `target`
    CallDynamic {
        /// Receives the return value
        #[serde(default)]
        dst: Option<Reg>,
        /// Register holding the method handle
        target: Reg,
        /// Arguments, in parameter order
        #[serde(default)]
        args: Vec<Reg>,
    },
    /// Runtime-library call; never suspends
    Native {
        /// Receives the result
        #[serde(default)]
        dst: Option<Reg>,
        /// Registered native name
        name: String,
        /// Arguments
        #[serde(default)]
        args: Vec<Reg>,
    },
    /// Suspending operation. Timed operations keep their deadline in `state`
    /// so that re-executing them after a resume continues the same wait.
    Intrinsic {
        /// Receives the result
        #[serde(default)]
        dst: Option<Reg>,
        /// Operation
        intrinsic: IntrinsicOp,
        /// Operands
        #[serde(default)]
        args: Vec<Reg>,
        /// Deadline register of a timed operation
        #[serde(default)]
        state: Option<Reg>,
    },
    /// Return from the method
    Return {
        /// Returned register; null when absent
        #[serde(default)]
        value: Option<Reg>,
    },
    /// Throw `value` as a user exception
    Throw {
        /// Thrown register
        value: Reg,
    },
    /// Entry dispatch of an instrumented method: when the frame is being
    /// replayed jump to `resume[entry - 1]`, else fall through
    Dispatch {
        /// Restore block of each entry id
        resume: Vec<usize>,
    },
    /// Reload the frame saved at `entry` and jump to `resume_at`
    Restore {
        /// Entry id
        entry: u16,
        /// Registers reloaded, in slot order
        layout: Vec<Reg>,
        /// The invocation to re-execute
        resume_at: usize,
    },
    /// Save `layout` into the frame record for `entry`
    Save {
        /// Entry id
        entry: u16,
        /// Registers saved, in slot order
        layout: Vec<Reg>,
    },
    /// Return the pending suspension to the caller
    Propagate,
}

impl Instr {
    /// Registers read by the instruction
    pub fn uses(&self) -> Vec<Reg> {
        match self {
            Instr::Const { .. } | Instr::Jump { .. } | Instr::Dispatch { .. } | Instr::Propagate => Vec::new(),
            Instr::Move { src, .. } | Instr::Not { src, .. } => vec![*src],
            Instr::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            Instr::Branch { cond, .. } => vec![*cond],
            Instr::Call { args, .. } | Instr::Native { args, .. } => args.clone(),
            Instr::CallDynamic { target, args, .. } => {
                let mut uses = Vec::with_capacity(args.len() + 1);
                uses.push(*target);
                uses.extend_from_slice(args);
                uses
            }
            Instr::Intrinsic { args, state, .. } => {
                let mut uses = args.clone();
                uses.extend(state.iter().copied());
                uses
            }
            Instr::Return { value } => value.iter().copied().collect(),
            Instr::Throw { value } => vec![*value],
            Instr::Save { layout, .. } => layout.clone(),
            Instr::Restore { .. } => Vec::new(),
        }
    }

    /// Registers written by the instruction
    pub fn defs(&self) -> Vec<Reg> {
        match self {
            Instr::Const { dst, .. } | Instr::Move { dst, .. } | Instr::Binary { dst, .. } | Instr::Not { dst, .. } => {
                vec![*dst]
            }
            Instr::Call { dst, .. } | Instr::CallDynamic { dst, .. } | Instr::Native { dst, .. } => {
                dst.iter().copied().collect()
            }
            Instr::Intrinsic { dst, state, .. } => dst.iter().chain(state.iter()).copied().collect(),
            Instr::Restore { layout, .. } => layout.clone(),
            _ => Vec::new(),
        }
    }

    /// Explicit branch targets
    pub fn targets(&self) -> Vec<usize> {
        match self {
            Instr::Jump { target } => vec![*target],
            Instr::Branch { if_true, if_false, .. } => vec![*if_true, *if_false],
            Instr::Dispatch { resume } => resume.clone(),
            Instr::Restore { resume_at, .. } => vec![*resume_at],
            _ => Vec::new(),
        }
    }

    /// Whether control can continue with the next instruction
    pub fn falls_through(&self) -> bool {
        !matches!(
            self,
            Instr::Jump { .. } | Instr::Return { .. } | Instr::Throw { .. } | Instr::Restore { .. } | Instr::Propagate
        )
    }

    /// Rewrite every branch target with `f`
    pub fn remap_targets(&mut self, mut f: impl FnMut(usize) -> usize) {
        match self {
            Instr::Jump { target } => *target = f(*target),
            Instr::Branch { if_true, if_false, .. } => {
                *if_true = f(*if_true);
                *if_false = f(*if_false);
            }
            Instr::Dispatch { resume } => {
                for pc in resume.iter_mut() {
                    *pc = f(*pc);
                }
            }
            Instr::Restore { resume_at, .. } => *resume_at = f(*resume_at),
            _ => {}
        }
    }

    /// Whether this is a call into other code (static, dynamic, or intrinsic)
    pub fn is_invocation(&self) -> bool {
        matches!(self, Instr::Call { .. } | Instr::CallDynamic { .. } | Instr::Intrinsic { .. })
    }
}

/// User exception handler covering `start..end`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handler {
    /// First covered instruction
    pub start: usize,
    /// One past the last covered instruction
    pub end: usize,
    /// Handler entry
    pub target: usize,
    /// Register receiving the thrown value
    #[serde(default)]
    pub catch: Option<Reg>,
}

impl Handler {
    /// Whether `pc` is covered
    pub fn covers(&self, pc: usize) -> bool {
        self.start <= pc && pc < self.end
    }
}

/// Suspension guard: a suspension returned by the invocation at `pc`
/// transfers control to `handler` instead of the next instruction.
///
/// Guards live apart from user handlers, so user code can never observe a
/// suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guard {
    /// Guarded invocation
    pub pc: usize,
    /// Save block entry
    pub handler: usize,
}

/// Method attributes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodFlags {
    /// Explicitly annotated suspendable
    pub suspendable: bool,
    /// Declares the suspension marker in its signature
    pub throws_suspend: bool,
    /// Holds a monitor for its whole body
    pub synchronized: bool,
    /// Implemented outside the program
    pub native: bool,
    /// No body
    #[serde(rename = "abstract")]
    pub abstract_: bool,
    /// Compiler-generated bridge
    pub bridge: bool,
    /// Compiler-generated (closures and the like)
    pub synthetic: bool,
}

/// Metadata recorded for each suspension point of an instrumented method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    /// Invocation index in the instrumented body
    pub pc: usize,
    /// Source line
    pub line: u32,
    /// Callee: qualified name, `<dynamic>`, or `intrinsic:<op>`
    pub callee: String,
    /// Entry id (1-based)
    pub entry: u16,
    /// Registers saved when suspending here
    pub layout: Vec<Reg>,
}

/// Marker attached to a method by the instrumentor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrumentation {
    /// One record per suspension point, ordered by entry id
    pub call_sites: Vec<CallSite>,
    /// The method keeps no frame of its own (forwarding bridge)
    #[serde(default)]
    pub transparent: bool,
}

impl Instrumentation {
    /// Call site recorded at `pc`
    pub fn call_site(&self, pc: usize) -> Option<&CallSite> {
        self.call_sites.iter().find(|site| site.pc == pc)
    }
}

/// A method: typed registers and a linear body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Method {
    /// Declaring owner (class or module)
    pub owner: String,
    /// Simple name
    pub name: String,
    /// Parameter count; parameters occupy the first registers
    #[serde(default)]
    pub params: usize,
    /// Register types
    #[serde(default)]
    pub regs: Vec<Ty>,
    /// Instructions
    #[serde(default)]
    pub body: Vec<Instr>,
    /// Source line of each instruction (empty or same length as `body`)
    #[serde(default)]
    pub lines: Vec<u32>,
    /// User exception handlers, innermost first
    #[serde(default)]
    pub handlers: Vec<Handler>,
    /// Suspension guards
    #[serde(default)]
    pub guards: Vec<Guard>,
    /// Attributes
    #[serde(default)]
    pub flags: MethodFlags,
    /// Present once the instrumentor processed the method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrumentation: Option<Instrumentation>,
}

impl Method {
    /// Create an empty method
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            params: 0,
            regs: Vec::new(),
            body: Vec::new(),
            lines: Vec::new(),
            handlers: Vec::new(),
            guards: Vec::new(),
            flags: MethodFlags::default(),
            instrumentation: None,
        }
    }

    /// `Owner.name`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.owner, self.name)
    }

    /// Source line of the instruction at `pc` (0 when unknown)
    pub fn line_at(&self, pc: usize) -> u32 {
        self.lines.get(pc).copied().unwrap_or(0)
    }

    /// Guard handler for the invocation at `pc`
    pub fn guard_at(&self, pc: usize) -> Option<usize> {
        self.guards.iter().find(|g| g.pc == pc).map(|g| g.handler)
    }

    /// Whether the instrumentor has processed the method
    pub fn is_instrumented(&self) -> bool {
        self.instrumentation.is_some()
    }

    /// Whether the method is part of the runtime itself
    pub fn is_runtime_internal(&self) -> bool {
        self.owner == RUNTIME_OWNER || self.owner.starts_with("strand.")
    }

    /// Whether the method has code to execute
    pub fn has_body(&self) -> bool {
        !self.flags.native && !self.flags.abstract_
    }

    /// Give every timed intrinsic that lacks one a fresh `Int` state
    /// register. Returns how many registers were added.
    pub fn assign_timed_state(&mut self) -> usize {
        let mut added = 0;
        for instr in &mut self.body {
            if let Instr::Intrinsic { intrinsic, state, .. } = instr {
                if intrinsic.is_timed() && state.is_none() {
                    *state = Some(Reg(self.regs.len() as u16));
                    self.regs.push(Ty::Int);
                    added += 1;
                }
            }
        }
        added
    }

    /// Check register operands, targets, and tables
    pub fn validate(&self) -> Result<(), IrError> {
        if !self.has_body() {
            return Ok(());
        }
        let method = || self.qualified_name();
        if !self.lines.is_empty() && self.lines.len() != self.body.len() {
            return Err(IrError::BadLineTable {
                method: method(),
                lines: self.lines.len(),
                body: self.body.len(),
            });
        }
        let count = self.regs.len();
        let len = self.body.len();
        for (pc, instr) in self.body.iter().enumerate() {
            if let Instr::Intrinsic {
                intrinsic, state: None, ..
            } = instr
            {
                if intrinsic.is_timed() {
                    return Err(IrError::MissingState {
                        method: method(),
                        pc,
                        op: intrinsic.name(),
                    });
                }
            }
            for reg in instr.uses().into_iter().chain(instr.defs()) {
                if reg.index() >= count {
                    return Err(IrError::BadRegister {
                        method: method(),
                        pc,
                        reg: reg.0,
                        count,
                    });
                }
            }
            for target in instr.targets() {
                if target >= len {
                    return Err(IrError::BadTarget { method: method(), pc, target });
                }
            }
        }
        match self.body.last() {
            Some(last) if !last.falls_through() => {}
            _ => return Err(IrError::FallsThrough { method: method() }),
        }
        for handler in &self.handlers {
            if handler.start > handler.end || handler.end > len || handler.target >= len {
                return Err(IrError::BadTarget {
                    method: method(),
                    pc: handler.start,
                    target: handler.target,
                });
            }
            if let Some(reg) = handler.catch {
                if reg.index() >= count {
                    return Err(IrError::BadRegister {
                        method: method(),
                        pc: handler.target,
                        reg: reg.0,
                        count,
                    });
                }
            }
        }
        for guard in &self.guards {
            if guard.pc >= len || guard.handler >= len {
                return Err(IrError::BadTarget {
                    method: method(),
                    pc: guard.pc,
                    target: guard.handler,
                });
            }
        }
        if self.params > count {
            return Err(IrError::BadRegister {
                method: method(),
                pc: 0,
                reg: self.params as u16,
                count,
            });
        }
        Ok(())
    }
}

/// Split `Owner.name` at the last dot
pub fn split_qualified(qualified: &str) -> (&str, &str) {
    match qualified.rfind('.') {
        Some(i) => (&qualified[..i], &qualified[i + 1..]),
        None => ("", qualified),
    }
}

/// Match a qualified name against a pattern: an exact name, `Owner.*`
/// (every method of the owner), or `prefix*`.
pub fn matches_pattern(pattern: &str, qualified: &str) -> bool {
    if let Some(owner) = pattern.strip_suffix(".*") {
        return split_qualified(qualified).0 == owner;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return qualified.starts_with(prefix);
    }
    pattern == qualified
}

#[derive(Serialize, Deserialize)]
struct ProgramData {
    methods: Vec<Method>,
}

/// A set of methods addressed by qualified name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "ProgramData", into = "ProgramData")]
pub struct Program {
    methods: Vec<Method>,
    index: FxHashMap<String, usize>,
}

impl TryFrom<ProgramData> for Program {
    type Error = IrError;

    fn try_from(data: ProgramData) -> Result<Self, Self::Error> {
        Program::from_methods(data.methods)
    }
}

impl From<Program> for ProgramData {
    fn from(program: Program) -> Self {
        ProgramData { methods: program.methods }
    }
}

impl Program {
    /// Create an empty program
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from methods, rejecting duplicates
    pub fn from_methods(methods: impl IntoIterator<Item = Method>) -> Result<Self, IrError> {
        let mut program = Self::new();
        for method in methods {
            program.add(method)?;
        }
        Ok(program)
    }

    /// Parse a JSON program and validate every method
    pub fn from_json(source: &str) -> Result<Self, IrError> {
        let program: Program = serde_json::from_str(source).map_err(|e| IrError::Json(e.to_string()))?;
        program.validate()?;
        Ok(program)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String, IrError> {
        serde_json::to_string_pretty(self).map_err(|e| IrError::Json(e.to_string()))
    }

    /// Add a method. Timed intrinsics of an uninstrumented method that have
    /// no state register get one.
    pub fn add(&mut self, mut method: Method) -> Result<(), IrError> {
        if !method.is_instrumented() && method.has_body() {
            method.assign_timed_state();
        }
        let name = method.qualified_name();
        if self.index.contains_key(&name) {
            return Err(IrError::DuplicateMethod(name));
        }
        self.index.insert(name, self.methods.len());
        self.methods.push(method);
        Ok(())
    }

    /// Look up a method by qualified name
    pub fn get(&self, qualified: &str) -> Option<&Method> {
        self.index.get(qualified).map(|&i| &self.methods[i])
    }

    /// Look up a method mutably
    pub fn get_mut(&mut self, qualified: &str) -> Option<&mut Method> {
        self.index.get(qualified).copied().map(move |i| &mut self.methods[i])
    }

    /// Whether a method exists
    pub fn contains(&self, qualified: &str) -> bool {
        self.index.contains_key(qualified)
    }

    /// All methods in insertion order
    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    /// All methods, mutably
    pub fn methods_mut(&mut self) -> &mut [Method] {
        &mut self.methods
    }

    /// Number of methods
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether the program has no methods
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Validate every method
    pub fn validate(&self) -> Result<(), IrError> {
        self.methods.iter().try_for_each(Method::validate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny(owner: &str, name: &str) -> Method {
        let mut b = MethodBuilder::new(owner, name);
        let r = b.reg(Ty::Int);
        b.constant(r, Const::Int(1));
        b.ret(Some(r));
        b.finish().unwrap()
    }

    #[test]
    fn test_matches_pattern() {
        assert!(matches_pattern("Util.log", "Util.log"));
        assert!(!matches_pattern("Util.log", "Util.logf"));
        assert!(matches_pattern("Util.*", "Util.anything"));
        assert!(!matches_pattern("Util.*", "Utility.x"));
        assert!(matches_pattern("vendor*", "vendor.io.Reader.read"));
        assert_eq!(split_qualified("a.b.C.run"), ("a.b.C", "run"));
    }

    #[test]
    fn test_duplicate_method_rejected() {
        let err = Program::from_methods(vec![tiny("A", "f"), tiny("A", "f")]).unwrap_err();
        assert_eq!(err, IrError::DuplicateMethod("A.f".to_string()));
    }

    #[test]
    fn test_json_loads_and_indexes() {
        let json = r#"{
            "methods": [{
                "owner": "Main", "name": "run", "params": 1,
                "regs": ["int", "int"],
                "body": [
                    {"instr": "const", "dst": 1, "value": {"kind": "int", "value": 2}},
                    {"instr": "binary", "op": "add", "dst": 0, "lhs": 0, "rhs": 1},
                    {"instr": "return", "value": 0}
                ]
            }]
        }"#;
        let program = Program::from_json(json).unwrap();
        let method = program.get("Main.run").unwrap();
        assert_eq!(method.params, 1);
        assert_eq!(
            method.body[1],
            Instr::Binary { op: BinOp::Add, dst: Reg(0), lhs: Reg(0), rhs: Reg(1) }
        );

        let text = program.to_json().unwrap();
        let back = Program::from_json(&text).unwrap();
        assert_eq!(back.methods(), program.methods());
    }

    #[test]
    fn test_json_rejects_duplicates_and_bad_targets() {
        let dup = r#"{"methods": [
            {"owner": "A", "name": "f", "body": [{"instr": "return"}]},
            {"owner": "A", "name": "f", "body": [{"instr": "return"}]}
        ]}"#;
        assert!(matches!(Program::from_json(dup), Err(IrError::Json(_))));

        let bad = r#"{"methods": [
            {"owner": "A", "name": "f", "body": [{"instr": "jump", "target": 4}]}
        ]}"#;
        assert!(matches!(Program::from_json(bad), Err(IrError::BadTarget { target: 4, .. })));
    }

    #[test]
    fn test_json_timed_intrinsic_gets_state_register() {
        let source = r#"{"methods": [
            {"owner": "A", "name": "nap", "regs": ["int"], "body": [
                {"instr": "const", "dst": 0, "value": {"kind": "int", "value": 40}},
                {"instr": "intrinsic", "intrinsic": "sleep", "args": [0]},
                {"instr": "return"}
            ]}
        ]}"#;
        let program = Program::from_json(source).unwrap();
        let method = program.get("A.nap").unwrap();
        assert_eq!(method.regs, vec![Ty::Int, Ty::Int]);
        assert!(matches!(method.body[1], Instr::Intrinsic { state: Some(Reg(1)), .. }));
    }

    #[test]
    fn test_validate_rejects_timed_intrinsic_without_state() {
        let mut method = tiny("A", "f");
        method.body.insert(
            0,
            Instr::Intrinsic {
                dst: None,
                intrinsic: IntrinsicOp::Join,
                args: vec![Reg(0)],
                state: None,
            },
        );
        method.lines.clear();
        assert!(matches!(
            method.validate(),
            Err(IrError::MissingState { pc: 0, op: "join", .. })
        ));
        assert_eq!(method.assign_timed_state(), 1);
        assert!(method.validate().is_ok());
        assert_eq!(method.assign_timed_state(), 0);
    }

    #[test]
    fn test_validate_catches_bad_register() {
        let mut method = tiny("A", "f");
        method.body[0] = Instr::Move { dst: Reg(0), src: Reg(7) };
        assert!(matches!(method.validate(), Err(IrError::BadRegister { reg: 7, .. })));
    }

    #[test]
    fn test_validate_catches_fall_through() {
        let mut method = tiny("A", "f");
        method.body.pop();
        method.lines.pop();
        assert!(matches!(method.validate(), Err(IrError::FallsThrough { .. })));
    }

    #[test]
    fn test_uses_and_defs() {
        let instr = Instr::Intrinsic {
            dst: Some(Reg(0)),
            intrinsic: IntrinsicOp::Sleep,
            args: vec![Reg(1)],
            state: Some(Reg(2)),
        };
        assert_eq!(instr.uses(), vec![Reg(1), Reg(2)]);
        assert_eq!(instr.defs(), vec![Reg(0), Reg(2)]);
        assert!(IntrinsicOp::Sleep.is_timed());
        assert!(!IntrinsicOp::Send.is_timed());
    }
}
