//! Human-readable listings of programs, used by `strand instrument --print`
//! and in test failure output.

use super::{Instr, Method, Program, Reg};
use std::fmt;

/// Trait for pretty-printing IR constructs
pub trait PrettyPrint {
    /// Render as a listing
    fn pretty_print(&self) -> String;
}

impl PrettyPrint for Program {
    fn pretty_print(&self) -> String {
        self.to_string()
    }
}

impl PrettyPrint for Method {
    fn pretty_print(&self) -> String {
        self.to_string()
    }
}

fn regs(list: &[Reg]) -> String {
    list.iter().map(Reg::to_string).collect::<Vec<_>>().join(", ")
}

fn dst(dst: &Option<Reg>) -> String {
    match dst {
        Some(reg) => format!("{} = ", reg),
        None => String::new(),
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Const { dst, value } => write!(f, "{} = const {}", dst, value),
            Instr::Move { dst, src } => write!(f, "{} = {}", dst, src),
            Instr::Binary { op, dst, lhs, rhs } => write!(f, "{} = {} {}, {}", dst, op, lhs, rhs),
            Instr::Not { dst, src } => write!(f, "{} = not {}", dst, src),
            Instr::Jump { target } => write!(f, "jump @{}", target),
            Instr::Branch { cond, if_true, if_false } => write!(f, "branch {} ? @{} : @{}", cond, if_true, if_false),
            Instr::Call { dst: d, callee, args } => write!(f, "{}call {}({})", dst(d), callee, regs(args)),
            Instr::CallDynamic { dst: d, target, args } => {
                write!(f, "{}call_dynamic {}({})", dst(d), target, regs(args))
            }
            Instr::Native { dst: d, name, args } => write!(f, "{}native {}({})", dst(d), name, regs(args)),
            Instr::Intrinsic { dst: d, intrinsic, args, state } => {
                write!(f, "{}{}({})", dst(d), intrinsic.name(), regs(args))?;
                if let Some(state) = state {
                    write!(f, " [state {}]", state)?;
                }
                Ok(())
            }
            Instr::Return { value: Some(value) } => write!(f, "return {}", value),
            Instr::Return { value: None } => write!(f, "return"),
            Instr::Throw { value } => write!(f, "throw {}", value),
            Instr::Dispatch { resume } => {
                let targets: Vec<String> = resume.iter().map(|pc| format!("@{}", pc)).collect();
                write!(f, "dispatch [{}]", targets.join(", "))
            }
            Instr::Restore { entry, layout, resume_at } => {
                write!(f, "restore #{} ({}) -> @{}", entry, regs(layout), resume_at)
            }
            Instr::Save { entry, layout } => write!(f, "save #{} ({})", entry, regs(layout)),
            Instr::Propagate => write!(f, "propagate"),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.regs[..self.params.min(self.regs.len())]
            .iter()
            .enumerate()
            .map(|(i, ty)| format!("r{}: {:?}", i, ty))
            .collect();
        write!(f, "method {}({})", self.qualified_name(), params.join(", "))?;
        let flags = &self.flags;
        for (set, name) in [
            (flags.suspendable, "suspendable"),
            (flags.throws_suspend, "throws-suspend"),
            (flags.synchronized, "synchronized"),
            (flags.native, "native"),
            (flags.abstract_, "abstract"),
            (flags.bridge, "bridge"),
            (flags.synthetic, "synthetic"),
        ] {
            if set {
                write!(f, " {}", name)?;
            }
        }
        if let Some(inst) = &self.instrumentation {
            write!(f, " [instrumented{}]", if inst.transparent { ", transparent" } else { "" })?;
        }
        writeln!(f, " {{")?;

        if self.regs.len() > self.params {
            let locals: Vec<String> = self.regs[self.params..]
                .iter()
                .enumerate()
                .map(|(i, ty)| format!("r{}: {:?}", i + self.params, ty))
                .collect();
            writeln!(f, "  ; locals: {}", locals.join(", "))?;
        }
        for (pc, instr) in self.body.iter().enumerate() {
            let guard = match self.guard_at(pc) {
                Some(handler) => format!("  ; guarded -> @{}", handler),
                None => String::new(),
            };
            writeln!(f, "  {:>4}  L{:<4} {}{}", pc, self.line_at(pc), instr, guard)?;
        }
        for handler in &self.handlers {
            writeln!(
                f,
                "  ; catch @{}..@{} -> @{}{}",
                handler.start,
                handler.end,
                handler.target,
                handler.catch.map(|r| format!(" into {}", r)).unwrap_or_default()
            )?;
        }
        if let Some(inst) = &self.instrumentation {
            for site in &inst.call_sites {
                writeln!(
                    f,
                    "  ; site #{} @{} line {} {} saves ({})",
                    site.entry,
                    site.pc,
                    site.line,
                    site.callee,
                    regs(&site.layout)
                )?;
            }
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, method) in self.methods().iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", method)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Const, IntrinsicOp, MethodBuilder, Ty};

    #[test]
    fn test_method_listing() {
        let mut b = MethodBuilder::new("Main", "wait");
        let ch = b.param(Ty::Ref);
        let v = b.reg(Ty::Ref);
        b.line(7);
        b.intrinsic(Some(v), IntrinsicOp::Receive, &[ch]);
        b.constant(v, Const::Str("x".into()));
        b.ret(Some(v));
        let text = b.finish().unwrap().pretty_print();
        assert!(text.starts_with("method Main.wait(r0: Ref) {"));
        assert!(text.contains("r1 = receive(r0)"));
        assert!(text.contains("L7"));
        assert!(text.contains("r1 = const \"x\""));
    }
}
