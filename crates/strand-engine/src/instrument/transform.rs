//! Rewrites a suspendable method into its resumable form
//!
//! Given suspension points `s1..sn` the new body is:
//!
//! ```text
//! 0            dispatch [R1 .. Rn]
//! 1 ..= len    original body, every target shifted by one
//! R1 .. Rn     restore #k (layout k) -> call site k
//! S1 .. Sn     save #k (layout k); propagate
//! ```
//!
//! Each call site is guarded by its save block. A fresh call falls through
//! the dispatch; a replayed frame jumps to the restore block recorded in its
//! frame marker, reloads the saved registers and re-executes the invocation,
//! whose callee replays in turn.

use super::liveness::Liveness;
use crate::ir::{CallSite, Guard, Handler, Instr, Instrumentation, Method, Reg};

/// One suspension point chosen for instrumentation
#[derive(Debug, Clone)]
pub struct SitePlan {
    /// Invocation index in the original body
    pub pc: usize,
    /// Callee description for metadata
    pub callee: String,
    /// Registers live into the invocation
    pub layout: Vec<Reg>,
}

/// Plan the sites of `method` from the invocations at `pcs`
pub fn plan_sites(method: &Method, pcs: &[(usize, String)]) -> Vec<SitePlan> {
    let liveness = Liveness::compute(method);
    pcs.iter()
        .map(|(pc, callee)| SitePlan {
            pc: *pc,
            callee: callee.clone(),
            layout: liveness.live_in(*pc),
        })
        .collect()
}

/// Produce the instrumented method
pub fn rewrite(method: &Method, sites: &[SitePlan]) -> Method {
    let len = method.body.len();
    let shift = |pc: usize| pc + 1;
    let restore_pc = |i: usize| 1 + len + i;
    let save_pc = |i: usize| 1 + len + sites.len() + 2 * i;

    let mut body = Vec::with_capacity(1 + len + 3 * sites.len());
    let mut lines = Vec::with_capacity(body.capacity());

    body.push(Instr::Dispatch {
        resume: (0..sites.len()).map(restore_pc).collect(),
    });
    lines.push(method.line_at(0));

    for (pc, instr) in method.body.iter().enumerate() {
        let mut instr = instr.clone();
        instr.remap_targets(shift);
        body.push(instr);
        lines.push(method.line_at(pc));
    }

    let mut call_sites = Vec::with_capacity(sites.len());
    for (i, site) in sites.iter().enumerate() {
        let entry = (i + 1) as u16;
        body.push(Instr::Restore {
            entry,
            layout: site.layout.clone(),
            resume_at: shift(site.pc),
        });
        lines.push(method.line_at(site.pc));
        call_sites.push(CallSite {
            pc: shift(site.pc),
            line: method.line_at(site.pc),
            callee: site.callee.clone(),
            entry,
            layout: site.layout.clone(),
        });
    }
    for (i, site) in sites.iter().enumerate() {
        body.push(Instr::Save {
            entry: (i + 1) as u16,
            layout: site.layout.clone(),
        });
        body.push(Instr::Propagate);
        lines.push(method.line_at(site.pc));
        lines.push(method.line_at(site.pc));
    }

    let guards = sites
        .iter()
        .enumerate()
        .map(|(i, site)| Guard {
            pc: shift(site.pc),
            handler: save_pc(i),
        })
        .collect();
    let handlers = method
        .handlers
        .iter()
        .map(|h| Handler {
            start: shift(h.start),
            end: shift(h.end),
            target: shift(h.target),
            catch: h.catch,
        })
        .collect();

    Method {
        owner: method.owner.clone(),
        name: method.name.clone(),
        params: method.params,
        regs: method.regs.clone(),
        body,
        lines,
        handlers,
        guards,
        flags: method.flags.clone(),
        instrumentation: Some(Instrumentation {
            call_sites,
            transparent: false,
        }),
    }
}

/// Whether a bridge only forwards its parameters to one call and returns
/// the result. Such a bridge needs no frame: replaying it re-issues the same
/// call with the same arguments.
pub fn is_forwarding_bridge(method: &Method) -> bool {
    let params: Vec<Reg> = (0..method.params).map(|i| Reg(i as u16)).collect();
    match method.body.as_slice() {
        [Instr::Call { dst, args, .. }, Instr::Return { value }] => *args == params && dst == value,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinOp, Const, IntrinsicOp, MethodBuilder, Ty};

    #[test]
    fn test_rewrite_layout() {
        let mut b = MethodBuilder::new("T", "f");
        let x = b.reg(Ty::Int);
        let y = b.reg(Ty::Ref);
        let loop_top = b.label();
        b.line(10);
        b.constant(x, Const::Int(1));
        b.bind(loop_top);
        b.line(11);
        b.call(Some(y), "T.g", &[x]);
        b.line(12);
        b.binary(BinOp::Add, x, x, x);
        b.jump(loop_top);
        let method = b.finish().unwrap();

        let sites = plan_sites(&method, &[(1, "T.g".to_string())]);
        assert_eq!(sites[0].layout, vec![x]);
        let out = rewrite(&method, &sites);

        assert_eq!(out.body.len(), 1 + 4 + 1 + 2);
        assert_eq!(out.body[0], Instr::Dispatch { resume: vec![5] });
        assert_eq!(out.body[4], Instr::Jump { target: 2 });
        assert_eq!(
            out.body[5],
            Instr::Restore { entry: 1, layout: vec![x], resume_at: 2 }
        );
        assert_eq!(out.body[6], Instr::Save { entry: 1, layout: vec![x] });
        assert_eq!(out.body[7], Instr::Propagate);
        assert_eq!(out.guards, vec![Guard { pc: 2, handler: 6 }]);
        assert_eq!(out.line_at(5), 11);

        let inst = out.instrumentation.as_ref().unwrap();
        assert_eq!(inst.call_sites[0].pc, 2);
        assert_eq!(inst.call_sites[0].line, 11);
        out.validate().unwrap();
    }

    #[test]
    fn test_handlers_shift() {
        let mut b = MethodBuilder::new("T", "h");
        let e = b.reg(Ty::Ref);
        let start = b.here();
        b.intrinsic(None, IntrinsicOp::Yield, &[]);
        let end = b.here();
        b.ret(None);
        let catch = b.here();
        b.ret(Some(e));
        b.handler(start, end, catch, Some(e));
        let method = b.finish().unwrap();

        let sites = plan_sites(&method, &[(0, "intrinsic:yield".to_string())]);
        let out = rewrite(&method, &sites);
        assert_eq!(out.handlers[0], Handler { start: 1, end: 2, target: 3, catch: Some(e) });
        out.validate().unwrap();
    }

    #[test]
    fn test_forwarding_bridge_detection() {
        let mut b = MethodBuilder::new("T", "bridge");
        let a = b.param(Ty::Ref);
        let r = b.reg(Ty::Ref);
        b.call(Some(r), "T.real", &[a]);
        b.ret(Some(r));
        assert!(is_forwarding_bridge(&b.finish().unwrap()));

        let mut b = MethodBuilder::new("T", "bridge");
        let a = b.param(Ty::Ref);
        let r = b.reg(Ty::Ref);
        b.call(Some(r), "T.real", &[a, a]);
        b.ret(Some(r));
        assert!(!is_forwarding_bridge(&b.finish().unwrap()));
    }
}
