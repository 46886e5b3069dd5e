//! Backward liveness over a method body
//!
//! The registers live into a suspension point are exactly what its frame
//! must save: the restore block jumps back to the invocation and
//! re-executes it, so arguments are included.

use crate::ir::{Method, Reg};

/// Fixed-size register bitset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegSet {
    bits: Vec<u64>,
}

impl RegSet {
    /// Empty set for `count` registers
    pub fn new(count: usize) -> Self {
        Self {
            bits: vec![0; count.div_ceil(64)],
        }
    }

    /// Add a register
    pub fn insert(&mut self, reg: Reg) {
        self.bits[reg.index() / 64] |= 1 << (reg.index() % 64);
    }

    /// Remove a register
    pub fn remove(&mut self, reg: Reg) {
        self.bits[reg.index() / 64] &= !(1 << (reg.index() % 64));
    }

    /// Membership
    pub fn contains(&self, reg: Reg) -> bool {
        self.bits[reg.index() / 64] & (1 << (reg.index() % 64)) != 0
    }

    /// `self |= other`; returns whether anything was added
    pub fn union_with(&mut self, other: &RegSet) -> bool {
        let mut changed = false;
        for (a, b) in self.bits.iter_mut().zip(&other.bits) {
            let merged = *a | *b;
            changed |= merged != *a;
            *a = merged;
        }
        changed
    }

    /// Registers in ascending order
    pub fn to_vec(&self) -> Vec<Reg> {
        let mut regs = Vec::new();
        for (word, bits) in self.bits.iter().enumerate() {
            let mut bits = *bits;
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                regs.push(Reg((word * 64 + bit) as u16));
                bits &= bits - 1;
            }
        }
        regs
    }

    /// Number of registers in the set
    pub fn len(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }
}

/// Live-in sets for every instruction
#[derive(Debug)]
pub struct Liveness {
    live_in: Vec<RegSet>,
}

impl Liveness {
    /// Compute liveness for `method`
    pub fn compute(method: &Method) -> Self {
        let count = method.regs.len();
        let len = method.body.len();
        let mut live_in = vec![RegSet::new(count); len];

        let mut changed = true;
        while changed {
            changed = false;
            for pc in (0..len).rev() {
                let instr = &method.body[pc];
                let mut out = RegSet::new(count);
                if instr.falls_through() && pc + 1 < len {
                    out.union_with(&live_in[pc + 1]);
                }
                for target in instr.targets() {
                    out.union_with(&live_in[target]);
                }
                for def in instr.defs() {
                    out.remove(def);
                }
                for used in instr.uses() {
                    out.insert(used);
                }

                // a throwing instruction never writes its defs
                for handler in method.handlers.iter().filter(|h| h.covers(pc)) {
                    let mut entry = live_in[handler.target].clone();
                    if let Some(catch) = handler.catch {
                        entry.remove(catch);
                    }
                    out.union_with(&entry);
                }
                if out != live_in[pc] {
                    live_in[pc] = out;
                    changed = true;
                }
            }
        }

        Self { live_in }
    }

    /// Registers live on entry to `pc`, ascending
    pub fn live_in(&self, pc: usize) -> Vec<Reg> {
        self.live_in[pc].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinOp, Const, IntrinsicOp, MethodBuilder, Ty};

    #[test]
    fn test_regset_basics() {
        let mut set = RegSet::new(130);
        set.insert(Reg(3));
        set.insert(Reg(129));
        assert!(set.contains(Reg(129)));
        assert_eq!(set.to_vec(), vec![Reg(3), Reg(129)]);
        set.remove(Reg(3));
        assert_eq!(set.len(), 1);
        let mut other = RegSet::new(130);
        assert!(other.union_with(&set));
        assert!(!other.union_with(&set));
    }

    #[test]
    fn test_dead_values_are_not_saved() {
        // a = 1; dead = 2; b = park(); return a + b
        let mut b = MethodBuilder::new("L", "f");
        let a = b.reg(Ty::Int);
        let dead = b.reg(Ty::Int);
        let got = b.reg(Ty::Ref);
        let sum = b.reg(Ty::Int);
        b.constant(a, Const::Int(1));
        b.constant(dead, Const::Int(2));
        b.intrinsic(Some(got), IntrinsicOp::Park, &[]);
        b.binary(BinOp::Add, sum, a, got);
        b.ret(Some(sum));
        let method = b.finish().unwrap();
        let liveness = Liveness::compute(&method);
        assert_eq!(liveness.live_in(2), vec![a]);
    }

    #[test]
    fn test_loop_carried_and_arguments_live() {
        // i = 0; loop: send(ch, i); i = i + 1; if i < n goto loop; return
        let mut b = MethodBuilder::new("L", "pump");
        let ch = b.param(Ty::Ref);
        let n = b.param(Ty::Int);
        let i = b.reg(Ty::Int);
        let one = b.reg(Ty::Int);
        let more = b.reg(Ty::Bool);
        b.constant(i, Const::Int(0));
        b.constant(one, Const::Int(1));
        let top = b.here();
        b.intrinsic(None, IntrinsicOp::Send, &[ch, i]);
        b.binary(BinOp::Add, i, i, one);
        b.binary(BinOp::Lt, more, i, n);
        let done = b.label();
        b.branch(more, top, done);
        b.bind(done);
        b.ret(None);
        let method = b.finish().unwrap();
        let liveness = Liveness::compute(&method);
        assert_eq!(liveness.live_in(2), vec![ch, n, i, one]);
    }

    #[test]
    fn test_handler_edge_keeps_values_alive() {
        // x = 5; try { park() } catch(e) { return x }; return null
        let mut b = MethodBuilder::new("L", "h");
        let x = b.reg(Ty::Int);
        let e = b.reg(Ty::Ref);
        b.constant(x, Const::Int(5));
        let start = b.here();
        b.intrinsic(None, IntrinsicOp::Park, &[]);
        let end = b.here();
        b.ret(None);
        let catch = b.here();
        b.ret(Some(x));
        b.handler(start, end, catch, Some(e));
        let method = b.finish().unwrap();
        let liveness = Liveness::compute(&method);
        assert_eq!(liveness.live_in(1), vec![x]);
        assert!(!liveness.live_in(3).contains(&e));
    }

    #[test]
    fn test_handler_reads_call_destination() {
        // x = 5; try { x = S.f() } catch(e) { return x }; return x
        let mut b = MethodBuilder::new("L", "k");
        let x = b.reg(Ty::Int);
        let e = b.reg(Ty::Ref);
        b.constant(x, Const::Int(5));
        let start = b.here();
        b.call(Some(x), "S.f", &[]);
        let end = b.here();
        b.ret(Some(x));
        let catch = b.here();
        b.ret(Some(x));
        b.handler(start, end, catch, Some(e));
        let method = b.finish().unwrap();
        let liveness = Liveness::compute(&method);
        assert_eq!(liveness.live_in(1), vec![x]);
    }
}
