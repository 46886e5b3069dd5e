//! Call-graph suspendability analysis
//!
//! A method is suspendable when a classifier says so, when it contains a
//! suspending intrinsic or a dynamic call, or when it calls a suspendable
//! method. The last rule is closed over the reverse call graph with a
//! worklist. Callees outside the program are asked of the classifiers and
//! assumed suspendable when nobody knows them.

use super::classifier::{Classification, ClassifierChain, MethodRef};
use crate::ir::{Instr, Program};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeSet;

/// Result of the analysis over one program
#[derive(Debug, Default)]
pub struct Analysis {
    suspendable: FxHashSet<String>,
    non_suspendable: FxHashSet<String>,
    /// External callees assumed suspendable for lack of information
    pub assumed: BTreeSet<String>,
}

impl Analysis {
    /// Whether `qualified` (a program method or an external callee) suspends
    pub fn is_suspendable(&self, qualified: &str) -> bool {
        self.suspendable.contains(qualified)
    }

    /// Whether a classifier pinned `qualified` as non-suspendable
    pub fn is_pinned_non_suspendable(&self, qualified: &str) -> bool {
        self.non_suspendable.contains(qualified)
    }

    /// Number of suspendable names
    pub fn suspendable_count(&self) -> usize {
        self.suspendable.len()
    }
}

/// Whether an instruction is a suspension point given the analysis
pub fn is_suspension_point(instr: &Instr, analysis: &Analysis) -> bool {
    match instr {
        Instr::Call { callee, .. } => analysis.is_suspendable(callee),
        Instr::CallDynamic { .. } | Instr::Intrinsic { .. } => true,
        _ => false,
    }
}

/// Run the analysis
pub fn analyze(program: &Program, classifiers: &ClassifierChain) -> Analysis {
    let mut analysis = Analysis::default();
    let mut callers: FxHashMap<&str, Vec<String>> = FxHashMap::default();
    let mut worklist: Vec<String> = Vec::new();

    for method in program.methods() {
        let name = method.qualified_name();
        let verdict = classifiers.classify(&MethodRef {
            qualified: &name,
            method: Some(method),
        });
        if verdict == Classification::NonSuspendable {
            analysis.non_suspendable.insert(name.clone());
        }

        let mut direct = false;
        for instr in &method.body {
            match instr {
                Instr::Call { callee, .. } => callers.entry(callee.as_str()).or_default().push(name.clone()),
                Instr::CallDynamic { .. } | Instr::Intrinsic { .. } => direct = true,
                _ => {}
            }
        }

        if verdict == Classification::Suspendable || (direct && verdict != Classification::NonSuspendable) {
            worklist.push(name);
        }
    }

    let external: BTreeSet<&str> = callers.keys().copied().filter(|c| !program.contains(c)).collect();
    for callee in external {
        match classifiers.classify(&MethodRef {
            qualified: callee,
            method: None,
        }) {
            Classification::Suspendable => worklist.push(callee.to_string()),
            Classification::NonSuspendable => {
                analysis.non_suspendable.insert(callee.to_string());
            }
            Classification::Unknown => {
                analysis.assumed.insert(callee.to_string());
                worklist.push(callee.to_string());
            }
        }
    }

    while let Some(name) = worklist.pop() {
        if analysis.non_suspendable.contains(&name) || !analysis.suspendable.insert(name.clone()) {
            continue;
        }
        if let Some(list) = callers.get(name.as_str()) {
            for caller in list {
                if !analysis.suspendable.contains(caller) {
                    worklist.push(caller.clone());
                }
            }
        }
    }

    tracing::debug!(
        methods = program.len(),
        suspendable = analysis.suspendable.len(),
        assumed = analysis.assumed.len(),
        "suspendability analysis done"
    );
    analysis
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::classifier::ListClassifier;
    use crate::ir::{IntrinsicOp, Method, MethodBuilder, Ty};

    fn calls(owner: &str, name: &str, callees: &[&str]) -> Method {
        let mut b = MethodBuilder::new(owner, name);
        for callee in callees {
            b.call(None, *callee, &[]);
        }
        b.ret(None);
        b.finish().unwrap()
    }

    fn parks(owner: &str, name: &str) -> Method {
        let mut b = MethodBuilder::new(owner, name);
        b.intrinsic(None, IntrinsicOp::Park, &[]);
        b.ret(None);
        b.finish().unwrap()
    }

    fn chain() -> ClassifierChain {
        ClassifierChain::from_options(&Default::default())
    }

    #[test]
    fn test_transitive_closure() {
        let program = Program::from_methods(vec![
            calls("A", "top", &["A.mid"]),
            calls("A", "mid", &["A.leaf", "A.pure"]),
            parks("A", "leaf"),
            calls("A", "pure", &[]),
        ])
        .unwrap();
        let analysis = analyze(&program, &chain());
        assert!(analysis.is_suspendable("A.top"));
        assert!(analysis.is_suspendable("A.mid"));
        assert!(analysis.is_suspendable("A.leaf"));
        assert!(!analysis.is_suspendable("A.pure"));
    }

    #[test]
    fn test_recursion_terminates() {
        let program = Program::from_methods(vec![
            calls("R", "even", &["R.odd"]),
            calls("R", "odd", &["R.even", "R.wait"]),
            parks("R", "wait"),
        ])
        .unwrap();
        let analysis = analyze(&program, &chain());
        assert!(analysis.is_suspendable("R.even"));
        assert!(analysis.is_suspendable("R.odd"));
    }

    #[test]
    fn test_unknown_callee_assumed_suspendable() {
        let program = Program::from_methods(vec![calls("A", "f", &["lib.X.g"])]).unwrap();
        let analysis = analyze(&program, &chain());
        assert!(analysis.is_suspendable("A.f"));
        assert!(analysis.assumed.contains("lib.X.g"));
    }

    #[test]
    fn test_non_suspendable_list_stops_propagation() {
        let program = Program::from_methods(vec![calls("A", "f", &["lib.X.g"])]).unwrap();
        let mut chain = chain();
        chain.push(ListClassifier::new(vec![], vec!["lib.X.*".into()]));
        let analysis = analyze(&program, &chain);
        assert!(!analysis.is_suspendable("A.f"));
        assert!(analysis.assumed.is_empty());
    }

    #[test]
    fn test_annotation_seeds_without_calls() {
        let mut b = MethodBuilder::new("A", "marked");
        let r = b.reg(Ty::Int);
        b.ret(Some(r));
        b.suspendable();
        let program = Program::from_methods(vec![b.finish().unwrap(), calls("A", "user", &["A.marked"])]).unwrap();
        let analysis = analyze(&program, &chain());
        assert!(analysis.is_suspendable("A.user"));
    }
}
