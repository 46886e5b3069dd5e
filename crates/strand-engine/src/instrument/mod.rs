//! Instrumentation pass
//!
//! Rewrites every suspendable method of a [`Program`] so that a suspension
//! anywhere in its callee subtree saves the method's live registers into the
//! fiber [`Stack`](crate::fiber::Stack) and returns, and so that the next run
//! of the fiber replays the method back to the same call site.
//!
//! # Pipeline
//!
//! 1. [`analysis`]: call-graph closure decides which methods suspend.
//! 2. Policy checks: monitors, blocking natives, bridges, entry and slot
//!    limits.
//! 3. [`liveness`]: live registers at each suspension point.
//! 4. [`transform`]: dispatch, restore and save blocks, guards, and
//!    per-call-site metadata.
//!
//! The pass is all-or-nothing: on error the program is left untouched.
//! Re-running it skips methods that already carry an instrumentation marker.

pub mod analysis;
pub mod classifier;
pub mod link;
pub mod liveness;
pub mod transform;

pub use classifier::{
    AnnotationClassifier, Classification, ClassifierChain, ListClassifier, MethodRef, SuspendableClassifier,
};
pub use link::{link, LinkError};

use crate::defaults::{BLOCKING_NATIVES, MAX_ENTRY, MAX_SLOTS};
use crate::ir::{matches_pattern, Instr, Instrumentation, IrError, Method, Program};
use analysis::{is_suspension_point, Analysis};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that make a program unusable. Never downgraded to warnings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstrumentError {
    /// A suspendable method holds a monitor and monitors are not allowed
    #[error("{method} is synchronized and suspendable; a suspension would hold its monitor across fibers (set allow_monitors to permit)")]
    Synchronized {
        /// Qualified method name
        method: String,
    },

    /// A suspendable method calls a thread-blocking native
    #[error("{method} (line {line}) calls thread-blocking {callee} and is suspendable (set allow_blocking to permit)")]
    BlockingCall {
        /// Qualified method name
        method: String,
        /// Blocking native
        callee: String,
        /// Source line
        line: u32,
    },

    /// More suspension points than a frame marker can address
    #[error("{method} has {count} suspension points; at most {MAX_ENTRY} are supported")]
    TooManyEntries {
        /// Qualified method name
        method: String,
        /// Suspension points found
        count: usize,
    },

    /// A suspension point needs more slots than a frame marker can record
    #[error("{method} needs {count} slots at instruction {pc}; at most {MAX_SLOTS} are supported")]
    TooManySlots {
        /// Qualified method name
        method: String,
        /// Suspension point
        pc: usize,
        /// Live registers
        count: usize,
    },

    /// A native method was classified suspendable
    #[error("native method {method} cannot be suspendable")]
    NativeSuspendable {
        /// Qualified method name
        method: String,
    },

    /// The method's shape cannot be instrumented
    #[error("cannot instrument {method}: {reason}")]
    UnsupportedShape {
        /// Qualified method name
        method: String,
        /// Why
        reason: String,
    },

    /// The method is malformed
    #[error(transparent)]
    Malformed(#[from] IrError),
}

/// Instrumentation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentOptions {
    /// Permit synchronized suspendable methods (warn instead of fail)
    pub allow_monitors: bool,
    /// Permit thread-blocking natives in suspendable methods (warn instead of fail)
    pub allow_blocking: bool,
    /// Foreign code: matching methods are never rewritten
    pub exclude: Vec<String>,
    /// Additional suspendable methods (names or patterns)
    pub suspendables: Vec<String>,
    /// Methods that never suspend (names or patterns)
    pub non_suspendables: Vec<String>,
    /// Natives that block the calling OS thread
    pub blocking_calls: Vec<String>,
}

impl Default for InstrumentOptions {
    fn default() -> Self {
        Self {
            allow_monitors: false,
            allow_blocking: false,
            exclude: Vec::new(),
            suspendables: Vec::new(),
            non_suspendables: Vec::new(),
            blocking_calls: BLOCKING_NATIVES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Why a method was left alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Never suspends
    NotSuspendable,
    /// Carries an instrumentation marker already
    AlreadyInstrumented,
    /// Matches an exclude pattern
    Excluded,
    /// Abstract; nothing to rewrite
    NoBody,
    /// Suspendable by declaration but calls nothing that suspends
    NoSuspensionPoints,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::NotSuspendable => "not suspendable",
            SkipReason::AlreadyInstrumented => "already instrumented",
            SkipReason::Excluded => "excluded",
            SkipReason::NoBody => "no body",
            SkipReason::NoSuspensionPoints => "no suspension points",
        };
        f.write_str(s)
    }
}

/// Outcome of one instrumentation run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentReport {
    /// Rewritten methods
    pub instrumented: Vec<String>,
    /// Methods left alone
    pub skipped: Vec<(String, SkipReason)>,
    /// Non-fatal findings
    pub warnings: Vec<String>,
}

impl InstrumentReport {
    /// Why `method` was skipped, if it was
    pub fn skip_reason(&self, method: &str) -> Option<SkipReason> {
        self.skipped.iter().find(|(m, _)| m == method).map(|(_, r)| *r)
    }

    fn warn(&mut self, message: String) {
        tracing::warn!("{}", message);
        self.warnings.push(message);
    }
}

impl fmt::Display for InstrumentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for name in &self.instrumented {
            writeln!(f, "instrumented {}", name)?;
        }
        for (name, reason) in &self.skipped {
            writeln!(f, "skipped      {} ({})", name, reason)?;
        }
        for warning in &self.warnings {
            writeln!(f, "warning: {}", warning)?;
        }
        Ok(())
    }
}

/// The instrumentation pass with its classifiers and options
#[derive(Debug)]
pub struct Instrumentor {
    options: InstrumentOptions,
    classifiers: ClassifierChain,
}

impl Instrumentor {
    /// Create with the default classifier chain for `options`
    pub fn new(options: InstrumentOptions) -> Self {
        let classifiers = ClassifierChain::from_options(&options);
        Self { options, classifiers }
    }

    /// Append a classifier to the chain
    pub fn with_classifier(mut self, classifier: impl SuspendableClassifier + 'static) -> Self {
        self.classifiers.push(classifier);
        self
    }

    /// Settings
    pub fn options(&self) -> &InstrumentOptions {
        &self.options
    }

    /// Whether `qualified` is foreign code
    pub fn is_excluded(&self, qualified: &str) -> bool {
        self.options.exclude.iter().any(|p| matches_pattern(p, qualified))
    }

    /// Suspendability of every method, without rewriting anything
    pub fn analyze(&self, program: &Program) -> Analysis {
        analysis::analyze(program, &self.classifiers)
    }

    /// Rewrite every suspendable method of `program` in place
    pub fn instrument(&self, program: &mut Program) -> Result<InstrumentReport, InstrumentError> {
        let analysis = self.analyze(program);
        let mut report = InstrumentReport::default();
        for callee in &analysis.assumed {
            report.warn(format!("{} is not part of the program; assuming it suspends", callee));
        }

        let mut rewritten: Vec<Method> = Vec::new();
        let mut warned_blocking: FxHashSet<String> = FxHashSet::default();
        for method in program.methods() {
            let name = method.qualified_name();
            match self.instrument_method(method, &analysis, &mut report, &mut warned_blocking)? {
                Ok(new_method) => {
                    tracing::debug!(
                        method = %name,
                        sites = new_method.instrumentation.as_ref().map_or(0, |i| i.call_sites.len()),
                        "instrumented"
                    );
                    report.instrumented.push(name);
                    rewritten.push(new_method);
                }
                Err(reason) => {
                    tracing::trace!(method = %name, %reason, "skipped");
                    report.skipped.push((name, reason));
                }
            }
        }

        for method in rewritten {
            let name = method.qualified_name();
            if let Some(slot) = program.get_mut(&name) {
                *slot = method;
            }
        }
        Ok(report)
    }

    fn instrument_method(
        &self,
        method: &Method,
        analysis: &Analysis,
        report: &mut InstrumentReport,
        warned_blocking: &mut FxHashSet<String>,
    ) -> Result<Result<Method, SkipReason>, InstrumentError> {
        let name = method.qualified_name();
        if method.is_instrumented() {
            return Ok(Err(SkipReason::AlreadyInstrumented));
        }
        if !analysis.is_suspendable(&name) {
            if analysis.is_pinned_non_suspendable(&name) {
                if let Some(instr) = method.body.iter().find(|i| is_suspension_point(i, analysis)) {
                    report.warn(format!(
                        "{} is classified non-suspendable but contains suspension point `{}`",
                        name, instr
                    ));
                }
            }
            return Ok(Err(SkipReason::NotSuspendable));
        }
        if method.flags.native {
            return Err(InstrumentError::NativeSuspendable { method: name });
        }
        if method.flags.abstract_ {
            return Ok(Err(SkipReason::NoBody));
        }
        if self.is_excluded(&name) {
            return Ok(Err(SkipReason::Excluded));
        }
        method.validate()?;

        if method.flags.synchronized {
            if !self.options.allow_monitors {
                return Err(InstrumentError::Synchronized { method: name });
            }
            report.warn(format!("{} is synchronized and suspendable", name));
        }

        let mut pcs: Vec<(usize, String)> = Vec::new();
        for (pc, instr) in method.body.iter().enumerate() {
            if let Instr::Native { name: callee, .. } = instr {
                if self.options.blocking_calls.iter().any(|b| b == callee) {
                    if !self.options.allow_blocking {
                        return Err(InstrumentError::BlockingCall {
                            method: name,
                            callee: callee.clone(),
                            line: method.line_at(pc),
                        });
                    }
                    if warned_blocking.insert(callee.clone()) {
                        report.warn(format!("{} blocks its thread and is called from suspendable {}", callee, name));
                    }
                }
            }
            if is_suspension_point(instr, analysis) {
                pcs.push((pc, describe_callee(instr)));
            }
        }

        if method.flags.bridge {
            if transform::is_forwarding_bridge(method) {
                let mut bridged = method.clone();
                bridged.instrumentation = Some(Instrumentation {
                    call_sites: Vec::new(),
                    transparent: true,
                });
                return Ok(Ok(bridged));
            }
            return Err(InstrumentError::UnsupportedShape {
                method: name,
                reason: "bridge method does more than forward its parameters".to_string(),
            });
        }

        if pcs.is_empty() {
            return Ok(Err(SkipReason::NoSuspensionPoints));
        }
        if pcs.len() > MAX_ENTRY {
            return Err(InstrumentError::TooManyEntries {
                method: name,
                count: pcs.len(),
            });
        }

        let sites = transform::plan_sites(method, &pcs);
        if let Some(site) = sites.iter().find(|s| s.layout.len() > MAX_SLOTS) {
            return Err(InstrumentError::TooManySlots {
                method: name,
                pc: site.pc,
                count: site.layout.len(),
            });
        }
        Ok(Ok(transform::rewrite(method, &sites)))
    }
}

impl Default for Instrumentor {
    fn default() -> Self {
        Self::new(InstrumentOptions::default())
    }
}

fn describe_callee(instr: &Instr) -> String {
    match instr {
        Instr::Call { callee, .. } => callee.clone(),
        Instr::CallDynamic { .. } => "<dynamic>".to_string(),
        Instr::Intrinsic { intrinsic, .. } => format!("intrinsic:{}", intrinsic.name()),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Const, IntrinsicOp, MethodBuilder, Ty};

    fn leaf() -> Method {
        let mut b = MethodBuilder::new("App", "leaf");
        let v = b.reg(Ty::Ref);
        b.intrinsic(Some(v), IntrinsicOp::Park, &[]);
        b.ret(Some(v));
        b.finish().unwrap()
    }

    fn caller(name: &str, callee: &str) -> Method {
        let mut b = MethodBuilder::new("App", name);
        let keep = b.reg(Ty::Int);
        let v = b.reg(Ty::Ref);
        b.constant(keep, Const::Int(7));
        b.call(Some(v), callee, &[]);
        b.ret(Some(keep));
        b.finish().unwrap()
    }

    fn pure() -> Method {
        let mut b = MethodBuilder::new("App", "pure");
        b.ret(None);
        b.finish().unwrap()
    }

    #[test]
    fn test_instruments_chain_and_leaves_pure_code() {
        let mut program = Program::from_methods(vec![caller("top", "App.leaf"), leaf(), pure()]).unwrap();
        let report = Instrumentor::default().instrument(&mut program).unwrap();
        assert_eq!(report.instrumented, vec!["App.top".to_string(), "App.leaf".to_string()]);
        assert_eq!(report.skip_reason("App.pure"), Some(SkipReason::NotSuspendable));

        let top = program.get("App.top").unwrap();
        let site = &top.instrumentation.as_ref().unwrap().call_sites[0];
        assert_eq!(site.callee, "App.leaf");
        assert_eq!(site.layout, vec![crate::ir::Reg(0)]);
        assert!(program.get("App.pure").unwrap().instrumentation.is_none());
    }

    #[test]
    fn test_instrumentation_is_idempotent() {
        let mut program = Program::from_methods(vec![caller("top", "App.leaf"), leaf()]).unwrap();
        let instrumentor = Instrumentor::default();
        instrumentor.instrument(&mut program).unwrap();
        let once = program.clone();
        let report = instrumentor.instrument(&mut program).unwrap();
        assert!(report.instrumented.is_empty());
        assert_eq!(report.skip_reason("App.top"), Some(SkipReason::AlreadyInstrumented));
        assert_eq!(program.methods(), once.methods());
    }

    #[test]
    fn test_synchronized_rejected_unless_allowed() {
        let mut sync = caller("locked", "App.leaf");
        sync.flags.synchronized = true;
        let mut program = Program::from_methods(vec![sync.clone(), leaf()]).unwrap();
        let err = Instrumentor::default().instrument(&mut program).unwrap_err();
        assert_eq!(err, InstrumentError::Synchronized { method: "App.locked".into() });
        assert!(program.get("App.leaf").unwrap().instrumentation.is_none());

        let options = InstrumentOptions {
            allow_monitors: true,
            ..InstrumentOptions::default()
        };
        let report = Instrumentor::new(options).instrument(&mut program).unwrap();
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_blocking_native_in_suspendable_method() {
        let mut b = MethodBuilder::new("App", "nap");
        let ms = b.reg(Ty::Int);
        b.line(4);
        b.native(None, "thread.sleep", &[ms]);
        b.intrinsic(None, IntrinsicOp::Yield, &[]);
        b.ret(None);
        let mut program = Program::from_methods(vec![b.finish().unwrap()]).unwrap();
        let err = Instrumentor::default().instrument(&mut program).unwrap_err();
        assert_eq!(
            err,
            InstrumentError::BlockingCall {
                method: "App.nap".into(),
                callee: "thread.sleep".into(),
                line: 4
            }
        );
    }

    #[test]
    fn test_native_suspendable_rejected() {
        let mut native = Method::new("App", "ext");
        native.flags.native = true;
        native.flags.suspendable = true;
        let mut program = Program::from_methods(vec![native]).unwrap();
        assert!(matches!(
            Instrumentor::default().instrument(&mut program),
            Err(InstrumentError::NativeSuspendable { .. })
        ));
    }

    #[test]
    fn test_bridges() {
        let mut b = MethodBuilder::new("App", "bridge");
        let r = b.reg(Ty::Ref);
        b.call(Some(r), "App.leaf", &[]);
        b.ret(Some(r));
        b.flags_mut().bridge = true;
        let mut program = Program::from_methods(vec![b.finish().unwrap(), leaf()]).unwrap();
        Instrumentor::default().instrument(&mut program).unwrap();
        let bridge = program.get("App.bridge").unwrap();
        assert!(bridge.instrumentation.as_ref().unwrap().transparent);
        assert_eq!(bridge.body.len(), 2);

        let mut bad = caller("bad", "App.leaf");
        bad.flags.bridge = true;
        let mut program = Program::from_methods(vec![bad, leaf()]).unwrap();
        assert!(matches!(
            Instrumentor::default().instrument(&mut program),
            Err(InstrumentError::UnsupportedShape { .. })
        ));
    }

    #[test]
    fn test_excluded_methods_are_not_rewritten() {
        let options = InstrumentOptions {
            exclude: vec!["Vendor.*".into()],
            ..InstrumentOptions::default()
        };
        let mut vendor = caller("x", "App.leaf");
        vendor.owner = "Vendor".into();
        let mut program = Program::from_methods(vec![vendor, caller("top", "Vendor.x"), leaf()]).unwrap();
        let report = Instrumentor::new(options).instrument(&mut program).unwrap();
        assert_eq!(report.skip_reason("Vendor.x"), Some(SkipReason::Excluded));
        assert!(report.instrumented.contains(&"App.top".to_string()));
    }

    #[test]
    fn test_custom_classifier_marks_external_library() {
        struct Lib;
        impl SuspendableClassifier for Lib {
            fn name(&self) -> &str {
                "lib"
            }
            fn classify(&self, target: &MethodRef<'_>) -> Classification {
                if target.qualified.starts_with("lib.") {
                    Classification::NonSuspendable
                } else {
                    Classification::Unknown
                }
            }
        }
        let mut program = Program::from_methods(vec![caller("top", "lib.Fmt.format")]).unwrap();
        let report = Instrumentor::default().with_classifier(Lib).instrument(&mut program).unwrap();
        assert!(report.instrumented.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_options_from_toml_defaults() {
        let options: InstrumentOptions = toml::from_str("allow_blocking = true").unwrap();
        assert!(options.allow_blocking);
        assert!(options.blocking_calls.contains(&"thread.sleep".to_string()));
    }
}
