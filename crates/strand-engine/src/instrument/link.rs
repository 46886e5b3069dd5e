//! Load-time link check
//!
//! Run once before a program executes. Every static callee must resolve,
//! every native must be registered, and an instrumented caller must carry
//! call-site metadata for each call into instrumented code; a caller without
//! it would replay the callee from the wrong place.

use crate::ir::{Instr, IrError, Program};
use thiserror::Error;

/// Fatal linking problems
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// A static call names a method the program does not have
    #[error("{caller} calls unknown method {callee}")]
    UnresolvedCallee {
        /// Calling method
        caller: String,
        /// Missing callee
        callee: String,
    },

    /// A static call targets a method without a body
    #[error("{caller} calls {callee}, which has no body")]
    NoBody {
        /// Calling method
        caller: String,
        /// Abstract or native callee
        callee: String,
    },

    /// A native call names an unregistered native
    #[error("{caller} calls unknown native {name}")]
    UnknownNative {
        /// Calling method
        caller: String,
        /// Missing native
        name: String,
    },

    /// Instrumented caller, instrumented callee, no call-site record
    #[error("{caller} calls instrumented {callee} at instruction {pc} without call-site metadata")]
    MissingCallSite {
        /// Calling method
        caller: String,
        /// Instruction index
        pc: usize,
        /// Instrumented callee
        callee: String,
    },

    /// The program is malformed
    #[error(transparent)]
    Malformed(#[from] IrError),
}

/// Check `program` against the natives accepted by `is_native`
pub fn link(program: &Program, is_native: impl Fn(&str) -> bool) -> Result<(), LinkError> {
    program.validate()?;
    for method in program.methods().iter().filter(|m| m.has_body()) {
        let caller = method.qualified_name();
        let sites = method.instrumentation.as_ref().filter(|i| !i.transparent);
        for (pc, instr) in method.body.iter().enumerate() {
            match instr {
                Instr::Call { callee, .. } => {
                    let Some(target) = program.get(callee) else {
                        return Err(LinkError::UnresolvedCallee {
                            caller,
                            callee: callee.clone(),
                        });
                    };
                    if !target.has_body() {
                        return Err(LinkError::NoBody {
                            caller,
                            callee: callee.clone(),
                        });
                    }
                    if let Some(sites) = sites {
                        if target.is_instrumented() && sites.call_site(pc).is_none() {
                            return Err(LinkError::MissingCallSite {
                                caller,
                                pc,
                                callee: callee.clone(),
                            });
                        }
                    }
                }
                Instr::Native { name, .. } if !is_native(name) => {
                    return Err(LinkError::UnknownNative {
                        caller,
                        name: name.clone(),
                    });
                }
                Instr::Intrinsic { intrinsic, .. } => {
                    if let Some(sites) = sites {
                        if sites.call_site(pc).is_none() {
                            return Err(LinkError::MissingCallSite {
                                caller,
                                pc,
                                callee: format!("intrinsic:{}", intrinsic.name()),
                            });
                        }
                    }
                }
                _ => {}
            }
        }
    }
    tracing::debug!(methods = program.len(), "program linked");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::Instrumentor;
    use crate::ir::{IntrinsicOp, Method, MethodBuilder};

    fn call(owner: &str, name: &str, callee: &str) -> Method {
        let mut b = MethodBuilder::new(owner, name);
        b.call(None, callee, &[]);
        b.ret(None);
        b.finish().unwrap()
    }

    fn park(owner: &str, name: &str) -> Method {
        let mut b = MethodBuilder::new(owner, name);
        b.intrinsic(None, IntrinsicOp::Park, &[]);
        b.ret(None);
        b.finish().unwrap()
    }

    #[test]
    fn test_unresolved_callee() {
        let program = Program::from_methods(vec![call("A", "f", "A.missing")]).unwrap();
        assert_eq!(
            link(&program, |_| true),
            Err(LinkError::UnresolvedCallee {
                caller: "A.f".into(),
                callee: "A.missing".into()
            })
        );
    }

    #[test]
    fn test_unknown_native() {
        let mut b = MethodBuilder::new("A", "f");
        b.native(None, "nope", &[]);
        b.ret(None);
        let program = Program::from_methods(vec![b.finish().unwrap()]).unwrap();
        assert!(matches!(link(&program, |n| n == "print"), Err(LinkError::UnknownNative { .. })));
    }

    #[test]
    fn test_instrumented_program_links() {
        let mut program = Program::from_methods(vec![call("A", "f", "A.g"), park("A", "g")]).unwrap();
        Instrumentor::default().instrument(&mut program).unwrap();
        link(&program, |_| true).unwrap();
    }

    #[test]
    fn test_missing_call_site_detected() {
        let mut program = Program::from_methods(vec![call("A", "f", "A.g"), park("A", "g")]).unwrap();
        Instrumentor::default().instrument(&mut program).unwrap();
        let f = program.get_mut("A.f").unwrap();
        if let Some(inst) = f.instrumentation.as_mut() {
            inst.call_sites.clear();
        }
        assert!(matches!(
            link(&program, |_| true),
            Err(LinkError::MissingCallSite { pc: 1, .. })
        ));
    }
}
