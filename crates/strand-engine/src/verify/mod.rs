//! Suspension-time verification
//!
//! When a fiber suspends, every frame between the fiber boundary and the
//! suspending operation must be able to replay: it is runtime-internal,
//! waived, or instrumented with a recorded call site at the pc it is
//! suspended at. A frame that fails this check re-executes from its first
//! instruction on resume, which is a silent correctness bug.
//!
//! The check is off by default. `warn` logs each distinct offending stack
//! once and lets the fiber continue; `fail` aborts the fiber with the
//! report. Thread-blocking natives called on a fiber are reported through
//! the same mode.

use crate::ir::{matches_pattern, Method};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Verification strictness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    /// No checks
    #[default]
    Off,
    /// Log and continue
    Warn,
    /// Abort the offending fiber
    Fail,
}

impl FromStr for VerifyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "0" | "false" => Ok(VerifyMode::Off),
            "warn" => Ok(VerifyMode::Warn),
            "fail" | "strict" | "1" | "true" => Ok(VerifyMode::Fail),
            other => Err(format!("unknown verification mode `{}` (expected off, warn, or fail)", other)),
        }
    }
}

impl fmt::Display for VerifyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VerifyMode::Off => "off",
            VerifyMode::Warn => "warn",
            VerifyMode::Fail => "fail",
        })
    }
}

/// Verification settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Strictness
    pub mode: VerifyMode,
    /// Methods allowed on a suspending stack without instrumentation
    pub waivers: Vec<String>,
}

/// Fatal verification outcome
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    /// Frames that cannot replay were found on a suspending stack
    #[error("{0}")]
    Uninstrumented(VerifyReport),

    /// A thread-blocking native ran on a fiber
    #[error("thread-blocking native {native} called on a fiber\n{report}")]
    BlockingCall {
        /// Native name
        native: String,
        /// Stack at the call
        report: VerifyReport,
    },
}

/// One active method frame, outermost first in a trace
#[derive(Debug, Clone, Copy)]
pub struct TraceFrame<'a> {
    /// Executing method
    pub method: &'a Method,
    /// Instruction the frame is at
    pub pc: usize,
}

/// Verdict for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Runtime code
    Internal,
    /// Listed in the waivers
    Waived,
    /// Instrumented and suspended at a recorded call site
    Verified,
    /// The method carries no instrumentation
    UninstrumentedMethod,
    /// The method is instrumented but this call site is not
    UninstrumentedCallSite,
}

impl FrameStatus {
    /// Whether the frame can replay
    pub fn is_ok(self) -> bool {
        !matches!(self, FrameStatus::UninstrumentedMethod | FrameStatus::UninstrumentedCallSite)
    }

    /// Report marker: `!!` for a method, `!` for a call site
    pub fn marker(self) -> &'static str {
        match self {
            FrameStatus::UninstrumentedMethod => "!!",
            FrameStatus::UninstrumentedCallSite => "!",
            _ => "",
        }
    }
}

/// Verdict for one frame, with location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameReport {
    /// Qualified method name
    pub method: String,
    /// Instruction index
    pub pc: usize,
    /// Source line
    pub line: u32,
    /// Verdict
    pub status: FrameStatus,
}

/// Verdicts for a whole stack
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Innermost frame first
    pub frames: Vec<FrameReport>,
}

impl VerifyReport {
    /// Whether every frame can replay
    pub fn is_ok(&self) -> bool {
        self.frames.iter().all(|f| f.status.is_ok())
    }

    /// Frames that cannot replay
    pub fn offending(&self) -> impl Iterator<Item = &FrameReport> {
        self.frames.iter().filter(|f| !f.status.is_ok())
    }
}

impl fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            writeln!(f, "all frames instrumented:")?;
        } else {
            writeln!(f, "uninstrumented frames on a suspending fiber (!! = method, ! = call site):")?;
        }
        for frame in &self.frames {
            writeln!(
                f,
                "  {:<2} at {} (line {}, pc {})",
                frame.status.marker(),
                frame.method,
                frame.line,
                frame.pc
            )?;
        }
        write!(f, "     at <fiber boundary>")
    }
}

/// Checks traces against a [`VerifyConfig`]
#[derive(Debug, Default)]
pub struct Verifier {
    config: VerifyConfig,
    warned: Mutex<FxHashSet<String>>,
}

impl Verifier {
    /// Create a verifier
    pub fn new(config: VerifyConfig) -> Self {
        Self {
            config,
            warned: Mutex::new(FxHashSet::default()),
        }
    }

    /// Strictness
    pub fn mode(&self) -> VerifyMode {
        self.config.mode
    }

    /// Whether `qualified` is waived
    pub fn is_waived(&self, qualified: &str) -> bool {
        self.config.waivers.iter().any(|p| matches_pattern(p, qualified))
    }

    /// Classify every frame of `trace` regardless of mode
    pub fn inspect(&self, trace: &[TraceFrame<'_>]) -> VerifyReport {
        let frames = trace
            .iter()
            .rev()
            .map(|frame| {
                let method = frame.method;
                let name = method.qualified_name();
                let status = if method.is_runtime_internal() {
                    FrameStatus::Internal
                } else if self.is_waived(&name) {
                    FrameStatus::Waived
                } else {
                    match &method.instrumentation {
                        None => FrameStatus::UninstrumentedMethod,
                        Some(inst) if inst.transparent || inst.call_site(frame.pc).is_some() => {
                            FrameStatus::Verified
                        }
                        Some(_) => FrameStatus::UninstrumentedCallSite,
                    }
                };
                FrameReport {
                    method: name,
                    pc: frame.pc,
                    line: method.line_at(frame.pc),
                    status,
                }
            })
            .collect();
        VerifyReport { frames }
    }

    /// Check a suspending stack. Returns whether all frames are fine; with
    /// `fail` a bad stack is an error instead.
    pub fn check_suspension(&self, trace: &[TraceFrame<'_>]) -> Result<bool, VerifyError> {
        if self.config.mode == VerifyMode::Off {
            return Ok(true);
        }
        let report = self.inspect(trace);
        if report.is_ok() {
            return Ok(true);
        }
        match self.config.mode {
            VerifyMode::Fail => Err(VerifyError::Uninstrumented(report)),
            _ => {
                let text = report.to_string();
                if self.warned.lock().insert(text.clone()) {
                    tracing::warn!("{}", text);
                }
                Ok(false)
            }
        }
    }

    /// Check a thread-blocking native called on a fiber
    pub fn check_blocking(&self, native: &str, trace: &[TraceFrame<'_>]) -> Result<bool, VerifyError> {
        if self.config.mode == VerifyMode::Off {
            return Ok(true);
        }
        let report = self.inspect(trace);
        if let Some(caller) = report.frames.first() {
            if caller.status == FrameStatus::Internal || caller.status == FrameStatus::Waived {
                return Ok(true);
            }
        }
        match self.config.mode {
            VerifyMode::Fail => Err(VerifyError::BlockingCall {
                native: native.to_string(),
                report,
            }),
            _ => {
                let key = format!("{}@{}", native, report.frames.first().map_or("", |f| f.method.as_str()));
                if self.warned.lock().insert(key) {
                    tracing::warn!(native, "thread-blocking native called on a fiber\n{}", report);
                }
                Ok(false)
            }
        }
    }
}
