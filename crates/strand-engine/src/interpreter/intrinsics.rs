//! Suspending operations
//!
//! Each intrinsic either completes or suspends. After a resume the
//! interpreter re-executes the same intrinsic; the resume token left on the
//! fiber lets a park that was already satisfied return at once, and timed
//! operations read their original deadline back from the state register.
//!
//! Outside a fiber the same operations block the calling thread.

use super::ExecError;
use crate::channel::{Received, SendError};
use crate::fiber::{park, sleep_until, yield_now, Fiber, Flow, JoinError};
use crate::ir::IntrinsicOp;
use crate::value::Value;
use once_cell::sync::Lazy;
use std::time::{Duration, Instant};

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Deadline kept in a state register: 0 means none yet
fn load_deadline(state: &Value) -> Option<Instant> {
    match state {
        Value::Int(n) if *n > 0 => Some(*EPOCH + Duration::from_nanos((*n - 1) as u64)),
        _ => None,
    }
}

fn store_deadline(deadline: Instant) -> Value {
    let nanos = deadline.saturating_duration_since(*EPOCH).as_nanos();
    Value::Int(nanos.min(i64::MAX as u128 - 1) as i64 + 1)
}

/// Resolve the deadline of a timed operation, recording it in `state` on
/// first execution
fn deadline_for(state: &mut Value, millis: &Value) -> Result<Instant, ExecError> {
    if let Some(deadline) = load_deadline(state) {
        return Ok(deadline);
    }
    let ms = millis.as_int().ok_or_else(|| ExecError::type_error("int", millis))?;
    let deadline = Instant::now() + Duration::from_millis(ms.max(0) as u64);
    *state = store_deadline(deadline);
    Ok(deadline)
}

fn arg(op: IntrinsicOp, args: &[Value], index: usize) -> Result<&Value, ExecError> {
    args.get(index)
        .ok_or_else(|| ExecError::Type(format!("{} expects at least {} arguments", op.name(), index + 1)))
}

/// Execute `op`. `state` is the operation's state register, if it has one;
/// it is cleared when the operation completes.
pub(super) fn execute(op: IntrinsicOp, args: &[Value], state: Option<&mut Value>) -> Flow<Result<Value, ExecError>> {
    let mut scratch = Value::Null;
    let state = state.unwrap_or(&mut scratch);
    let result = crate::flow!(run(op, args, state));
    *state = Value::Int(0);
    Flow::Complete(result)
}

fn run(op: IntrinsicOp, args: &[Value], state: &mut Value) -> Flow<Result<Value, ExecError>> {
    match op {
        IntrinsicOp::Park => {
            let blocker = match args.first() {
                Some(Value::Str(s)) => s.to_string(),
                _ => "park".to_string(),
            };
            crate::flow!(park(&blocker));
            Flow::Complete(Ok(Value::Null))
        }
        IntrinsicOp::Yield => {
            crate::flow!(yield_now());
            Flow::Complete(Ok(Value::Null))
        }
        IntrinsicOp::Sleep => {
            let deadline = match arg(op, args, 0).and_then(|ms| deadline_for(state, ms)) {
                Ok(deadline) => deadline,
                Err(e) => return Flow::Complete(Err(e)),
            };
            if Fiber::current().is_none() {
                std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
                return Flow::Complete(Ok(Value::Null));
            }
            match crate::flow!(sleep_until(deadline)) {
                Ok(()) => Flow::Complete(Ok(Value::Null)),
                Err(e) => Flow::Complete(Err(ExecError::Native {
                    name: "sleep".to_string(),
                    message: e.to_string(),
                })),
            }
        }
        IntrinsicOp::Send => {
            let (channel, message) = match (arg(op, args, 0), arg(op, args, 1)) {
                (Ok(ch), Ok(message)) => match ch.as_channel() {
                    Some(channel) => (channel, message.clone()),
                    None => return Flow::Complete(Err(ExecError::type_error("channel", ch))),
                },
                (Err(e), _) | (_, Err(e)) => return Flow::Complete(Err(e)),
            };
            let mut slot = Some(message);
            match crate::flow!(channel.send(&mut slot)) {
                Ok(()) => Flow::Complete(Ok(Value::Bool(true))),
                Err(SendError::Closed) => Flow::Complete(Ok(Value::Bool(false))),
                Err(SendError::CapacityExceeded(capacity)) => Flow::Complete(Err(ExecError::Thrown(Value::from(
                    format!("channel capacity of {} exceeded", capacity),
                )))),
                Err(e) => Flow::Complete(Err(ExecError::Native {
                    name: "send".to_string(),
                    message: e.to_string(),
                })),
            }
        }
        IntrinsicOp::Receive | IntrinsicOp::ReceiveTimeout => {
            let ch = match arg(op, args, 0) {
                Ok(ch) => ch,
                Err(e) => return Flow::Complete(Err(e)),
            };
            let Some(channel) = ch.as_channel() else {
                return Flow::Complete(Err(ExecError::type_error("channel", ch)));
            };
            let deadline = if op == IntrinsicOp::ReceiveTimeout {
                match arg(op, args, 1).and_then(|ms| deadline_for(state, ms)) {
                    Ok(deadline) => Some(deadline),
                    Err(e) => return Flow::Complete(Err(e)),
                }
            } else {
                None
            };
            match crate::flow!(channel.receive_until(deadline)) {
                Received::Message(message) => Flow::Complete(Ok(message)),
                Received::Closed | Received::TimedOut => Flow::Complete(Ok(Value::Null)),
            }
        }
        IntrinsicOp::Join => {
            let target = match arg(op, args, 0) {
                Ok(target) => target,
                Err(e) => return Flow::Complete(Err(e)),
            };
            let Some(joined) = target.as_fiber() else {
                return Flow::Complete(Err(ExecError::type_error("fiber", target)));
            };
            let deadline = match args.get(1) {
                Some(ms) => match deadline_for(state, ms) {
                    Ok(deadline) => Some(deadline),
                    Err(e) => return Flow::Complete(Err(e)),
                },
                None => None,
            };
            match crate::flow!(joined.poll_join(deadline)) {
                Ok(value) => Flow::Complete(Ok(value)),
                Err(JoinError::Timeout) => Flow::Complete(Ok(Value::Null)),
                Err(e) => Flow::Complete(Err(ExecError::JoinFailed(e.to_string()))),
            }
        }
    }
}
