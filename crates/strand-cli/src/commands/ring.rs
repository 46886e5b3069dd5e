//! `strand ring`: the ring relay benchmark.
//!
//! `fibers` relays are connected by channels into a ring. The head relay
//! adds one to the counter each time it passes; the others forward it
//! unchanged. After `rounds` full rounds the head reports `1 + rounds`.

use crate::output::StyledOutput;
use anyhow::ensure;
use std::time::Instant;
use strand_engine::ir::{BinOp, Const, IntrinsicOp, Ty};
use strand_engine::{Program, ProgramBuilder, Runtime, RuntimeConfig, Value};
use termcolor::ColorChoice;

pub fn execute(fibers: i64, rounds: i64, workers: Option<usize>, color: ColorChoice) -> anyhow::Result<()> {
    ensure!(fibers >= 1, "a ring needs at least one fiber");
    ensure!(rounds >= 0, "rounds cannot be negative");

    let mut config = RuntimeConfig::load(None)?;
    if let Some(workers) = workers {
        config.scheduler.workers = workers;
    }
    let runtime = Runtime::new(ring_program()?, config)?;

    let started = Instant::now();
    let value = runtime.run("Ring.main", vec![Value::Int(fibers), Value::Int(rounds)])?;
    let elapsed = started.elapsed();
    runtime.shutdown();

    let hops = fibers.saturating_mul(rounds);
    let mut output = StyledOutput::new(color);
    output.bold("ring relay");
    output.newline();
    output.field("fibers", &fibers.to_string());
    output.field("rounds", &rounds.to_string());
    output.field("result", &value.to_string());
    output.field("elapsed", &format!("{:.2?}", elapsed));
    if elapsed.as_secs_f64() > 0.0 {
        output.field("hops/sec", &format!("{:.0}", hops as f64 / elapsed.as_secs_f64()));
    }
    if value == Value::Int(1 + rounds) {
        output.success("ok");
    } else {
        output.warning(&format!("expected {}", 1 + rounds));
    }
    output.newline();
    output.flush();
    Ok(())
}

/// `Ring.main(fibers, rounds)` and `Ring.relay(in, out, done, step, limit)`
pub fn ring_program() -> anyhow::Result<Program> {
    let mut program = ProgramBuilder::new();

    program.define("Ring", "relay", |b| {
        let input = b.param(Ty::Ref);
        let out = b.param(Ty::Ref);
        let done = b.param(Ty::Ref);
        let step = b.param(Ty::Int);
        let limit = b.param(Ty::Int);
        let value = b.reg(Ty::Ref);
        let null = b.reg(Ty::Ref);
        let cond = b.reg(Ty::Bool);
        let closed = b.label();
        let check = b.label();
        let deliver = b.label();
        let forward = b.label();

        b.line(1).constant(null, Const::Null);
        let top = b.here();
        b.line(2).intrinsic(Some(value), IntrinsicOp::Receive, &[input]);
        b.binary(BinOp::Eq, cond, value, null);
        b.branch(cond, closed, check);
        b.bind(check);
        b.line(3).binary(BinOp::Ge, cond, value, limit);
        b.branch(cond, deliver, forward);
        b.bind(forward);
        b.line(4).binary(BinOp::Add, value, value, step);
        b.intrinsic(None, IntrinsicOp::Send, &[out, value]);
        b.jump(top);
        b.bind(deliver);
        b.line(5).intrinsic(None, IntrinsicOp::Send, &[done, value]);
        b.bind(closed);
        b.line(6).native(None, "channel.close", &[out]);
        b.ret(None);
    })?;

    program.define("Ring", "main", |b| {
        let fibers = b.param(Ty::Int);
        let rounds = b.param(Ty::Int);
        let done = b.reg(Ty::Ref);
        let first = b.reg(Ty::Ref);
        let prev = b.reg(Ty::Ref);
        let next = b.reg(Ty::Ref);
        let relay = b.reg(Ty::Ref);
        let i = b.reg(Ty::Int);
        let zero = b.reg(Ty::Int);
        let one = b.reg(Ty::Int);
        let limit = b.reg(Ty::Int);
        let never = b.reg(Ty::Int);
        let cond = b.reg(Ty::Bool);
        let result = b.reg(Ty::Ref);
        let body = b.label();
        let close_ring = b.label();

        b.line(10).native(Some(done), "channel.new", &[]);
        b.native(Some(first), "channel.new", &[]);
        b.mov(prev, first);
        b.constant(relay, Const::Method("Ring.relay".into()));
        b.constant(zero, Const::Int(0));
        b.constant(one, Const::Int(1));
        b.constant(never, Const::Int(i64::MAX));
        b.binary(BinOp::Add, limit, rounds, one);
        b.mov(i, one);
        let top = b.here();
        b.line(11).binary(BinOp::Lt, cond, i, fibers);
        b.branch(cond, body, close_ring);
        b.bind(body);
        b.line(12).native(Some(next), "channel.new", &[]);
        b.native(None, "fiber.spawn", &[relay, prev, next, done, zero, never]);
        b.mov(prev, next);
        b.binary(BinOp::Add, i, i, one);
        b.jump(top);
        b.bind(close_ring);
        b.line(13).native(None, "fiber.spawn", &[relay, prev, first, done, one, limit]);
        b.line(14).intrinsic(None, IntrinsicOp::Send, &[first, one]);
        b.line(15).intrinsic(Some(result), IntrinsicOp::Receive, &[done]);
        b.ret(Some(result));
    })?;

    Ok(program.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_engine::SchedulerConfig;
    use std::time::Duration;

    #[test]
    fn test_small_ring() {
        let config = RuntimeConfig {
            scheduler: SchedulerConfig {
                workers: 2,
                ..SchedulerConfig::default()
            },
            ..RuntimeConfig::default()
        };
        let runtime = Runtime::new(ring_program().unwrap(), config).unwrap();
        let value = runtime
            .run_timeout("Ring.main", vec![Value::Int(5), Value::Int(20)], Duration::from_secs(10))
            .unwrap();
        assert_eq!(value, Value::Int(21));
    }
}
