//! Scheduler behavior with many fibers, timers, joins, and cross-thread wakeups.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strand_engine::fiber::{park, park_until, sleep_until, yield_now};
use strand_engine::ir::{BinOp, Const, IntrinsicOp, Ty};
use strand_engine::{
    flow, flow_try, Channel, Fiber, FiberError, FiberState, Flow, JoinError, ProgramBuilder, Received, Runtime,
    RuntimeConfig, Scheduler, SchedulerConfig, Value,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn wait_for_state(fiber: &Fiber, state: FiberState) {
    let give_up = Instant::now() + TIMEOUT;
    while fiber.state() != state {
        assert!(Instant::now() < give_up, "fiber stuck in {:?}", fiber.state());
        std::thread::sleep(Duration::from_millis(1));
    }
}

// ============================================================================
// Native Fibers
// ============================================================================

#[test]
fn test_many_yielding_fibers_on_two_workers() {
    let scheduler = Scheduler::with_workers(2).unwrap();
    let resumes = Arc::new(AtomicUsize::new(0));
    let fibers: Vec<Fiber> = (0..200)
        .map(|i| {
            let resumes = Arc::clone(&resumes);
            let mut left = 10;
            scheduler
                .spawn(format!("yielder-{}", i), move |_| {
                    resumes.fetch_add(1, Ordering::Relaxed);
                    while left > 0 {
                        flow!(yield_now());
                        left -= 1;
                    }
                    Flow::Complete(Ok(Value::Int(i)))
                })
                .unwrap()
        })
        .collect();

    let total: i64 = fibers
        .iter()
        .map(|f| f.join_timeout(TIMEOUT).unwrap().as_int().unwrap())
        .sum();
    assert_eq!(total, (0..200).sum::<i64>());
    // one run to start plus one per yield
    assert_eq!(resumes.load(Ordering::Relaxed), 200 * 11);
    // finished fibers leave the registry just after their result is published
    let give_up = Instant::now() + TIMEOUT;
    while scheduler.fiber_count() > 0 {
        assert!(Instant::now() < give_up);
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_unpark_racing_park_is_never_lost() {
    let scheduler = Scheduler::with_workers(4).unwrap();
    for i in 0..200 {
        let fiber = scheduler
            .spawn(format!("racer-{}", i), |_| {
                flow!(park("race"));
                Flow::Complete(Ok(Value::Bool(true)))
            })
            .unwrap();
        fiber.unpark();
        assert_eq!(fiber.join_timeout(TIMEOUT).unwrap(), Value::Bool(true));
    }
}

#[test]
fn test_timer_wakes_sleeping_fiber() {
    let scheduler = Scheduler::with_workers(1).unwrap();
    let started = Instant::now();
    let deadline = started + Duration::from_millis(30);
    let fiber = scheduler
        .spawn("sleeper", move |_| {
            flow_try!(sleep_until(deadline));
            Flow::Complete(Ok(Value::Null))
        })
        .unwrap();
    fiber.join_timeout(TIMEOUT).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[test]
fn test_join_from_fiber_does_not_block_worker() {
    // one worker: if the joiner blocked it, the target could never run
    let scheduler = Scheduler::with_workers(1).unwrap();
    let deadline = Instant::now() + Duration::from_millis(20);
    let target = Fiber::new("target", move |_| {
        flow_try!(sleep_until(deadline));
        Flow::Complete(Ok(Value::Int(7)))
    });
    let joiner = {
        let target = target.clone();
        scheduler
            .spawn("joiner", move |_| match flow!(target.poll_join(None)) {
                Ok(Value::Int(v)) => Flow::Complete(Ok(Value::Int(v + 1))),
                other => Flow::Complete(Err(FiberError::Failed(format!("{:?}", other)))),
            })
            .unwrap()
    };
    scheduler.start(&target).unwrap();
    assert_eq!(joiner.join_timeout(TIMEOUT).unwrap(), Value::Int(8));
}

#[test]
fn test_cancel_parked_fiber() {
    let scheduler = Scheduler::with_workers(1).unwrap();
    let fiber = scheduler
        .spawn("forever", |_| {
            flow!(park("forever"));
            Flow::Complete(Ok(Value::Null))
        })
        .unwrap();
    wait_for_state(&fiber, FiberState::Suspended);
    fiber.cancel();
    assert!(matches!(
        fiber.join_timeout(TIMEOUT),
        Err(JoinError::Failed(FiberError::Cancelled))
    ));
}

#[test]
fn test_cancel_lands_while_fiber_runs() {
    let scheduler = Scheduler::with_workers(1).unwrap();
    let ch: Channel<i64> = Channel::unbounded();
    let fiber = scheduler
        .spawn("self-cancel", move |ctx| {
            ctx.fiber().cancel();
            match flow!(ch.receive()) {
                Received::Message(v) => Flow::Complete(Ok(Value::Int(v))),
                _ => Flow::Complete(Ok(Value::Null)),
            }
        })
        .unwrap();
    assert!(matches!(
        fiber.join_timeout(TIMEOUT),
        Err(JoinError::Failed(FiberError::Cancelled))
    ));
}

#[test]
fn test_cancel_from_thread_before_fiber_parks() {
    let scheduler = Scheduler::with_workers(2).unwrap();
    let entered = Arc::new(AtomicBool::new(false));
    let go = Arc::new(AtomicBool::new(false));
    let fiber = {
        let entered = Arc::clone(&entered);
        let go = Arc::clone(&go);
        scheduler
            .spawn("spinner", move |_| {
                entered.store(true, Ordering::Release);
                while !go.load(Ordering::Acquire) {
                    std::hint::spin_loop();
                }
                flow!(park("never-unparked"));
                Flow::Complete(Ok(Value::Null))
            })
            .unwrap()
    };
    let give_up = Instant::now() + TIMEOUT;
    while !entered.load(Ordering::Acquire) {
        assert!(Instant::now() < give_up);
        std::thread::sleep(Duration::from_millis(1));
    }
    fiber.cancel();
    go.store(true, Ordering::Release);
    assert!(matches!(
        fiber.join_timeout(TIMEOUT),
        Err(JoinError::Failed(FiberError::Cancelled))
    ));
}

#[test]
fn test_early_unpark_drops_timer_entry() {
    let scheduler = Scheduler::with_workers(1).unwrap();
    let deadline = Instant::now() + Duration::from_millis(150);
    let fiber = scheduler
        .spawn("two-parks", move |_| {
            flow!(park_until("timed", Some(deadline)));
            flow!(park("untimed"));
            Flow::Complete(Ok(Value::Int(2)))
        })
        .unwrap();

    let give_up = Instant::now() + TIMEOUT;
    while scheduler.pending_timeouts() == 0 {
        assert!(Instant::now() < give_up, "timed park never registered");
        std::thread::sleep(Duration::from_millis(1));
    }
    fiber.unpark();
    assert_eq!(scheduler.pending_timeouts(), 0);

    while !(fiber.state() == FiberState::Suspended && fiber.blocker().as_deref() == Some("untimed")) {
        assert!(Instant::now() < give_up, "second park never reached");
        std::thread::sleep(Duration::from_millis(1));
    }
    // past the first deadline; nothing may wake the untimed park
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(fiber.state(), FiberState::Suspended);

    fiber.unpark();
    assert_eq!(fiber.join_timeout(TIMEOUT).unwrap(), Value::Int(2));
}

#[test]
fn test_panic_in_fiber_is_reported() {
    let scheduler = Scheduler::with_workers(1).unwrap();
    let fiber = scheduler
        .spawn("boom", |_| -> Flow<strand_engine::fiber::FiberResult> { panic!("kaboom") })
        .unwrap();
    match fiber.join_timeout(TIMEOUT) {
        Err(JoinError::Failed(FiberError::Panicked(message))) => assert!(message.contains("kaboom")),
        other => panic!("unexpected {:?}", other),
    }
    // the worker survives
    let after = scheduler.spawn("after", |_| Flow::Complete(Ok(Value::Int(1)))).unwrap();
    assert_eq!(after.join_timeout(TIMEOUT).unwrap(), Value::Int(1));
}

#[test]
fn test_blocking_join_from_thread_while_fiber_sleeps() {
    let scheduler = Scheduler::with_workers(2).unwrap();
    let deadline = Instant::now() + Duration::from_millis(10);
    let fiber = scheduler
        .spawn("nap", move |_| {
            flow_try!(sleep_until(deadline));
            Flow::Complete(Ok(Value::from("rested")))
        })
        .unwrap();
    assert!(matches!(
        fiber.join_timeout(Duration::from_millis(1)),
        Err(JoinError::Timeout)
    ));
    assert_eq!(fiber.join_timeout(TIMEOUT).unwrap(), Value::from("rested"));
}

// ============================================================================
// Interpreted Fibers
// ============================================================================

/// `Main.main(n)` spawns `n` workers that sleep and report their index on a
/// shared channel, then sums what arrives
fn fan_in() -> ProgramBuilder {
    let mut p = ProgramBuilder::new();
    p.define("Worker", "run", |b| {
        let ch = b.param(Ty::Ref);
        let index = b.param(Ty::Int);
        let ms = b.reg(Ty::Int);
        b.constant(ms, Const::Int(5));
        b.intrinsic(None, IntrinsicOp::Sleep, &[ms]);
        b.intrinsic(None, IntrinsicOp::Send, &[ch, index]);
        b.ret(None);
    })
    .unwrap();
    p.define("Main", "main", |b| {
        let n = b.param(Ty::Int);
        let ch = b.reg(Ty::Ref);
        let worker = b.reg(Ty::Ref);
        let i = b.reg(Ty::Int);
        let count = b.reg(Ty::Int);
        let one = b.reg(Ty::Int);
        let sum = b.reg(Ty::Int);
        let v = b.reg(Ty::Ref);
        let cond = b.reg(Ty::Bool);
        let spawn = b.label();
        let collect_top = b.label();
        let collect = b.label();
        let done = b.label();

        b.native(Some(ch), "channel.new", &[]);
        b.constant(worker, Const::Method("Worker.run".into()));
        b.constant(one, Const::Int(1));
        let spawn_top = b.here();
        b.binary(BinOp::Lt, cond, i, n);
        b.branch(cond, spawn, collect_top);
        b.bind(spawn);
        b.native(None, "fiber.spawn", &[worker, ch, i]);
        b.binary(BinOp::Add, i, i, one);
        b.jump(spawn_top);
        b.bind(collect_top);
        b.binary(BinOp::Lt, cond, count, n);
        b.branch(cond, collect, done);
        b.bind(collect);
        b.intrinsic(Some(v), IntrinsicOp::Receive, &[ch]);
        b.binary(BinOp::Add, sum, sum, v);
        b.binary(BinOp::Add, count, count, one);
        b.jump(collect_top);
        b.bind(done);
        b.ret(Some(sum));
    })
    .unwrap();
    p
}

#[test]
fn test_interpreted_fan_in() {
    let config = RuntimeConfig {
        scheduler: SchedulerConfig {
            workers: 3,
            ..SchedulerConfig::default()
        },
        ..RuntimeConfig::default()
    };
    let runtime = Runtime::new(fan_in().finish().unwrap(), config).unwrap();
    let value = runtime.run_timeout("Main.main", vec![Value::Int(50)], TIMEOUT).unwrap();
    assert_eq!(value, Value::Int((0..50).sum()));
    runtime.shutdown();
}
