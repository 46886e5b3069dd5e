//! Ring relay and demo programs end to end

use std::time::{Duration, Instant};
use strand_engine::{
    flow, Channel, Fiber, FiberError, Flow, Program, Received, Runtime, RuntimeConfig, Scheduler, SchedulerConfig,
    Value,
};

const TIMEOUT: Duration = Duration::from_secs(20);

/// Forward counters from `input` to `out`, adding `step`. A counter that
/// reached `limit` goes to `done` instead and the relay closes `out`.
fn relay(
    scheduler: &Scheduler,
    input: Channel<i64>,
    out: Channel<i64>,
    done: Channel<i64>,
    step: i64,
    limit: i64,
) -> Fiber {
    let mut slot: Option<i64> = None;
    let mut finishing = false;
    scheduler
        .spawn("relay", move |_| loop {
            if slot.is_none() {
                match flow!(input.receive()) {
                    Received::Message(v) if v >= limit => {
                        slot = Some(v);
                        finishing = true;
                    }
                    Received::Message(v) => slot = Some(v + step),
                    _ => {
                        out.close();
                        return Flow::Complete(Ok(Value::Null));
                    }
                }
            }
            let target = if finishing { &done } else { &out };
            if let Err(e) = flow!(target.send(&mut slot)) {
                return Flow::Complete(Err(FiberError::Failed(e.to_string())));
            }
            if finishing {
                out.close();
                return Flow::Complete(Ok(Value::Null));
            }
        })
        .unwrap()
}

fn ring(fibers: usize, rounds: i64, workers: usize) -> i64 {
    let scheduler = Scheduler::with_workers(workers).unwrap();
    let done = Channel::unbounded();
    let first = Channel::unbounded();
    let mut prev = first.clone();
    let mut relays = Vec::new();
    for _ in 1..fibers {
        let next = Channel::unbounded();
        relays.push(relay(&scheduler, prev, next.clone(), done.clone(), 0, i64::MAX));
        prev = next;
    }
    relays.push(relay(&scheduler, prev, first.clone(), done.clone(), 1, rounds + 1));
    first.try_send(1).unwrap();

    let result = done.receive_timeout_blocking(TIMEOUT).unwrap();
    for r in &relays {
        r.join_timeout(TIMEOUT).unwrap();
    }
    let give_up = Instant::now() + TIMEOUT;
    while scheduler.fiber_count() > 0 {
        assert!(Instant::now() < give_up);
        std::thread::sleep(Duration::from_millis(1));
    }
    result.message().expect("ring produced no result")
}

// ============================================================================
// Ring
// ============================================================================

#[test]
fn test_ring_of_ten() {
    assert_eq!(ring(10, 50, 2), 51);
}

#[test]
fn test_single_fiber_ring_zero_rounds() {
    assert_eq!(ring(1, 0, 1), 1);
}

#[test]
fn test_single_fiber_ring_feeds_itself() {
    assert_eq!(ring(1, 25, 1), 26);
}

#[test]
fn test_wide_ring_on_many_workers() {
    assert_eq!(ring(200, 20, 4), 21);
}

// ============================================================================
// Demo Programs
// ============================================================================

#[test]
fn test_producer_consumer_demo() {
    let program = Program::from_json(include_str!("../../../demos/producer_consumer.json")).unwrap();
    let config = RuntimeConfig {
        scheduler: SchedulerConfig {
            workers: 2,
            ..SchedulerConfig::default()
        },
        ..RuntimeConfig::default()
    };
    let runtime = Runtime::new(program, config).unwrap();
    runtime.capture_output();
    let report = runtime.instrument_report();
    assert!(report.instrumented.contains(&"Main.main".to_string()));
    assert!(report.instrumented.contains(&"Producer.run".to_string()));

    let value = runtime.run_timeout("Main.main", vec![Value::Int(10)], TIMEOUT).unwrap();
    assert_eq!(value, Value::Int(55));
    assert_eq!(runtime.take_output(), vec!["55".to_string()]);
    runtime.shutdown();
}
