//! Runs cooperative runtimes end to end.
mod common;

use common::{Counters, Trace};
use std::sync::OnceLock;
use uthread::{
    Event, MAX_THREADS, RuntimeBuilder, RuntimeError,
    thread::{self, Current, ThreadState, Tid},
};

/// Tests threads that hand over the CPU with `yield_now`.
///
/// This test ensures that:
/// - Yielding threads run in spawn order, one step at a time.
/// - The value returned by each entry becomes its exit code.
#[test]
fn yields_interleave_in_spawn_order() {
    static TRACE: Trace = Trace::new();

    let mut runtime = RuntimeBuilder::new().cooperative().build().unwrap();
    for i in 0..3 {
        runtime
            .spawn("yielder", move || {
                for _ in 0..3 {
                    TRACE.push(i);
                    Current::yield_now();
                }
                10 + i as i32
            })
            .unwrap();
    }
    let report = runtime.start().unwrap();

    assert_eq!(TRACE.snapshot(), [0, 1, 2, 0, 1, 2, 0, 1, 2]);
    let codes: Vec<_> = report.exit_codes.iter().map(|(_, code)| *code).collect();
    assert_eq!(codes, [Some(10), Some(11), Some(12)]);
}

/// Tests a thread that yields while nothing else is ready.
///
/// This test ensures that:
/// - The dispatcher keeps the lone thread running and reports idling.
#[test]
fn lone_yield_returns_immediately() {
    static IDLE: Counters<1> = Counters::new();

    fn hook(event: &Event) {
        if *event == Event::Idle {
            IDLE.bump(0);
        }
    }

    let mut runtime = RuntimeBuilder::new()
        .cooperative()
        .on_event(hook)
        .build()
        .unwrap();
    runtime
        .spawn("alone", || {
            for _ in 0..100 {
                Current::yield_now();
            }
            0
        })
        .unwrap();
    let report = runtime.start().unwrap();
    assert_eq!(IDLE.get(0), 100);
    assert_eq!(report.retired, 1);
}

/// Tests that a panicking thread does not take the runtime down.
///
/// This test ensures that:
/// - The panic is contained and becomes exit code -1.
/// - Other threads run to completion.
#[test]
fn panic_becomes_exit_code() {
    let mut runtime = RuntimeBuilder::new()
        .cooperative()
        .stack_size(0x40000)
        .build()
        .unwrap();
    runtime.spawn("faulty", || panic!("boom")).unwrap();
    runtime.spawn("healthy", || 7).unwrap();
    let report = runtime.start().unwrap();

    let codes: Vec<_> = report.exit_codes.iter().map(|(_, code)| *code).collect();
    assert_eq!(codes, [Some(-1), Some(7)]);
    assert_eq!(report.retired, 2);
}

/// Tests explicit exits.
///
/// This test ensures that:
/// - `Current::exit` finishes the thread with the given code.
#[test]
fn explicit_exit() {
    let mut runtime = RuntimeBuilder::new().cooperative().build().unwrap();
    runtime.spawn("exiter", || Current::exit(42)).unwrap();
    let report = runtime.start().unwrap();
    assert_eq!(report.exit_codes[0].1, Some(42));
}

/// Tests the capacity limit of a runtime.
///
/// This test ensures that:
/// - Spawning beyond the usable queue capacity fails with `QueueFull`.
/// - A runtime filled to capacity runs every thread.
#[test]
fn spawn_beyond_capacity() {
    static DONE: Counters<1> = Counters::new();

    let mut runtime = RuntimeBuilder::new()
        .cooperative()
        .stack_size(thread::MIN_STACK_SIZE)
        .build()
        .unwrap();
    for _ in 0..MAX_THREADS {
        runtime
            .spawn("filler", || {
                DONE.bump(0);
                0
            })
            .unwrap();
    }
    assert_eq!(
        runtime.spawn("overflow", || 0),
        Err(RuntimeError::QueueFull)
    );
    let report = runtime.start().unwrap();
    assert_eq!(DONE.get(0), MAX_THREADS);
    assert_eq!(report.retired, MAX_THREADS);
}

/// Tests state queries from running threads.
///
/// This test ensures that:
/// - A thread observes itself as running and a peer that never ran as not
///   started.
/// - A yielded thread is observed as suspended.
/// - A retired thread is no longer known.
#[test]
fn states_seen_from_threads() {
    static PEER: OnceLock<Tid> = OnceLock::new();
    static FIRST: OnceLock<Tid> = OnceLock::new();

    let mut runtime = RuntimeBuilder::new().cooperative().build().unwrap();
    let first = runtime
        .spawn("first", || {
            let me = Current::get_tid();
            let peer = *PEER.get().unwrap();
            assert_eq!(thread::get_state_by_tid(me), Ok(ThreadState::Running));
            assert_eq!(thread::get_state_by_tid(peer), Ok(ThreadState::NotStarted));
            Current::yield_now();
            assert_eq!(
                thread::get_state_by_tid(peer),
                Err(RuntimeError::NoSuchThread)
            );
            0
        })
        .unwrap();
    let peer = runtime
        .spawn("peer", || {
            let first = *FIRST.get().unwrap();
            assert_eq!(thread::get_state_by_tid(first), Ok(ThreadState::Suspended));
            0
        })
        .unwrap();
    FIRST.set(first).unwrap();
    PEER.set(peer).unwrap();

    assert_eq!(
        thread::get_state_by_tid(first),
        Err(RuntimeError::NoSuchThread)
    );
    let report = runtime.start().unwrap();
    let codes: Vec<_> = report.exit_codes.iter().map(|(_, code)| *code).collect();
    assert_eq!(codes, [Some(0), Some(0)]);
}

/// Tests starting a runtime from a thread of another runtime.
///
/// This test ensures that:
/// - The nested start is rejected with `AlreadyRunning`.
#[test]
fn nested_start_is_rejected() {
    let mut runtime = RuntimeBuilder::new().cooperative().build().unwrap();
    runtime
        .spawn("outer", || {
            let _pin = thread::Thread::pin();
            let nested = RuntimeBuilder::new().cooperative().build().unwrap();
            match nested.start() {
                Err(RuntimeError::AlreadyRunning) => 0,
                _ => 1,
            }
        })
        .unwrap();
    let report = runtime.start().unwrap();
    assert_eq!(report.exit_codes[0].1, Some(0));
}

/// Tests spawning an entry closure that does not fit on its stack.
///
/// This test ensures that:
/// - `spawn` rejects the closure instead of writing past the stack.
/// - The rejected spawn takes no thread slot and the runtime still runs.
#[test]
fn oversized_entry_is_rejected() {
    let mut runtime = RuntimeBuilder::new().cooperative().build().unwrap();
    let big = [7u8; 0x11000];
    assert!(matches!(
        runtime.spawn("big", move || big[0x10fff] as i32),
        Err(RuntimeError::InvalidConfiguration(_))
    ));

    let tid = runtime.spawn("small", || 5).unwrap();
    assert_eq!(tid.index(), 0);
    let report = runtime.start().unwrap();
    assert_eq!(report.exit_codes, [(tid, Some(5))]);
    assert_eq!(report.retired, 1);
}
