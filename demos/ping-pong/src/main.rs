//! Two threads taking turns on a timer, plus one that counts down and leaves.
//!
//! ```text
//! $ cargo run -p ping-pong -- [ROUNDS] [-v]
//! ```
use log::LevelFilter;
use std::{
    process::ExitCode,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use uthread::{RuntimeBuilder, RuntimeError, logger, println, thread};

static ROUNDS: AtomicUsize = AtomicUsize::new(5);

fn ping() -> i32 {
    for _ in 0..ROUNDS.load(Ordering::Relaxed) {
        println!("ping");
        thread::pause();
    }
    0
}

fn pong() -> i32 {
    for _ in 0..ROUNDS.load(Ordering::Relaxed) {
        println!("pong");
        thread::pause();
    }
    0
}

fn countdown() -> i32 {
    for n in (1..=3).rev() {
        println!("countdown {n}");
        thread::pause();
    }
    println!("countdown done");
    3
}

fn run() -> Result<(), RuntimeError> {
    let mut runtime = RuntimeBuilder::new()
        .quantum(Duration::from_millis(200))
        .build()?;
    runtime.spawn("ping", ping)?;
    runtime.spawn("pong", pong)?;
    runtime.spawn("countdown", countdown)?;

    let report = runtime.start()?;
    for (tid, code) in report.exit_codes {
        println!("thread {tid} exited with {code:?}");
    }
    Ok(())
}

fn main() -> ExitCode {
    let mut level = LevelFilter::Info;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "-v" => level = LevelFilter::Debug,
            "-vv" => level = LevelFilter::Trace,
            rounds => match rounds.parse() {
                Ok(rounds) => ROUNDS.store(rounds, Ordering::Relaxed),
                Err(_) => {
                    eprintln!("usage: ping-pong [ROUNDS] [-v|-vv]");
                    return ExitCode::FAILURE;
                }
            },
        }
    }
    if logger::init(level).is_err() {
        return ExitCode::FAILURE;
    }

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("ping-pong: {e}");
            ExitCode::FAILURE
        }
    }
}
