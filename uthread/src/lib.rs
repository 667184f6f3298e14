//! # uthread: a user-level thread runtime
//!
//! **uthread** multiplexes many threads of execution onto a single OS thread.
//! Each thread owns a stack and runs until its quantum expires, it yields, or
//! it finishes; the dispatcher then captures its context and resumes the
//! next thread from a round-robin ready queue.
//!
//! ## Overview
//!
//! A runtime is configured with a [`RuntimeBuilder`], populated with
//! [`Runtime::spawn`], and driven by [`Runtime::start`], which returns once
//! every thread has finished.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use uthread::{RuntimeBuilder, thread::Current};
//!
//! let mut runtime = RuntimeBuilder::new()
//!     .quantum(Duration::from_millis(5))
//!     .build()
//!     .unwrap();
//! for name in ["ping", "pong"] {
//!     runtime
//!         .spawn(name, || {
//!             for _ in 0..3 {
//!                 uthread::println!("{} runs", Current::get_tid());
//!                 Current::yield_now();
//!             }
//!             0
//!         })
//!         .unwrap();
//! }
//! let report = runtime.start().unwrap();
//! assert_eq!(report.retired, 2);
//! ```
//!
//! ## Project Structure
//!
//! - [`queue`]: the fixed-capacity ring buffer holding ready threads.
//! - [`thread`]: thread control blocks, context switching, and the
//!   dispatcher.
//! - [`logger`]: a [`log`] backend that is safe to use from the timer
//!   interrupt.
//!
//! The host-facing pieces (interrupt masking, the quantum timer, stack
//! mappings, the console) live in the `abyss` crate.
//!
//! ## Implementation Notes
//!
//! Preemption is delivered as a signal on the OS thread running the
//! runtime, and the dispatcher runs inside the signal handler. Code running
//! on a thread must therefore treat the timer like an interrupt:
//! - Non-reentrant services such as the global allocator or `std::io` must
//!   only be used while the thread is pinned with [`thread::Thread::pin`].
//! - [`println!`] and the [`logger`] pin the thread by themselves.
//!
//! Each thread is assigned a fixed stack of [`RuntimeBuilder::stack_size`]
//! bytes, guarded by an inaccessible page. **Avoid declaring large data
//! structures on the stack.**
#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("uthread only supports x86_64 Linux hosts.");

mod interrupt;
pub mod logger;
pub mod queue;
pub mod thread;

pub use abyss::{print, println, timer::Clock};
pub use thread::scheduler::Event;
use abyss::interrupt::InterruptGuard;
use core::time::Duration;
use thread::{
    Thread, ThreadState, Tid,
    scheduler::{Cause, Dispatcher},
};

/// Number of slots of the ready queue.
///
/// One slot always stays free, so at most [`MAX_THREADS`] threads exist.
pub const QUEUE_CAPACITY: usize = 50;
/// Maximum number of threads of a runtime.
pub const MAX_THREADS: usize = QUEUE_CAPACITY - 1;
/// Default length of a quantum.
pub const DEFAULT_QUANTUM: Duration = Duration::from_millis(10);

/// Represents errors of the runtime.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RuntimeError {
    /// The ready queue has no free slot. (EAGAIN)
    QueueFull,
    /// A thread stack could not be mapped; carries the errno. (ENOMEM)
    NoMemory(i32),
    /// The quantum timer could not be set up; carries the errno.
    TimerUnavailable(i32),
    /// A runtime is already running on the calling OS thread. (EBUSY)
    AlreadyRunning,
    /// The configuration is invalid. (EINVAL)
    InvalidConfiguration(&'static str),
    /// A context operation does not match the state of its thread.
    MismatchedContextOperation {
        /// The thread.
        tid: Tid,
        /// Its state when the operation was requested.
        state: ThreadState,
    },
    /// No live thread has this id. (ESRCH)
    NoSuchThread,
    /// The stack magic of a thread was overwritten.
    StackOverflow(Tid),
}

impl core::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RuntimeError::QueueFull => write!(f, "ready queue is full"),
            RuntimeError::NoMemory(errno) => write!(f, "cannot map thread stack (errno {errno})"),
            RuntimeError::TimerUnavailable(errno) => {
                write!(f, "cannot set up the quantum timer (errno {errno})")
            }
            RuntimeError::AlreadyRunning => {
                write!(f, "a runtime is already running on this OS thread")
            }
            RuntimeError::InvalidConfiguration(why) => write!(f, "invalid configuration: {why}"),
            RuntimeError::MismatchedContextOperation { tid, state } => {
                write!(f, "mismatched context operation on thread {tid} in {state:?}")
            }
            RuntimeError::NoSuchThread => write!(f, "no such thread"),
            RuntimeError::StackOverflow(tid) => write!(f, "stack overflow in thread {tid}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<queue::QueueFull> for RuntimeError {
    fn from(_: queue::QueueFull) -> Self {
        RuntimeError::QueueFull
    }
}

/// A builder for runtime configuration settings.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use uthread::{Clock, RuntimeBuilder};
///
/// let runtime = RuntimeBuilder::new()
///     .stack_size(0x20000)
///     .quantum(Duration::from_millis(2))
///     .clock(Clock::Monotonic)
///     .build();
/// assert!(runtime.is_ok());
/// ```
#[derive(Clone, Copy, Debug)]
pub struct RuntimeBuilder {
    stack_size: usize,
    quantum: Option<Duration>,
    clock: Clock,
    hook: Option<fn(&Event)>,
}

impl RuntimeBuilder {
    /// Creates a builder with the defaults: [`thread::STACK_SIZE`] bytes of
    /// stack and a [`DEFAULT_QUANTUM`] measured on [`Clock::Monotonic`].
    pub fn new() -> Self {
        Self {
            stack_size: thread::STACK_SIZE,
            quantum: Some(DEFAULT_QUANTUM),
            clock: Clock::Monotonic,
            hook: None,
        }
    }

    /// Sets the stack size of every thread, rounded up to whole pages.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Sets the length of a quantum and enables preemption.
    pub fn quantum(mut self, quantum: Duration) -> Self {
        self.quantum = Some(quantum);
        self
    }

    /// Disables preemption: threads only switch on yield and exit.
    pub fn cooperative(mut self) -> Self {
        self.quantum = None;
        self
    }

    /// Sets the clock quanta are measured on.
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Installs a hook that observes every scheduling [`Event`].
    pub fn on_event(mut self, hook: fn(&Event)) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Validates the configuration and creates an empty runtime.
    ///
    /// # Returns
    /// [`RuntimeError::InvalidConfiguration`] if the stack is smaller than
    /// [`thread::MIN_STACK_SIZE`] or the quantum is zero.
    pub fn build(self) -> Result<Runtime, RuntimeError> {
        if self.stack_size < thread::MIN_STACK_SIZE {
            return Err(RuntimeError::InvalidConfiguration("stack size too small"));
        }
        if self.quantum == Some(Duration::ZERO) {
            return Err(RuntimeError::InvalidConfiguration("quantum must not be zero"));
        }
        Ok(Runtime {
            dispatcher: Box::new(Dispatcher::new(self.hook)),
            config: self,
            spawned: 0,
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The outcome of [`Runtime::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// The exit code of every thread in spawn order; `None` for a thread
    /// that never finished.
    pub exit_codes: Vec<(Tid, Option<i32>)>,
    /// Number of threads whose resources were released.
    pub retired: usize,
}

/// A configured runtime that has not started yet.
pub struct Runtime {
    dispatcher: Box<Dispatcher>,
    config: RuntimeBuilder,
    spawned: usize,
}

impl Runtime {
    /// Creates a thread named `name` that runs `entry`.
    ///
    /// The thread is queued behind the threads spawned before it and starts
    /// when [`Runtime::start`] reaches it. Its exit code is the value
    /// returned by `entry`, or -1 if `entry` panics.
    ///
    /// # Returns
    /// - The [`Tid`] of the new thread.
    /// - [`RuntimeError::QueueFull`] if [`MAX_THREADS`] threads exist.
    /// - [`RuntimeError::NoMemory`] if the stack could not be mapped.
    pub fn spawn<F>(&mut self, name: &str, entry: F) -> Result<Tid, RuntimeError>
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        let stack_size = self.config.stack_size;
        let tid = self
            .dispatcher
            .spawn(|tid| Thread::new(tid, name, stack_size, entry))?;
        self.spawned += 1;
        Ok(tid)
    }

    /// Runs every spawned thread to completion on the calling OS thread.
    ///
    /// A preemptive runtime takes over the process-wide disposition of the
    /// timer signal (`SIGALRM`) while it runs. The disposition found by the
    /// first of the runtimes running at once is restored when the last one
    /// stops.
    ///
    /// # Returns
    /// - A [`RunReport`] once the last thread has finished.
    /// - [`RuntimeError::AlreadyRunning`] if called from a thread of another
    ///   runtime.
    /// - [`RuntimeError::TimerUnavailable`] if preemption could not be set up.
    pub fn start(self) -> Result<RunReport, RuntimeError> {
        let Self {
            mut dispatcher,
            config,
            spawned,
        } = self;

        if let Some(quantum) = config.quantum {
            let timer = abyss::timer::Timer::new(config.clock, quantum)
                .map_err(RuntimeError::TimerUnavailable)?;
            interrupt::install()?;
            dispatcher.set_timer(timer);
        }
        if let Err(e) = dispatcher.bind() {
            if dispatcher.timer().is_some() {
                interrupt::uninstall();
            }
            return Err(e);
        }
        log::info!("runtime: starting {spawned} threads");

        let armed = {
            let _guard = InterruptGuard::new();
            let armed = match dispatcher.timer().map(|timer| timer.arm()) {
                Some(Err(errno)) => Err(RuntimeError::TimerUnavailable(errno)),
                _ => Ok(()),
            };
            if armed.is_ok() {
                dispatcher.schedule(Cause::Boot);
            }
            if let Some(timer) = dispatcher.timer()
                && let Err(errno) = timer.disarm()
            {
                log::warn!("runtime: disarming the timer failed (errno {errno})");
            }
            dispatcher.unbind();
            armed
        };
        if dispatcher.timer().is_some() {
            interrupt::uninstall();
        }
        armed?;

        let report = dispatcher.report();
        log::info!("runtime: stopped, {} threads retired", report.retired);
        Ok(report)
    }
}
