//! Thread abstraction, an abstraction of a unit of execution.
//!
//! ## The threading model
//!
//! A running [`Runtime`] consists of a collection of threads multiplexed onto
//! the OS thread that called [`Runtime::start`]. Each thread has its own
//! stack, a name, and a [`ThreadState`]. Exactly one of them is
//! [`ThreadState::Running`] at a time; the others wait in the ready queue or
//! are done.
//!
//! A thread leaves the CPU when
//! - its quantum expires and the timer interrupt preempts it,
//! - it calls [`Current::yield_now`], or
//! - it returns from its entry, panics, or calls [`Current::exit`].
//!
//! ## State transitions
//!
//! ```text
//!  NotStarted --mount--> Running --preempt/yield--> Ready --capture--> Suspended
//!                           ^                                             |
//!                           +------------------resume---------------------+
//!                           |
//!                           +--exit--> Terminated --retire--> (released)
//! ```
//!
//! Thread code shares the OS thread with the interrupt handler. Non-reentrant
//! services (the global allocator, `std::io`, locks of the standard library)
//! must be used under [`Thread::pin`], or a preemption in the middle of them
//! can deadlock the runtime.
//!
//! [`Runtime`]: crate::Runtime
//! [`Runtime::start`]: crate::Runtime::start
pub mod context;
pub mod scheduler;

use crate::RuntimeError;
use abyss::{interrupt::InterruptGuard, mm::Mapping};
use arrayvec::ArrayString;
use context::Context;
use scheduler::{Cause, with_dispatcher};

/// Default size of each thread's stack.
pub const STACK_SIZE: usize = 0x10000;
/// Smallest stack a thread may be configured with.
pub const MIN_STACK_SIZE: usize = 0x4000;
/// Thread magic to detect stack overflow.
pub const THREAD_MAGIC: usize = 0xdeadbeefcafebabe;
/// Longest thread name kept, in bytes.
pub const NAME_LEN: usize = 32;
/// Stack a thread keeps below its entry closure, besides room for the
/// closure itself.
pub const ENTRY_HEADROOM: usize = 0x2000;

/// Identifier of a thread, unique within its runtime.
///
/// Ids are handed out in spawn order starting from 0.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Tid(usize);

impl Tid {
    pub(crate) const fn new(index: usize) -> Self {
        Self(index)
    }

    /// The position of the thread in spawn order.
    pub const fn index(self) -> usize {
        self.0
    }
}

impl core::fmt::Display for Tid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A possible state of the thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ThreadState {
    /// Thread is created but has never run.
    NotStarted,
    /// Thread is queued but its context is not captured yet.
    Ready,
    /// Thread is running.
    Running,
    /// Thread is queued with a captured context.
    Suspended,
    /// Thread is finished and waits to be retired.
    Terminated,
}

impl ThreadState {
    /// Returns true if the dispatcher may move a thread from `self` to
    /// `next`.
    pub fn can_transition_to(self, next: ThreadState) -> bool {
        use ThreadState::*;
        matches!(
            (self, next),
            (NotStarted, Running)
                | (Running, Ready)
                | (Ready, Suspended)
                | (Suspended, Running)
                | (Running, Terminated)
        )
    }
}

/// The Thread stack.
///
/// A guarded mapping whose lowest word holds [`THREAD_MAGIC`]. A stack that
/// grows into its lowest word clobbers the magic, which the dispatcher checks
/// whenever the thread is switched away from.
pub(crate) struct ThreadStack {
    mapping: Mapping,
}

impl ThreadStack {
    fn new(size: usize) -> Result<Self, RuntimeError> {
        let mapping = Mapping::with_guard_page(size).map_err(RuntimeError::NoMemory)?;
        unsafe { (mapping.start() as *mut usize).write(THREAD_MAGIC) };
        Ok(Self { mapping })
    }

    /// Returns true if the magic is untouched.
    pub(crate) fn is_intact(&self) -> bool {
        unsafe { (self.mapping.start() as *const usize).read_volatile() == THREAD_MAGIC }
    }

    fn start(&self) -> usize {
        self.mapping.start()
    }

    fn end(&self) -> usize {
        self.mapping.end()
    }

    fn size(&self) -> usize {
        self.mapping.size()
    }
}

/// The entry closure of a thread, moved to the top of the thread's own stack.
///
/// The closure is type-erased so that the thread table stays free of
/// allocations.
pub(crate) struct Entry {
    closure: *mut u8,
    call: unsafe fn(*mut u8) -> i32,
    drop: unsafe fn(*mut u8),
}

impl Entry {
    /// Moves `f` to the top of `stack` and returns the entry together with
    /// the 16-byte aligned top of the stack left for the thread.
    ///
    /// Calling the entry moves the closure once more, onto the thread's own
    /// frames. Returns `None` unless the stack below the placed closure holds
    /// that copy plus [`ENTRY_HEADROOM`] bytes.
    fn place<F: FnOnce() -> i32 + Send + 'static>(
        stack: &ThreadStack,
        f: F,
    ) -> Option<(Self, usize)> {
        unsafe fn call_entry<F: FnOnce() -> i32>(closure: *mut u8) -> i32 {
            let f = unsafe { closure.cast::<F>().read() };
            f()
        }
        unsafe fn drop_entry<F>(closure: *mut u8) {
            unsafe { closure.cast::<F>().drop_in_place() };
        }

        let size = core::mem::size_of::<F>();
        let align = core::mem::align_of::<F>().max(16);
        let at = stack.end().checked_sub(size)? & !(align - 1);
        let floor = stack
            .start()
            .checked_add(core::mem::size_of_val(&THREAD_MAGIC) + ENTRY_HEADROOM)?
            .checked_add(size)?;
        if at < floor {
            return None;
        }
        unsafe { (at as *mut F).write(f) };
        Some((
            Self {
                closure: at as *mut u8,
                call: call_entry::<F>,
                drop: drop_entry::<F>,
            },
            at,
        ))
    }

    /// Runs the closure.
    ///
    /// # Safety
    /// The stack the entry was placed on must still be mapped.
    pub(crate) unsafe fn call(self) -> i32 {
        let call = self.call;
        let closure = self.closure;
        core::mem::forget(self);
        unsafe { call(closure) }
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        unsafe { (self.drop)(self.closure) };
    }
}

/// A thread control block.
#[repr(C)]
pub struct Thread {
    /// The context to resume, once the thread has been suspended.
    ///
    /// ## WARNING
    /// DO NOT CHANGE THE OFFSET THIS FIELDS.
    pub(crate) context: Context,
    // Lives on the stack, so it must be dropped first.
    entry: Option<Entry>,
    /// Thread Stack
    pub(crate) stack: ThreadStack,
    /// Thread id
    pub tid: Tid,
    /// Thread name
    pub name: ArrayString<NAME_LEN>,
    state: ThreadState,
    stack_top: usize,
}

impl Thread {
    /// Creates a [`ThreadState::NotStarted`] thread that will run `f` on a
    /// fresh stack of `stack_size` bytes.
    ///
    /// Names longer than [`NAME_LEN`] bytes are truncated.
    ///
    /// # Returns
    /// - [`RuntimeError::NoMemory`] if the stack could not be mapped.
    /// - [`RuntimeError::InvalidConfiguration`] if `f` leaves less than
    ///   [`ENTRY_HEADROOM`] bytes of the stack free.
    pub(crate) fn new<F>(tid: Tid, name: &str, stack_size: usize, f: F) -> Result<Self, RuntimeError>
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        let stack = ThreadStack::new(stack_size)?;
        let (entry, stack_top) = Entry::place(&stack, f).ok_or(
            RuntimeError::InvalidConfiguration("entry does not fit on the thread stack"),
        )?;
        let mut short = ArrayString::new();
        for c in name.chars() {
            if short.try_push(c).is_err() {
                break;
            }
        }
        log::debug!(
            "thread {tid} ({short}): created with {:#x} bytes of stack",
            stack.size()
        );
        Ok(Self {
            context: Context::new(),
            entry: Some(entry),
            stack,
            tid,
            name: short,
            state: ThreadState::NotStarted,
            stack_top,
        })
    }

    /// The current state.
    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub(crate) fn transition(&mut self, next: ThreadState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "thread {}: {:?} -> {:?}",
            self.tid,
            self.state,
            next
        );
        self.state = next;
    }

    pub(crate) fn stack_top(&self) -> usize {
        self.stack_top
    }

    pub(crate) fn take_entry(&mut self) -> Option<Entry> {
        self.entry.take()
    }

    /// Pin current thread not to be scheduled by blocking interrupt.
    ///
    /// When [`ThreadPinGuard`] is dropped, the current thread is unpinned.
    /// When you hold multiple [`ThreadPinGuard`], you **MUST** drops
    /// [`ThreadPinGuard`] as a reverse order of creation.
    ///
    /// # Example
    /// ```rust,no_run
    /// use uthread::thread::Thread;
    ///
    /// let _pin = Thread::pin();
    /// // Allocating is safe here: the timer cannot preempt the thread.
    /// let v = vec![1, 2, 3];
    /// drop(v);
    /// ```
    pub fn pin() -> ThreadPinGuard {
        ThreadPinGuard::new()
    }
}

/// A RAII implementation of the thread pinning.
pub type ThreadPinGuard = InterruptGuard;

/// The very beginning of every thread.
///
/// Entered with interrupts disabled, from [`context::mount_and_enter`].
pub(crate) unsafe extern "C" fn thread_start() -> ! {
    let entry = with_dispatcher(|dispatcher| dispatcher.enter_current()).flatten();
    let Some(entry) = entry else {
        log::error!("thread started without an entry");
        std::process::abort();
    };
    unsafe { abyss::interrupt::InterruptState::enable() };

    let code = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe {
        entry.call()
    })) {
        Ok(code) => code,
        Err(payload) => {
            let _pin = Thread::pin();
            log::warn!("thread {}: panicked", Current::get_tid());
            drop(payload);
            -1
        }
    };
    Current::exit(code)
}

/// The opaque structure indicating the running thread.
pub struct Current {
    _p: (),
}

impl Current {
    /// Gives up the rest of the quantum.
    ///
    /// The current thread goes to the back of the ready queue and the thread
    /// at its front runs. Returns immediately if no other thread is ready.
    ///
    /// # Panics
    /// Panics if not called from a thread of a running runtime.
    pub fn yield_now() {
        let _guard = InterruptGuard::new();
        with_dispatcher(|dispatcher| dispatcher.schedule(Cause::Yield))
            .expect("yield_now called outside of a running runtime");
    }

    /// Exit the current thread with `exit_code`.
    ///
    /// # Panics
    /// Panics if not called from a thread of a running runtime.
    pub fn exit(exit_code: i32) -> ! {
        let _guard = InterruptGuard::new();
        with_dispatcher(|dispatcher| dispatcher.schedule(Cause::Exit(exit_code)))
            .expect("exit called outside of a running runtime");
        unreachable!("a terminated thread was resumed")
    }

    /// Get the current thread's id.
    ///
    /// # Panics
    /// Panics if not called from a thread of a running runtime.
    pub fn get_tid() -> Tid {
        with_dispatcher(|dispatcher| dispatcher.running())
            .flatten()
            .expect("get_tid called outside of a thread")
    }
}

/// Parks the OS thread until the next timer interrupt.
///
/// Returns once the current thread is scheduled again. In cooperative mode
/// no timer exists, so this only returns if some other signal arrives; use
/// [`Current::yield_now`] there instead.
pub fn pause() {
    abyss::interrupt::wait_for_interrupt();
}

/// Get specified thread's [`ThreadState`] by its [`Tid`].
///
/// # Returns
/// - `Ok(state)` for a thread that has not been retired yet.
/// - `Err(RuntimeError::NoSuchThread)` if the thread was retired or never
///   existed, or if no runtime runs on the calling OS thread.
pub fn get_state_by_tid(tid: Tid) -> Result<ThreadState, RuntimeError> {
    with_dispatcher(|dispatcher| dispatcher.state_of(tid)).unwrap_or(Err(RuntimeError::NoSuchThread))
}
