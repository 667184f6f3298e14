//! Interrupt
//!
//! The runtime has exactly one interrupt source: the quantum timer, delivered
//! to the hosting OS thread as [`TIMER_SIGNAL`]. "Disabling interrupts" masks
//! that signal for the calling OS thread, and the interrupt handler is a
//! `sigaction(2)` handler that forwards to the function registered with
//! [`register`].
//!
//! The handler is installed without `SA_NODEFER`, so the kernel masks the
//! timer signal for as long as a handler runs. A handler that switches to
//! another execution context therefore carries the mask along, and the
//! interrupted context gets its own mask back from `sigreturn(2)` once it is
//! resumed and its handler returns.
use bitflags::bitflags;
use core::{
    marker::PhantomData,
    mem::MaybeUninit,
    ptr,
    sync::atomic::{AtomicUsize, Ordering, compiler_fence},
};
use std::sync::{Mutex, PoisonError};

/// The signal that plays the role of the timer interrupt.
pub const TIMER_SIGNAL: libc::c_int = libc::SIGALRM;

static HANDLER: AtomicUsize = AtomicUsize::new(0);

/// Live registrations, and the disposition the first one replaced.
struct Registrations {
    users: usize,
    previous: Option<libc::sigaction>,
}

static REGISTRATIONS: Mutex<Registrations> = Mutex::new(Registrations {
    users: 0,
    previous: None,
});

bitflags! {
    /// Flags passed to `sigaction(2)` when the interrupt entry is installed.
    pub struct SigActionFlags: libc::c_int {
        /// The entry receives `siginfo_t` and the interrupted `ucontext_t`.
        const SIGINFO = libc::SA_SIGINFO;
        /// Interruptible system calls are restarted after the entry returns.
        const RESTART = libc::SA_RESTART;
    }
}

fn timer_sigset() -> libc::sigset_t {
    let mut set = MaybeUninit::<libc::sigset_t>::uninit();
    unsafe {
        libc::sigemptyset(set.as_mut_ptr());
        libc::sigaddset(set.as_mut_ptr(), TIMER_SIGNAL);
        set.assume_init()
    }
}

/// Changes the mask of the timer signal and returns the previous state.
fn set_mask(how: libc::c_int) -> InterruptState {
    let set = timer_sigset();
    let mut old = MaybeUninit::<libc::sigset_t>::uninit();
    unsafe {
        libc::pthread_sigmask(how, &set, old.as_mut_ptr());
        InterruptState::from_mask(old.as_ptr())
    }
}

/// Enumeration representing the interrupt state.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum InterruptState {
    /// Interrupts are enabled.
    On,
    /// Interrupts are disabled.
    Off,
}

impl InterruptState {
    unsafe fn from_mask(mask: *const libc::sigset_t) -> Self {
        if unsafe { libc::sigismember(mask, TIMER_SIGNAL) } == 1 {
            Self::Off
        } else {
            Self::On
        }
    }

    /// Reads the current interrupt state.
    ///
    /// # Returns
    /// - [`InterruptState::On`] if the timer signal can be delivered.
    /// - [`InterruptState::Off`] if the timer signal is masked.
    pub fn current() -> Self {
        let mut old = MaybeUninit::<libc::sigset_t>::uninit();
        unsafe {
            libc::pthread_sigmask(libc::SIG_BLOCK, ptr::null(), old.as_mut_ptr());
            Self::from_mask(old.as_ptr())
        }
    }

    /// Unmasks the timer signal.
    ///
    /// # Safety
    /// Any [`InterruptGuard`] alive on the current execution context loses
    /// its protection.
    pub unsafe fn enable() {
        compiler_fence(Ordering::SeqCst);
        set_mask(libc::SIG_UNBLOCK);
    }

    /// Masks the timer signal.
    ///
    /// # Safety
    /// The caller is responsible for enabling interrupts again.
    pub unsafe fn disable() {
        set_mask(libc::SIG_BLOCK);
        compiler_fence(Ordering::SeqCst);
    }
}

/// An RAII-based guard for managing interrupt disabling.
///
/// When an `InterruptGuard` is created, interrupts are disabled. When it is
/// dropped, the interrupt state is restored to what it was before the guard was
/// created.
///
/// **Important:**
/// - [`InterruptGuard`] instances **must be dropped in reverse order of their
///   creation** to prevent unintended interrupt state changes.
/// - Each guard remembers its own initial state, so guards living on the
///   stacks of different execution contexts do not interfere with each other
///   across a context switch.
///
/// This structure is created using [`InterruptGuard::new`].
pub struct InterruptGuard {
    initial_state: InterruptState,
    _not_send: PhantomData<*mut ()>,
}

impl InterruptGuard {
    /// Creates a new `InterruptGuard`, disabling interrupts.
    ///
    /// # Behavior
    /// - Saves the current interrupt state.
    /// - Masks the timer signal.
    ///
    /// # Returns
    /// A new instance of `InterruptGuard`, which will restore the original
    /// interrupt state when dropped.
    ///
    /// # Example
    /// ```rust
    /// use abyss::interrupt::InterruptGuard;
    ///
    /// let _guard = InterruptGuard::new(); // Disables interrupts
    /// // Critical section...
    /// // Interrupts are restored when `_guard` goes out of scope.
    /// ```
    pub fn new() -> Self {
        let initial_state = set_mask(libc::SIG_BLOCK);
        compiler_fence(Ordering::SeqCst);
        Self {
            initial_state,
            _not_send: PhantomData,
        }
    }

    /// Returns true if interrupts are disabled on the calling context.
    pub fn is_guarded() -> bool {
        InterruptState::current() == InterruptState::Off
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.initial_state == InterruptState::On {
            unsafe { InterruptState::enable() };
        }
    }
}

extern "C" fn do_handle_interrupt(
    _signo: libc::c_int,
    _info: *mut libc::siginfo_t,
    _uctx: *mut libc::c_void,
) {
    // The interrupted code must observe the errno it left behind.
    let errno = crate::errno();
    let raw = HANDLER.load(Ordering::SeqCst);
    if raw != 0 {
        let handler = unsafe { core::mem::transmute::<usize, fn()>(raw) };
        handler();
    }
    crate::set_errno(errno);
}

/// Installs `handler` as the timer interrupt handler of the process.
///
/// The handler runs with interrupts disabled, on the stack of whatever
/// execution context was interrupted. It may switch to another execution
/// context; the interrupted context continues from the handler when it is
/// switched back to. The handler must only call async-signal-safe functions.
///
/// Registering again replaces the previous handler. Every successful call
/// must be paired with an [`unregister`]; the disposition of the signal that
/// was in place before the first registration comes back with the last one.
///
/// # Returns
/// - `Ok(())` if the entry is installed.
/// - `Err(errno)` if `sigaction(2)` rejected it.
pub fn register(handler: fn()) -> Result<(), i32> {
    let mut registrations = REGISTRATIONS.lock().unwrap_or_else(PoisonError::into_inner);
    HANDLER.store(handler as usize, Ordering::SeqCst);
    if registrations.users == 0 {
        let mut action: libc::sigaction = unsafe { core::mem::zeroed() };
        action.sa_sigaction = do_handle_interrupt as *const () as libc::sighandler_t;
        action.sa_flags = (SigActionFlags::SIGINFO | SigActionFlags::RESTART).bits();
        unsafe { libc::sigemptyset(&mut action.sa_mask) };
        let mut previous = MaybeUninit::<libc::sigaction>::uninit();
        if unsafe { libc::sigaction(TIMER_SIGNAL, &action, previous.as_mut_ptr()) } != 0 {
            return Err(crate::errno());
        }
        registrations.previous = Some(unsafe { previous.assume_init() });
    }
    registrations.users += 1;
    Ok(())
}

/// Drops a registration made with [`register`].
///
/// The last one restores the disposition found by the first. An expiration
/// still pending on the calling OS thread is discarded beforehand.
pub fn unregister() {
    let mut registrations = REGISTRATIONS.lock().unwrap_or_else(PoisonError::into_inner);
    match registrations.users {
        0 => {}
        1 => {
            let set = timer_sigset();
            let zero = libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };
            while unsafe { libc::sigtimedwait(&set, ptr::null_mut(), &zero) } == TIMER_SIGNAL {}
            if let Some(previous) = registrations.previous.take() {
                unsafe { libc::sigaction(TIMER_SIGNAL, &previous, ptr::null_mut()) };
            }
            HANDLER.store(0, Ordering::SeqCst);
            registrations.users = 0;
        }
        _ => registrations.users -= 1,
    }
}

/// Parks the OS thread until an interrupt has been handled.
///
/// Must be called with interrupts enabled, or it never returns.
pub fn wait_for_interrupt() {
    unsafe { libc::pause() };
}
