//! The abyss of the runtime that talks to the host.
//!
//! This crate contains the collection of host-facing pieces the thread
//! runtime is built on: the emulated timer interrupt, interrupt masking,
//! anonymous memory mappings for thread stacks, and a signal-safe console.
//!
//! The runtime runs as an ordinary process on x86_64 Linux, so "hardware" is
//! replaced by the kernel interfaces that play the same role:
//!
//! | Hardware           | Host substitute                               |
//! |--------------------|-----------------------------------------------|
//! | `cli` / `sti`      | `pthread_sigmask` on the timer signal          |
//! | APIC timer         | POSIX per-thread timer delivering `SIGALRM`    |
//! | IDT entry          | `sigaction` with `SA_SIGINFO`                  |
//! | `hlt`              | `pause(2)`                                     |
//! | page allocator     | `mmap(2)` / `munmap(2)`                        |
//! | serial console     | `write(2)` on the standard streams            |
//!
//! You are **not** required to understand every line of code in this crate to
//! use the runtime. See the [`uthread`] crate for the interfaces meant to be
//! used by thread code.
//!
//! [`uthread`]: ../uthread/index.html
#![allow(clippy::missing_safety_doc)]

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("abyss only supports x86_64 Linux hosts.");

use core::sync::atomic::AtomicBool;

#[doc(hidden)]
#[macro_use]
pub mod kprint;
pub mod interrupt;
pub mod mm;
pub mod spinlock;
pub mod timer;

pub use spinlock::SpinLock;

/// Suppresses the diagnostic output of the console logger when set.
#[doc(hidden)]
pub static QUITE: AtomicBool = AtomicBool::new(false);

/// Reads `errno` of the calling OS thread.
#[inline]
pub fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

/// Overwrites `errno` of the calling OS thread.
#[inline]
pub fn set_errno(value: i32) {
    unsafe { *libc::__errno_location() = value };
}
