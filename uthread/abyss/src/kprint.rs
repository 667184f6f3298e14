//! Console print utilities.
//!
//! Messages are formatted into a fixed-size buffer and emitted with a single
//! `write(2)` while interrupts are disabled. Nothing here allocates or takes a
//! lock, so printing is safe from the interrupt handler. Messages longer than
//! [`LINE_CAPACITY`] are truncated.

use crate::interrupt::InterruptGuard;
use arrayvec::ArrayString;
use core::fmt::Write;

/// Maximum number of bytes emitted per message.
pub const LINE_CAPACITY: usize = 512;

/// Destination of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    /// The standard output.
    Stdout,
    /// The standard error.
    Stderr,
}

impl Stream {
    fn fd(self) -> libc::c_int {
        match self {
            Stream::Stdout => libc::STDOUT_FILENO,
            Stream::Stderr => libc::STDERR_FILENO,
        }
    }
}

fn write_all(fd: libc::c_int, mut buf: &[u8]) {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            if crate::errno() == libc::EINTR {
                continue;
            }
            return;
        }
        buf = &buf[n as usize..];
    }
}

#[doc(hidden)]
pub fn _print_to(stream: Stream, fmt: core::fmt::Arguments<'_>) {
    let _guard = InterruptGuard::new();
    let errno = crate::errno();
    let mut line = ArrayString::<LINE_CAPACITY>::new();
    let _ = line.write_fmt(fmt);
    write_all(stream.fd(), line.as_bytes());
    crate::set_errno(errno);
}

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    _print_to(Stream::Stdout, fmt)
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the standard output.
/// Interrupts are disabled while the message is written.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
///
/// Use the format! syntax to write data to the standard output.
/// Interrupts are disabled while the message is written.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
