//! Execution context capture and transfer.
//!
//! A suspended execution context is represented by a single value, the stack
//! pointer it was suspended at. Everything else lives on its own stack in a
//! switch frame pushed by the suspending side:
//!
//! ```text
//!   higher address  +----------------+
//!                   | return address |  back into the caller of the switch
//!                   | rbp            |
//!                   | rbx            |
//!                   | r12            |
//!                   | r13            |
//!                   | r14            |
//!                   | r15            |
//!                   | x87 cw | mxcsr |  (8 bytes)
//!   Context::sp --> +----------------+
//! ```
//!
//! Only the callee-saved state of the System V ABI is captured: the switch
//! is an ordinary function call for the suspending side, so the compiler has
//! already spilled every caller-saved register it needs. When the switch is
//! made from the interrupt handler, the interrupted registers sit further up
//! the same stack in the kernel's signal frame and come back through
//! `sigreturn(2)`.
use core::arch::naked_asm;

/// A saved execution context.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Context {
    /// A stack pointer on context switch.
    ///
    /// ## WARNING
    /// This offset is used in context switch with hard-coded value.
    pub(crate) sp: usize,
}

impl Context {
    /// Creates an empty context, to be filled by a capture.
    pub const fn new() -> Self {
        Self { sp: 0 }
    }
}

/// Captures the running context into `save` and starts `entry` on the empty
/// stack ending at `stack_top`.
///
/// `entry` must never return. The call returns when some other context is
/// transferred back to `save`.
///
/// # Safety
/// - `stack_top` must be the 16-byte aligned end of a mapped stack that no
///   live context uses.
/// - `save` must stay valid until it is resumed.
/// - Interrupts must be disabled.
#[unsafe(naked)]
pub unsafe extern "C" fn mount_and_enter(
    _save: *mut Context,
    _stack_top: usize,
    _entry: unsafe extern "C" fn() -> !,
) {
    // RDI: save slot. RSI: stack top. RDX: entry.
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "sub rsp, 8",
        "stmxcsr dword ptr [rsp]",
        "fnstcw word ptr [rsp + 4]",
        "mov [rdi], rsp",
        // Switch.
        "mov rsp, rsi",
        "xor ebp, ebp",
        // The pushed return address realigns the entry as an ordinary call.
        "call rdx",
        "ud2",
    );
}

/// Captures the running context into `save` and resumes the context in
/// `resume`.
///
/// The call returns when some other context is transferred back to `save`.
///
/// # Safety
/// - `resume` must hold a context captured by [`mount_and_enter`] or this
///   function that has not been resumed since.
/// - `save` must stay valid until it is resumed.
/// - Interrupts must be disabled.
#[unsafe(naked)]
pub unsafe extern "C" fn capture_and_transfer(_save: *mut Context, _resume: *const Context) {
    // RDI: save slot. RSI: context to resume.
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "sub rsp, 8",
        "stmxcsr dword ptr [rsp]",
        "fnstcw word ptr [rsp + 4]",
        "mov [rdi], rsp",
        // Switch.
        "mov rsp, [rsi]",
        "ldmxcsr dword ptr [rsp]",
        "fldcw word ptr [rsp + 4]",
        "add rsp, 8",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

#[cfg(test)]
mod test {
    use super::*;
    use abyss::mm::Mapping;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static mut HOST: Context = Context::new();
    static mut GUEST: Context = Context::new();
    static ENTERED: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn guest() -> ! {
        let mut local = 0u64;
        loop {
            local += 1;
            ENTERED.store(local as usize, Ordering::SeqCst);
            unsafe { capture_and_transfer(&raw mut GUEST, &raw const HOST) };
        }
    }

    /// Tests mounting a fresh stack and resuming it.
    ///
    /// This test ensures that:
    /// - Mounting runs the entry on the new stack and comes back on transfer.
    /// - Locals of both sides survive every round trip.
    #[test]
    fn mount_then_resume() {
        let stack = Mapping::with_guard_page(0x10000).unwrap();
        let top = stack.end() & !0xf;
        let marks = [0x1111u64, 0x2222, 0x3333, 0x4444];

        unsafe { mount_and_enter(&raw mut HOST, top, guest) };
        assert_eq!(ENTERED.load(Ordering::SeqCst), 1);
        for round in 2..10 {
            unsafe { capture_and_transfer(&raw mut HOST, &raw const GUEST) };
            assert_eq!(ENTERED.load(Ordering::SeqCst), round);
        }
        assert_eq!(marks, [0x1111, 0x2222, 0x3333, 0x4444]);

        let sp = unsafe { (*&raw const GUEST).sp };
        assert!(sp > stack.start() && sp < top);
    }
}
