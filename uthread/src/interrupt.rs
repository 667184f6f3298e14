//! Timer interrupt handling.
//!
//! Each expiration of the quantum timer lands in [`handle_timer_interrupt`]
//! on the stack of the preempted thread, with interrupts disabled by the
//! kernel. The handler re-arms the timer for the next quantum and runs the
//! dispatcher; when the preempted thread is resumed later, the handler
//! returns and the thread continues where it was interrupted.
use crate::{
    RuntimeError,
    thread::scheduler::{Cause, with_dispatcher},
};
use abyss::spinlock::WouldBlock;

fn handle_timer_interrupt() {
    let _ = with_dispatcher(|dispatcher| {
        dispatcher.rearm();
        if let Err(WouldBlock) = dispatcher.try_schedule(Cause::Preempt) {
            log::trace!("timer: dispatcher busy, expiration dropped");
        }
    });
}

/// Installs the timer interrupt handler.
pub(crate) fn install() -> Result<(), RuntimeError> {
    abyss::interrupt::register(handle_timer_interrupt).map_err(RuntimeError::TimerUnavailable)
}

/// Drops the registration made by [`install`].
pub(crate) fn uninstall() {
    abyss::interrupt::unregister();
}
