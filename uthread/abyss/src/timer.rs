//! Quantum timer.
//!
//! A [`Timer`] is a one-shot POSIX timer whose expiration is delivered as the
//! timer interrupt ([`TIMER_SIGNAL`]) to the OS thread that created it, and
//! to no other thread of the process. The interrupt handler re-arms it.
//!
//! [`TIMER_SIGNAL`]: crate::interrupt::TIMER_SIGNAL
use crate::interrupt::TIMER_SIGNAL;
use core::{mem::MaybeUninit, ptr, time::Duration};

/// The clock a [`Timer`] measures its interval against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Clock {
    /// Wall-clock time that is not affected by clock adjustments.
    #[default]
    Monotonic,
    /// CPU time consumed by the OS thread that created the timer.
    ///
    /// A thread blocked in [`wait_for_interrupt`] consumes no CPU time and
    /// is never woken up by this clock.
    ///
    /// [`wait_for_interrupt`]: crate::interrupt::wait_for_interrupt
    ThreadCpuTime,
}

impl Clock {
    fn id(self) -> libc::clockid_t {
        match self {
            Clock::Monotonic => libc::CLOCK_MONOTONIC,
            Clock::ThreadCpuTime => libc::CLOCK_THREAD_CPUTIME_ID,
        }
    }
}

fn to_timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}

/// The id of the calling OS thread.
pub fn gettid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// A one-shot timer targeting the OS thread that created it.
#[derive(Debug)]
pub struct Timer {
    id: libc::timer_t,
    interval: Duration,
}

impl Timer {
    /// Creates a disarmed timer that expires `interval` after each
    /// [`Timer::arm`].
    ///
    /// # Returns
    /// - `Ok(timer)` on success.
    /// - `Err(errno)` if the kernel refused to create the timer.
    pub fn new(clock: Clock, interval: Duration) -> Result<Self, i32> {
        let mut event: libc::sigevent = unsafe { core::mem::zeroed() };
        event.sigev_notify = libc::SIGEV_THREAD_ID;
        event.sigev_signo = TIMER_SIGNAL;
        event.sigev_notify_thread_id = gettid();

        let mut id = MaybeUninit::<libc::timer_t>::uninit();
        if unsafe { libc::timer_create(clock.id(), &mut event, id.as_mut_ptr()) } != 0 {
            return Err(crate::errno());
        }
        Ok(Self {
            id: unsafe { id.assume_init() },
            interval,
        })
    }

    /// The interval between arming and expiration.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn settime(&self, value: Duration) -> Result<(), i32> {
        let spec = libc::itimerspec {
            it_interval: to_timespec(Duration::ZERO),
            it_value: to_timespec(value),
        };
        if unsafe { libc::timer_settime(self.id, 0, &spec, ptr::null_mut()) } != 0 {
            return Err(crate::errno());
        }
        Ok(())
    }

    /// Starts a new interval, replacing any pending expiration.
    ///
    /// This is async-signal-safe.
    pub fn arm(&self) -> Result<(), i32> {
        self.settime(self.interval)
    }

    /// Cancels the pending expiration, if any.
    pub fn disarm(&self) -> Result<(), i32> {
        self.settime(Duration::ZERO)
    }

    /// Time left until the pending expiration; zero if disarmed.
    pub fn remaining(&self) -> Result<Duration, i32> {
        let mut spec = MaybeUninit::<libc::itimerspec>::uninit();
        if unsafe { libc::timer_gettime(self.id, spec.as_mut_ptr()) } != 0 {
            return Err(crate::errno());
        }
        let value = unsafe { spec.assume_init() }.it_value;
        Ok(Duration::new(value.tv_sec as u64, value.tv_nsec as u32))
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        unsafe { libc::timer_delete(self.id) };
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::interrupt::InterruptGuard;

    #[test]
    fn remaining_follows_arm_and_disarm() {
        let timer = Timer::new(Clock::Monotonic, Duration::from_secs(10)).unwrap();
        assert_eq!(timer.remaining(), Ok(Duration::ZERO));
        timer.arm().unwrap();
        let left = timer.remaining().unwrap();
        assert!(left > Duration::from_secs(9) && left <= Duration::from_secs(10));
        timer.disarm().unwrap();
        assert_eq!(timer.remaining(), Ok(Duration::ZERO));
    }

    #[test]
    fn expiration_stays_pending_while_masked() {
        let _guard = InterruptGuard::new();
        let timer = Timer::new(Clock::Monotonic, Duration::from_millis(1)).unwrap();
        assert_eq!(timer.interval(), Duration::from_millis(1));
        timer.arm().unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let mut pending = MaybeUninit::<libc::sigset_t>::uninit();
        unsafe {
            libc::sigpending(pending.as_mut_ptr());
            assert_eq!(libc::sigismember(pending.as_ptr(), TIMER_SIGNAL), 1);
        }

        // Consume the pending signal so it is never delivered to the harness.
        let set = {
            let mut set = MaybeUninit::<libc::sigset_t>::uninit();
            unsafe {
                libc::sigemptyset(set.as_mut_ptr());
                libc::sigaddset(set.as_mut_ptr(), TIMER_SIGNAL);
                set.assume_init()
            }
        };
        let mut signo = 0;
        assert_eq!(unsafe { libc::sigwait(&set, &mut signo) }, 0);
        assert_eq!(signo, TIMER_SIGNAL);
        timer.disarm().unwrap();
    }
}
