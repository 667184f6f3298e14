//! Thread scheduler and dispatcher.
//!
//! Scheduling is split in two layers:
//!
//! - [`Core`] does the bookkeeping: it picks the next thread, updates states
//!   and the ready queue, and records zombies. It never switches contexts, so
//!   it can be driven step by step in tests.
//! - [`Dispatcher`] wraps a [`Core`] in a [`SpinLock`], turns each decision
//!   into a context switch, and finishes the switch on the side that lands.
//!
//! Every dispatch runs with interrupts disabled. The lock is released before
//! the actual switch, and the disabled interrupts keep anyone from observing
//! the half-switched state in between.
use super::{
    Thread, ThreadState, Tid,
    context::{self, Context},
    thread_start,
};
use crate::{
    QUEUE_CAPACITY, RuntimeError,
    queue::{QueueEmpty, QueueFull, ReadyQueue},
};
use abyss::{
    interrupt::InterruptGuard,
    spinlock::{SpinLock, SpinLockGuard, WouldBlock},
    timer::Timer,
};
use arrayvec::ArrayVec;
use core::{cell::Cell, cell::UnsafeCell, ptr};

/// A trait for a thread scheduler.
///
/// The [`Scheduler`] trait defines the common functionality expected from a
/// thread scheduler: it keeps the threads that are ready to run and decides
/// which one runs next. It is driven by the dispatcher with interrupts
/// disabled, so an implementation must neither allocate nor block.
pub trait Scheduler {
    /// Pick a next thread to run.
    ///
    /// # Returns
    ///
    /// Returns the [`Tid`] of the next thread to run, removing it from the
    /// queue, or [`QueueEmpty`] if no threads are available to execute.
    fn next_to_run(&mut self) -> Result<Tid, QueueEmpty>;

    /// Push a thread `tid` into scheduling queue.
    ///
    /// # Returns
    ///
    /// Returns [`QueueFull`] if the queue cannot take another thread.
    fn push_to_queue(&mut self, tid: Tid) -> Result<(), QueueFull>;
}

/// A round-robin scheduler.
///
/// Threads run in the order they became ready, one quantum at a time.
#[derive(Default)]
pub struct RoundRobin {
    runqueue: ReadyQueue<Tid, QUEUE_CAPACITY>,
}

impl Scheduler for RoundRobin {
    fn next_to_run(&mut self) -> Result<Tid, QueueEmpty> {
        self.runqueue.pop()
    }

    fn push_to_queue(&mut self, tid: Tid) -> Result<(), QueueFull> {
        self.runqueue.push(tid)
    }
}

/// Why the dispatcher was invoked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cause {
    /// The runtime is starting from the boot context.
    Boot,
    /// The quantum of the running thread expired.
    Preempt,
    /// The running thread gave up the rest of its quantum.
    Yield,
    /// The running thread finished with an exit code.
    Exit(i32),
}

/// Scheduling events reported to the hook installed with
/// [`RuntimeBuilder::on_event`].
///
/// The hook runs inside the dispatcher with interrupts disabled. It must be
/// async-signal-safe and must not call back into the runtime.
///
/// [`RuntimeBuilder::on_event`]: crate::RuntimeBuilder::on_event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// A thread runs for the first time.
    Mounted(Tid),
    /// A thread left the CPU and went back to the ready queue.
    Suspended(Tid),
    /// A suspended thread runs again.
    Resumed(Tid),
    /// A thread finished.
    Terminated {
        /// The finished thread.
        tid: Tid,
        /// Its exit code.
        code: i32,
    },
    /// The resources of a finished thread were released.
    Retired(Tid),
    /// The dispatcher found no other thread ready; the current context keeps
    /// running.
    Idle,
}

/// Where the outgoing context is captured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Save {
    /// The context that called [`Runtime::start`](crate::Runtime::start).
    Boot,
    /// A thread that will be resumed later.
    Thread(Tid),
    /// A terminated thread; the capture is never resumed.
    Discard,
}

/// A scheduling decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Switch {
    /// Keep running the current context.
    Idle,
    /// Start `next` on its fresh stack.
    Mount { save: Save, next: Tid },
    /// Resume the captured context of `next`.
    Resume { save: Save, next: Tid },
    /// All threads are done; return to the boot context.
    Shutdown,
}

/// Scheduling bookkeeping of a runtime.
pub(crate) struct Core<S: Scheduler> {
    scheduler: S,
    threads: ArrayVec<Option<Thread>, QUEUE_CAPACITY>,
    exit_codes: ArrayVec<Option<i32>, QUEUE_CAPACITY>,
    running: Option<Tid>,
    zombie: Option<Tid>,
    retired: usize,
    hook: Option<fn(&Event)>,
}

impl<S: Scheduler> Core<S> {
    pub(crate) fn new(scheduler: S, hook: Option<fn(&Event)>) -> Self {
        Self {
            scheduler,
            threads: ArrayVec::new(),
            exit_codes: ArrayVec::new(),
            running: None,
            zombie: None,
            retired: 0,
            hook,
        }
    }

    fn emit(&self, event: Event) {
        if let Some(hook) = self.hook {
            hook(&event);
        }
    }

    /// Registers a thread created by `create` and makes it ready.
    pub(crate) fn spawn(
        &mut self,
        create: impl FnOnce(Tid) -> Result<Thread, RuntimeError>,
    ) -> Result<Tid, RuntimeError> {
        let tid = Tid::new(self.threads.len());
        if self.threads.is_full() {
            return Err(RuntimeError::QueueFull);
        }
        let thread = create(tid)?;
        self.scheduler.push_to_queue(tid)?;
        self.threads.push(Some(thread));
        self.exit_codes.push(None);
        Ok(tid)
    }

    pub(crate) fn thread(&self, tid: Tid) -> Result<&Thread, RuntimeError> {
        self.threads
            .get(tid.index())
            .and_then(Option::as_ref)
            .ok_or(RuntimeError::NoSuchThread)
    }

    pub(crate) fn thread_mut(&mut self, tid: Tid) -> Result<&mut Thread, RuntimeError> {
        self.threads
            .get_mut(tid.index())
            .and_then(Option::as_mut)
            .ok_or(RuntimeError::NoSuchThread)
    }

    pub(crate) fn running(&self) -> Option<Tid> {
        self.running
    }

    /// Decides what runs next.
    ///
    /// On return all bookkeeping reflects the decision: the outgoing thread
    /// is back in the queue (or terminated), and the incoming one is
    /// [`ThreadState::Running`].
    pub(crate) fn plan(&mut self, cause: Cause) -> Result<Switch, RuntimeError> {
        let old = self.running;
        if matches!(cause, Cause::Preempt | Cause::Yield) && old.is_none() {
            // Nothing runs yet or anymore.
            return Ok(Switch::Idle);
        }

        if let Cause::Exit(code) = cause {
            let tid = old.ok_or(RuntimeError::NoSuchThread)?;
            self.thread_mut(tid)?.transition(ThreadState::Terminated);
            self.exit_codes[tid.index()] = Some(code);
            self.zombie = Some(tid);
            self.running = None;
            log::debug!("thread {tid}: terminated with {code}");
            self.emit(Event::Terminated { tid, code });
        }

        let next = match self.scheduler.next_to_run() {
            Ok(next) => next,
            Err(QueueEmpty) => {
                return Ok(match cause {
                    Cause::Exit(_) => Switch::Shutdown,
                    _ => {
                        self.emit(Event::Idle);
                        Switch::Idle
                    }
                });
            }
        };

        let save = match (cause, old) {
            (Cause::Exit(_), _) => Save::Discard,
            (_, Some(old)) => {
                self.thread_mut(old)?.transition(ThreadState::Ready);
                self.scheduler.push_to_queue(old)?;
                self.thread_mut(old)?.transition(ThreadState::Suspended);
                self.emit(Event::Suspended(old));
                Save::Thread(old)
            }
            (_, None) => Save::Boot,
        };

        let thread = self.thread_mut(next)?;
        let switch = match thread.state() {
            ThreadState::NotStarted => Switch::Mount { save, next },
            ThreadState::Suspended => Switch::Resume { save, next },
            state => {
                return Err(RuntimeError::MismatchedContextOperation { tid: next, state });
            }
        };
        thread.transition(ThreadState::Running);
        self.running = Some(next);
        log::trace!("dispatch: {cause:?} {old:?} -> {next}");
        self.emit(match switch {
            Switch::Mount { .. } => Event::Mounted(next),
            _ => Event::Resumed(next),
        });
        Ok(switch)
    }

    /// Releases the thread that terminated before the last switch.
    pub(crate) fn finish_switch(&mut self) -> Result<(), RuntimeError> {
        match self.zombie.take() {
            Some(zombie) => self.retire(zombie),
            None => Ok(()),
        }
    }

    fn retire(&mut self, tid: Tid) -> Result<(), RuntimeError> {
        if self.running == Some(tid) {
            return Err(RuntimeError::MismatchedContextOperation {
                tid,
                state: ThreadState::Running,
            });
        }
        let slot = self
            .threads
            .get_mut(tid.index())
            .ok_or(RuntimeError::NoSuchThread)?;
        match slot.as_ref().map(Thread::state) {
            Some(ThreadState::Terminated) => {
                drop(slot.take());
                self.retired += 1;
                log::debug!("thread {tid}: retired");
                self.emit(Event::Retired(tid));
                Ok(())
            }
            Some(state) => Err(RuntimeError::MismatchedContextOperation { tid, state }),
            None => Err(RuntimeError::NoSuchThread),
        }
    }

    pub(crate) fn report(&self) -> crate::RunReport {
        crate::RunReport {
            exit_codes: self
                .exit_codes
                .iter()
                .enumerate()
                .map(|(i, code)| (Tid::new(i), *code))
                .collect(),
            retired: self.retired,
        }
    }
}

/// A context switch ready to be performed.
enum Transfer {
    Stay,
    Mount { save: *mut Context, stack_top: usize },
    Resume { save: *mut Context, next: *const Context },
}

/// The dispatcher of a runtime.
pub(crate) struct Dispatcher {
    core: SpinLock<Core<RoundRobin>>,
    boot: UnsafeCell<Context>,
    graveyard: UnsafeCell<Context>,
    timer: Option<Timer>,
}

thread_local! {
    static DISPATCHER: Cell<*const Dispatcher> = const { Cell::new(ptr::null()) };
}

/// Run a function `f` with the dispatcher of the runtime running on the
/// calling OS thread, if any.
pub(crate) fn with_dispatcher<R>(f: impl FnOnce(&Dispatcher) -> R) -> Option<R> {
    let dispatcher = DISPATCHER.with(Cell::get);
    unsafe { dispatcher.as_ref() }.map(f)
}

/// Reports a dispatcher failure and aborts the process.
///
/// The dispatcher may run inside the interrupt handler, where unwinding is
/// not an option.
fn fatal(e: RuntimeError) -> ! {
    log::error!("dispatcher: {e}");
    std::process::abort()
}

impl Dispatcher {
    pub(crate) fn new(hook: Option<fn(&Event)>) -> Self {
        Self {
            core: SpinLock::new(Core::new(RoundRobin::default(), hook)),
            boot: UnsafeCell::new(Context::new()),
            graveyard: UnsafeCell::new(Context::new()),
            timer: None,
        }
    }

    pub(crate) fn set_timer(&mut self, timer: Timer) {
        self.timer = Some(timer);
    }

    pub(crate) fn timer(&self) -> Option<&Timer> {
        self.timer.as_ref()
    }

    /// Starts a fresh quantum, if the runtime is preemptive.
    pub(crate) fn rearm(&self) {
        if let Some(timer) = self.timer()
            && let Err(errno) = timer.arm()
        {
            log::error!("timer: re-arming failed (errno {errno})");
        }
    }

    /// Makes this dispatcher the one of the calling OS thread.
    ///
    /// # Returns
    /// [`RuntimeError::AlreadyRunning`] if another one is bound.
    pub(crate) fn bind(&self) -> Result<(), RuntimeError> {
        DISPATCHER.with(|cell| {
            if cell.get().is_null() {
                cell.set(self);
                Ok(())
            } else {
                Err(RuntimeError::AlreadyRunning)
            }
        })
    }

    pub(crate) fn unbind(&self) {
        DISPATCHER.with(|cell| cell.set(ptr::null()));
    }

    pub(crate) fn spawn(
        &self,
        create: impl FnOnce(Tid) -> Result<Thread, RuntimeError>,
    ) -> Result<Tid, RuntimeError> {
        let mut core = self.core.lock();
        let result = core.spawn(create);
        core.unlock();
        result
    }

    pub(crate) fn running(&self) -> Option<Tid> {
        let core = self.core.lock();
        let running = core.running();
        core.unlock();
        running
    }

    pub(crate) fn state_of(&self, tid: Tid) -> Result<ThreadState, RuntimeError> {
        let core = self.core.lock();
        let state = core.thread(tid).map(Thread::state);
        core.unlock();
        state
    }

    pub(crate) fn report(&self) -> crate::RunReport {
        let core = self.core.lock();
        let report = core.report();
        core.unlock();
        report
    }

    /// Runs the dispatcher for `cause`.
    ///
    /// Returns when the calling context is resumed, which is immediately if
    /// the dispatcher decided to keep it running. Never returns for
    /// [`Cause::Exit`].
    ///
    /// A yield or an exit hands a full quantum to whichever thread runs next.
    pub(crate) fn schedule(&self, cause: Cause) {
        if matches!(cause, Cause::Yield | Cause::Exit(_)) {
            self.rearm();
        }
        self.dispatch(self.core.lock(), cause);
    }

    /// Runs the dispatcher for `cause` unless it is already running.
    ///
    /// The timer interrupt goes through here: an expiration that lands while
    /// the dispatcher holds its lock is dropped.
    pub(crate) fn try_schedule(&self, cause: Cause) -> Result<(), WouldBlock> {
        let core = self.core.try_lock()?;
        self.dispatch(core, cause);
        Ok(())
    }

    fn dispatch(&self, mut core: SpinLockGuard<'_, Core<RoundRobin>>, cause: Cause) {
        let transfer = match core
            .plan(cause)
            .and_then(|switch| self.prepare(&mut core, switch))
        {
            Ok(transfer) => transfer,
            Err(e) => fatal(e),
        };
        core.unlock();
        // The caller's own guard keeps interrupts disabled across the switch.
        debug_assert!(InterruptGuard::is_guarded());

        match transfer {
            Transfer::Stay => return,
            Transfer::Mount { save, stack_top } => unsafe {
                context::mount_and_enter(save, stack_top, thread_start)
            },
            Transfer::Resume { save, next } => unsafe { context::capture_and_transfer(save, next) },
        }
        self.finish_switch();
    }

    /// Resolves a decision into the contexts to switch between.
    fn prepare(&self, core: &mut Core<RoundRobin>, switch: Switch) -> Result<Transfer, RuntimeError> {
        let save_slot = |core: &mut Core<RoundRobin>, save: Save| -> Result<*mut Context, RuntimeError> {
            Ok(match save {
                Save::Boot => self.boot.get(),
                Save::Discard => self.graveyard.get(),
                Save::Thread(tid) => {
                    let thread = core.thread_mut(tid)?;
                    if !thread.stack.is_intact() {
                        return Err(RuntimeError::StackOverflow(tid));
                    }
                    &mut thread.context as *mut Context
                }
            })
        };

        Ok(match switch {
            Switch::Idle => Transfer::Stay,
            Switch::Mount { save, next } => Transfer::Mount {
                save: save_slot(core, save)?,
                stack_top: core.thread(next)?.stack_top(),
            },
            Switch::Resume { save, next } => Transfer::Resume {
                save: save_slot(core, save)?,
                next: &core.thread(next)?.context as *const Context,
            },
            Switch::Shutdown => {
                log::debug!("dispatch: no thread left, returning to boot context");
                Transfer::Resume {
                    save: self.graveyard.get(),
                    next: self.boot.get(),
                }
            }
        })
    }

    /// Completes a switch on the context that was switched to.
    pub(crate) fn finish_switch(&self) {
        let mut core = self.core.lock();
        let result = core.finish_switch();
        core.unlock();
        if let Err(e) = result {
            fatal(e);
        }
    }

    /// Completes the mount of the running thread and hands out its entry.
    pub(crate) fn enter_current(&self) -> Option<super::Entry> {
        self.finish_switch();
        let mut core = self.core.lock();
        let entry = core
            .running()
            .and_then(|tid| core.thread_mut(tid).ok())
            .and_then(Thread::take_entry);
        core.unlock();
        entry
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::thread::STACK_SIZE;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    fn core_with(n: usize) -> Core<RoundRobin> {
        let mut core = Core::new(RoundRobin::default(), None);
        for i in 0..n {
            core.spawn(|tid| Thread::new(tid, &format!("t{i}"), STACK_SIZE, || 0))
                .unwrap();
        }
        core
    }

    fn state(core: &Core<RoundRobin>, i: usize) -> ThreadState {
        core.thread(Tid::new(i)).unwrap().state()
    }

    #[test]
    fn boot_mounts_first_thread() {
        let mut core = core_with(2);
        assert_eq!(
            core.plan(Cause::Boot),
            Ok(Switch::Mount {
                save: Save::Boot,
                next: Tid::new(0)
            })
        );
        assert_eq!(core.running(), Some(Tid::new(0)));
        assert_eq!(state(&core, 0), ThreadState::Running);
        assert_eq!(state(&core, 1), ThreadState::NotStarted);
    }

    #[test]
    fn boot_without_threads_idles() {
        let mut core = core_with(0);
        assert_eq!(core.plan(Cause::Boot), Ok(Switch::Idle));
        assert_eq!(core.running(), None);
    }

    #[test]
    fn preempt_rotates_and_resumes() {
        let mut core = core_with(2);
        core.plan(Cause::Boot).unwrap();
        assert_eq!(
            core.plan(Cause::Preempt),
            Ok(Switch::Mount {
                save: Save::Thread(Tid::new(0)),
                next: Tid::new(1)
            })
        );
        assert_eq!(state(&core, 0), ThreadState::Suspended);
        assert_eq!(
            core.plan(Cause::Preempt),
            Ok(Switch::Resume {
                save: Save::Thread(Tid::new(1)),
                next: Tid::new(0)
            })
        );
        assert_eq!(state(&core, 0), ThreadState::Running);
        assert_eq!(state(&core, 1), ThreadState::Suspended);
    }

    /// Tests the idle policy.
    ///
    /// This test ensures that:
    /// - Preempting or yielding the only thread keeps it running untouched.
    /// - The exit of the last thread shuts the runtime down.
    #[test]
    fn lone_thread_keeps_running_until_exit() {
        let mut core = core_with(1);
        core.plan(Cause::Boot).unwrap();
        for cause in [Cause::Preempt, Cause::Yield, Cause::Preempt] {
            assert_eq!(core.plan(cause), Ok(Switch::Idle));
            assert_eq!(core.running(), Some(Tid::new(0)));
            assert_eq!(state(&core, 0), ThreadState::Running);
        }
        assert_eq!(core.plan(Cause::Exit(3)), Ok(Switch::Shutdown));
        assert_eq!(core.running(), None);
        core.finish_switch().unwrap();
        assert_eq!(core.thread(Tid::new(0)).err(), Some(RuntimeError::NoSuchThread));
        let report = core.report();
        assert_eq!(report.exit_codes, vec![(Tid::new(0), Some(3))]);
        assert_eq!(report.retired, 1);
    }

    #[test]
    fn exit_discards_and_retires_once() {
        let mut core = core_with(2);
        core.plan(Cause::Boot).unwrap();
        assert_eq!(
            core.plan(Cause::Exit(0)),
            Ok(Switch::Mount {
                save: Save::Discard,
                next: Tid::new(1)
            })
        );
        assert_eq!(state(&core, 0), ThreadState::Terminated);
        core.finish_switch().unwrap();
        assert!(core.thread(Tid::new(0)).is_err());
        // A second finish has nothing to retire.
        core.finish_switch().unwrap();
        assert_eq!(core.report().retired, 1);
        assert_eq!(core.retire(Tid::new(0)), Err(RuntimeError::NoSuchThread));
    }

    #[test]
    fn running_thread_cannot_be_retired() {
        let mut core = core_with(1);
        core.plan(Cause::Boot).unwrap();
        assert_eq!(
            core.retire(Tid::new(0)),
            Err(RuntimeError::MismatchedContextOperation {
                tid: Tid::new(0),
                state: ThreadState::Running
            })
        );
    }

    #[test]
    fn queued_terminated_thread_is_rejected() {
        let mut core = core_with(2);
        core.plan(Cause::Boot).unwrap();
        core.plan(Cause::Exit(0)).unwrap();
        // Smuggle the zombie back into the queue.
        core.scheduler.push_to_queue(Tid::new(0)).unwrap();
        assert_eq!(
            core.plan(Cause::Preempt),
            Err(RuntimeError::MismatchedContextOperation {
                tid: Tid::new(0),
                state: ThreadState::Terminated
            })
        );
    }

    #[test]
    fn spawn_beyond_capacity_fails() {
        let mut core = core_with(0);
        for _ in 0..QUEUE_CAPACITY - 1 {
            core.spawn(|tid| Thread::new(tid, "t", crate::thread::MIN_STACK_SIZE, || 0))
                .unwrap();
        }
        assert_eq!(
            core.spawn(|tid| Thread::new(tid, "t", crate::thread::MIN_STACK_SIZE, || 0)),
            Err(RuntimeError::QueueFull)
        );
    }

    /// Tests the stack integrity check on a switch away from a thread.
    ///
    /// This test ensures that:
    /// - A thread whose stack magic was overwritten is reported as
    ///   overflowed instead of being captured.
    #[test]
    fn clobbered_magic_is_reported() {
        let dispatcher = Dispatcher::new(None);
        for _ in 0..2 {
            dispatcher
                .spawn(|tid| Thread::new(tid, "t", STACK_SIZE, || 0))
                .unwrap();
        }
        let mut core = dispatcher.core.lock();
        core.plan(Cause::Boot).unwrap();
        let floor = core.thread(Tid::new(0)).unwrap().stack.start();
        unsafe { (floor as *mut usize).write(0) };
        assert!(!core.thread(Tid::new(0)).unwrap().stack.is_intact());

        let switch = core.plan(Cause::Preempt).unwrap();
        let result = dispatcher.prepare(&mut core, switch).err();
        core.unlock();
        assert_eq!(result, Some(RuntimeError::StackOverflow(Tid::new(0))));
    }

    /// Tests that a cooperative switch starts a fresh quantum.
    ///
    /// This test ensures that:
    /// - `schedule` re-arms the timer for a yield.
    #[test]
    fn yield_rearms_timer() {
        use abyss::timer::Clock;
        use core::time::Duration;

        let mut dispatcher = Dispatcher::new(None);
        let timer = Timer::new(Clock::Monotonic, Duration::from_secs(10)).unwrap();
        dispatcher.set_timer(timer);
        let _guard = InterruptGuard::new();
        let timer = dispatcher.timer().unwrap();
        assert_eq!(timer.remaining(), Ok(Duration::ZERO));

        dispatcher.schedule(Cause::Yield);
        assert!(timer.remaining().unwrap() > Duration::from_secs(9));
        timer.disarm().unwrap();
    }

    /// Tests random sequences of dispatcher invocations.
    ///
    /// This test ensures that:
    /// - Threads run in the order a FIFO ready queue dictates.
    /// - Every observed state change is an allowed transition.
    /// - At most one thread runs, and every terminated thread is retired
    ///   exactly once.
    #[test]
    fn random_dispatch_sequences() {
        use std::collections::VecDeque;

        let mut rng = StdRng::seed_from_u64(0xd15);
        for _ in 0..20 {
            let n = rng.gen_range(1..8);
            let mut core = core_with(n);
            let mut queue: VecDeque<usize> = (0..n).collect();
            let mut running: Option<usize> = None;
            let mut seen = vec![Some(ThreadState::NotStarted); n];

            let mut cause = Cause::Boot;
            loop {
                let switch = core.plan(cause).unwrap();
                match cause {
                    Cause::Boot => running = queue.pop_front(),
                    Cause::Exit(_) => running = queue.pop_front(),
                    _ => {
                        if let Some(next) = queue.pop_front() {
                            queue.extend(running.replace(next));
                        }
                    }
                }
                core.finish_switch().unwrap();
                assert_eq!(core.running().map(Tid::index), running);

                for (i, seen) in seen.iter_mut().enumerate() {
                    let now = core.thread(Tid::new(i)).ok().map(Thread::state);
                    let legal = match (*seen, now) {
                        (a, b) if a == b => true,
                        (Some(a), Some(b)) => {
                            a.can_transition_to(b)
                                // A preemption passes through `Ready` inside a
                                // single plan.
                                || (a == ThreadState::Running && b == ThreadState::Suspended)
                        }
                        // Terminated and retired by the same switch.
                        (Some(ThreadState::Running | ThreadState::Terminated), None) => true,
                        _ => false,
                    };
                    assert!(legal, "thread {i}: {seen:?} -> {now:?}");
                    *seen = now;
                }
                let on_cpu = seen
                    .iter()
                    .filter(|s| **s == Some(ThreadState::Running))
                    .count();
                assert_eq!(on_cpu, usize::from(running.is_some()));

                if switch == Switch::Shutdown {
                    break;
                }
                cause = match rng.gen_range(0..4) {
                    0 => Cause::Exit(rng.gen_range(-5..5)),
                    1 => Cause::Yield,
                    _ => Cause::Preempt,
                };
            }
            assert!(seen.iter().all(Option::is_none));
            assert_eq!(core.report().retired, n);
            assert_eq!(core.scheduler.next_to_run(), Err(QueueEmpty));
        }
    }
}
