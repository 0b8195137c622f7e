use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use locks::LockTriad;
use priority::{OsPriority, PriorityControl};
use quiescence::{AbortOnTimeout, Clock, MonotonicClock, QuiescenceWaiter, SleepSchedule, TimeoutAction};
use threads::{SuspendEvent, Thread};

use crate::{options::SuspendOptions, Result};

pub mod interp_break;
pub mod locks;
pub mod priority;
pub mod quiescence;
pub mod safepoint;
pub mod suspend;
pub mod suspend_count;
pub mod threads;

/// Hooks the embedding runtime provides to the suspend machinery.
pub trait Runtime: 'static + Send + Sync {
    /// Extra lines for a thread dump, typically a managed stack trace.
    fn dump_thread(&self, _thread: &Thread) -> String {
        String::new()
    }

    /// Invalidate chained compiled code so `target` drops back to a safe
    /// point sooner. Returns `true` if anything was unchained.
    fn jit_unchain(&self, _target: &Thread) -> bool {
        false
    }

    /// `thread` is asleep after suspending itself on behalf of the debugger.
    /// Called with the suspend-count lock held, so the debugger cannot resume
    /// it before it is fully parked.
    fn debugger_suspended(&self, _thread: &Thread) {}

    /// Instrumentation of status changes and suspend checks.
    fn trace(&self, _thread: &Thread, _event: SuspendEvent) {}
}

/// Process-wide suspension state: the thread list, the three suspend locks
/// and the waiter used by suspend requests.
///
/// It must outlive every attached thread.
pub struct RuntimeState<R: Runtime> {
    pub(crate) runtime: R,
    pub(crate) locks: LockTriad,
    pub(crate) waiter: QuiescenceWaiter,
    pub(crate) options: SuspendOptions,
    next_thread_id: AtomicU32,
    /// Id of the debugger-connection thread, `0` if none.
    pub(crate) debugger_thread: AtomicU32,
}

impl<R: Runtime> RuntimeState<R> {
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn options(&self) -> &SuspendOptions {
        &self.options
    }

    pub fn waiter(&self) -> &QuiescenceWaiter {
        &self.waiter
    }

    pub(crate) fn next_thread_id(&self) -> u32 {
        self.next_thread_id.fetch_add(1, Ordering::Relaxed)
    }
}

pub struct RuntimeBuilder<R: Runtime> {
    runtime: R,
    options: SuspendOptions,
    clock: Box<dyn Clock>,
    priority: Box<dyn PriorityControl>,
    timeout: Box<dyn TimeoutAction>,
}

impl<R: Runtime> RuntimeBuilder<R> {
    pub fn new(runtime: R) -> Self {
        Self {
            runtime,
            options: SuspendOptions::default(),
            clock: Box::new(MonotonicClock::new()),
            priority: Box::new(OsPriority),
            timeout: Box::new(AbortOnTimeout),
        }
    }

    /// Take the options from the `SuspendFlags` group.
    pub fn from_options(mut self) -> Result<Self> {
        self.options = SuspendOptions::from_flags()?;
        Ok(self)
    }

    pub fn options(mut self, options: SuspendOptions) -> Self {
        self.options = options;
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn priority(mut self, priority: impl PriorityControl + 'static) -> Self {
        self.priority = Box::new(priority);
        self
    }

    /// Replace the action taken when a suspend cannot complete. The default
    /// aborts the process.
    pub fn on_timeout(mut self, action: impl TimeoutAction + 'static) -> Self {
        self.timeout = Box::new(action);
        self
    }

    pub fn build(self) -> Result<Arc<RuntimeState<R>>> {
        self.options.validate()?;

        Ok(Arc::new(RuntimeState {
            runtime: self.runtime,
            locks: LockTriad::new(),
            waiter: QuiescenceWaiter::new(
                SleepSchedule::from(&self.options),
                self.clock,
                self.priority,
                self.timeout,
            ),
            options: self.options,
            // 0 means "no thread"
            next_thread_id: AtomicU32::new(1),
            debugger_thread: AtomicU32::new(0),
        }))
    }
}
