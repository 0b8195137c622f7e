//! Simple MockVM and deterministic collaborators used in tests

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::runtime::{
    priority::{PriorityControl, SchedPolicy},
    quiescence::{Clock, TimeoutAction, TimeoutReport},
    threads::{SuspendEvent, Thread},
    Runtime, RuntimeBuilder, RuntimeState,
};

/// Runtime that records every hook invocation.
#[derive(Default)]
pub struct MockVM {
    events: Mutex<Vec<(u32, SuspendEvent)>>,
    debugger_notifications: Mutex<Vec<u32>>,
    unchain_requests: Mutex<usize>,
}

impl MockVM {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events_of(&self, thread: u32) -> Vec<SuspendEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(id, _)| *id == thread)
            .map(|(_, event)| *event)
            .collect()
    }

    pub fn debugger_notifications(&self) -> Vec<u32> {
        self.debugger_notifications.lock().clone()
    }

    pub fn unchain_requests(&self) -> usize {
        *self.unchain_requests.lock()
    }
}

impl Runtime for MockVM {
    fn dump_thread(&self, thread: &Thread) -> String {
        format!("at mock.Frame.run(thread {})", thread.id())
    }

    fn jit_unchain(&self, _target: &Thread) -> bool {
        *self.unchain_requests.lock() += 1;
        true
    }

    fn debugger_suspended(&self, thread: &Thread) {
        self.debugger_notifications.lock().push(thread.id());
    }

    fn trace(&self, thread: &Thread, event: SuspendEvent) {
        self.events.lock().push((thread.id(), event));
    }
}

/// Runtime state over a [`MockVM`] whose timeouts are reported instead of
/// aborting the test process.
pub fn test_runtime(vm: MockVM) -> Arc<RuntimeState<MockVM>> {
    let _ = env_logger::builder().is_test(true).try_init();

    RuntimeBuilder::new(vm)
        .priority(MockPriority::new(0, SchedPolicy::Foreground))
        .on_timeout(RecordingTimeout::new())
        .build()
        .expect("default suspend options are valid")
}

/// Poll `condition` until it holds. Panics after ten seconds.
pub fn wait_until(mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "condition not reached in time"
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}

type SleepHook = Box<dyn Fn(Duration) + Send + Sync>;

/// Clock that only moves when slept on.
#[derive(Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
    yields: Mutex<usize>,
    hook: Mutex<Option<SleepHook>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `hook` after every sleep.
    pub fn set_hook(&self, hook: impl Fn(Duration) + Send + Sync + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    pub fn yields(&self) -> usize {
        *self.yields.lock()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) {
        *self.now.lock() += duration;
        self.sleeps.lock().push(duration);
        if let Some(hook) = &*self.hook.lock() {
            hook(duration);
        }
    }

    fn yield_now(&self) {
        *self.yields.lock() += 1;
    }
}

/// Timeout action that keeps the reports and lets the request fail.
#[derive(Default)]
pub struct RecordingTimeout {
    reports: Mutex<Vec<TimeoutReport>>,
}

impl RecordingTimeout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<TimeoutReport> {
        self.reports.lock().clone()
    }
}

impl TimeoutAction for RecordingTimeout {
    fn on_timeout(&self, report: &TimeoutReport) {
        log::error!(target: "vmkit::quiescence", "timeout: {}", report.to_error());
        self.reports.lock().push(report.clone());
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PriorityCall {
    SetPriority(i32),
    SetPolicy(SchedPolicy),
}

/// In-memory nice value and policy shared by every thread id.
pub struct MockPriority {
    state: Mutex<(i32, SchedPolicy)>,
    history: Mutex<Vec<PriorityCall>>,
    failing: bool,
}

impl MockPriority {
    pub fn new(nice: i32, policy: SchedPolicy) -> Self {
        Self {
            state: Mutex::new((nice, policy)),
            history: Mutex::new(Vec::new()),
            failing: false,
        }
    }

    /// Every call fails with `EPERM`.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::new(10, SchedPolicy::Background)
        }
    }

    pub fn state(&self) -> (i32, SchedPolicy) {
        *self.state.lock()
    }

    /// Setter calls, oldest first.
    pub fn history(&self) -> Vec<PriorityCall> {
        self.history.lock().clone()
    }

    fn check(&self, tid: i32) -> crate::Result<()> {
        if self.failing {
            return Err(crate::Error::Priority {
                tid,
                source: std::io::Error::from_raw_os_error(libc::EPERM),
            });
        }
        Ok(())
    }
}

impl PriorityControl for MockPriority {
    fn priority(&self, tid: i32) -> crate::Result<i32> {
        self.check(tid)?;
        Ok(self.state.lock().0)
    }

    fn set_priority(&self, tid: i32, nice: i32) -> crate::Result<()> {
        self.check(tid)?;
        self.history.lock().push(PriorityCall::SetPriority(nice));
        self.state.lock().0 = nice;
        Ok(())
    }

    fn policy(&self, tid: i32) -> crate::Result<SchedPolicy> {
        self.check(tid)?;
        Ok(self.state.lock().1)
    }

    fn set_policy(&self, tid: i32, policy: SchedPolicy) -> crate::Result<()> {
        self.check(tid)?;
        self.history.lock().push(PriorityCall::SetPolicy(policy));
        self.state.lock().1 = policy;
        Ok(())
    }
}
