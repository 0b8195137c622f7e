//! Waiting for a suspend target to leave `RUNNING`.
//!
//! The requester sleeps in rounds. The first round is short; after it every
//! round is longer, the target's priority is corrected and the JIT is asked
//! to unchain compiled code so the target falls back to a safe point. A target
//! that is still running after the last round is a runtime bug: all threads
//! are dumped and the [`TimeoutAction`] runs, which by default aborts.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use super::{
    priority::{raise_priority_if_needed, reset_priority, PriorityChange, PriorityControl},
    suspend::SuspendCause,
    threads::{format_thread, format_threads, Thread},
    Runtime,
};
use crate::{error::Error, options::SuspendOptions, Result};

/// Monotonic time source and sleep primitive used by the waiter.
pub trait Clock: Send + Sync {
    /// Time since an arbitrary fixed origin.
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);
    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now(&self) -> Duration {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }

    fn yield_now(&self) {
        (**self).yield_now()
    }
}

pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SleepSchedule {
    /// Length of the first round.
    pub first_sleep: Duration,
    /// Length of every later round.
    pub more_sleep: Duration,
    /// First back-off step within a round.
    pub min_sleep: Duration,
    pub max_retries: u32,
    /// Round after which a starved target gets its priority raised.
    pub boost_after_retries: u32,
}

impl From<&SuspendOptions> for SleepSchedule {
    fn from(options: &SuspendOptions) -> Self {
        Self {
            first_sleep: options.first_sleep,
            more_sleep: options.more_sleep,
            min_sleep: options.min_sleep,
            max_retries: options.max_retries,
            boost_after_retries: options.boost_after_retries,
        }
    }
}

impl Default for SleepSchedule {
    fn default() -> Self {
        Self::from(&SuspendOptions::default())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    /// A suspend target never left `RUNNING`.
    Wedged { target: u32, retries: u32 },
    /// The thread-suspend lock could not be acquired.
    SuspendLock { cause: SuspendCause },
}

/// What the timeout action gets to see.
#[derive(Clone, Debug)]
pub struct TimeoutReport {
    pub requester: u32,
    pub kind: TimeoutKind,
    /// Dump of every attached thread.
    pub dump: String,
}

impl TimeoutReport {
    pub fn to_error(&self) -> Error {
        match self.kind {
            TimeoutKind::Wedged { target, retries } => Error::Wedged {
                requester: self.requester,
                target,
                retries,
            },
            TimeoutKind::SuspendLock { cause } => Error::SuspendLockTimeout {
                requester: self.requester,
                cause,
            },
        }
    }
}

/// Runs when a suspend cannot complete. Production actions do not return.
pub trait TimeoutAction: Send + Sync {
    fn on_timeout(&self, report: &TimeoutReport);
}

impl<T: TimeoutAction + ?Sized> TimeoutAction for Arc<T> {
    fn on_timeout(&self, report: &TimeoutReport) {
        (**self).on_timeout(report)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AbortOnTimeout;

impl TimeoutAction for AbortOnTimeout {
    fn on_timeout(&self, report: &TimeoutReport) {
        log::error!(target: "vmkit::quiescence", "{}", report.dump);
        log::error!(target: "vmkit::quiescence", "{}, giving up", report.to_error());
        std::process::abort();
    }
}

pub struct QuiescenceWaiter {
    schedule: SleepSchedule,
    clock: Box<dyn Clock>,
    priority: Box<dyn PriorityControl>,
    timeout: Box<dyn TimeoutAction>,
}

impl QuiescenceWaiter {
    pub fn new(
        schedule: SleepSchedule,
        clock: Box<dyn Clock>,
        priority: Box<dyn PriorityControl>,
        timeout: Box<dyn TimeoutAction>,
    ) -> Self {
        Self {
            schedule,
            clock,
            priority,
            timeout,
        }
    }

    pub fn schedule(&self) -> &SleepSchedule {
        &self.schedule
    }

    pub fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    /// One step of a back-off round that started at `start` and may last
    /// `max_total`. Iteration 0 only yields; later iterations sleep
    /// `min_sleep` doubled every time, clipped to the end of the round.
    /// Returns `false` once the round is over.
    pub fn iterative_sleep(&self, iteration: u32, max_total: Duration, start: Duration) -> bool {
        let now = self.clock.now();
        let deadline = start + max_total;
        if now >= deadline {
            return false;
        }

        if iteration == 0 {
            self.clock.yield_now();
            return true;
        }

        let delay = self
            .schedule
            .min_sleep
            .saturating_mul(1u32.checked_shl(iteration - 1).unwrap_or(u32::MAX))
            .min(deadline - now);
        self.clock.sleep(delay);
        true
    }

    /// Run the timeout action. If it returns, the failure is handed back to the
    /// caller as an error.
    pub(crate) fn timed_out(&self, report: TimeoutReport) -> Error {
        self.timeout.on_timeout(&report);
        report.to_error()
    }

    /// Block until `target` is no longer `RUNNING`.
    ///
    /// `threads` is the thread list, which the caller holds locked.
    pub fn wait_for_quiescence<R: Runtime>(
        &self,
        runtime: &R,
        requester: &Thread,
        target: &Thread,
        threads: &[Arc<Thread>],
    ) -> Result<()> {
        let schedule = &self.schedule;
        let mut spin_sleep = schedule.first_sleep;
        let mut complained = false;
        let mut priority_change = PriorityChange::default();
        let mut sleep_iter = 0;
        let mut retry_count = 0;
        let mut start = Duration::ZERO;
        let mut first_start = None;

        while target.status().is_running() {
            if sleep_iter == 0 {
                start = self.clock.now();
                if first_start.is_none() {
                    first_start = Some(start);
                }

                if retry_count == schedule.boost_after_retries {
                    priority_change = raise_priority_if_needed(&*self.priority, target.system_tid());
                }
            }

            if retry_count > 0 && runtime.jit_unchain(target) {
                log::debug!(target: "vmkit::quiescence", "JIT unchain all for {}", target);
            }

            if !self.iterative_sleep(sleep_iter, spin_sleep, start) {
                sleep_iter = 0;
                if spin_sleep != schedule.first_sleep {
                    log::warn!(
                        target: "vmkit::quiescence",
                        "threadid={}: spin on suspend #{} threadid={} ({:?})",
                        requester.id(),
                        retry_count,
                        target.id(),
                        priority_change
                    );
                    if retry_count > 1 {
                        log::warn!(target: "vmkit::quiescence", "{}", format_thread(runtime, target));
                    }
                    complained = true;
                }

                spin_sleep = schedule.more_sleep;

                if retry_count == schedule.max_retries {
                    log::error!(target: "vmkit::quiescence", "Fatal spin-on-suspend, dumping threads");
                    let error = self.timed_out(TimeoutReport {
                        requester: requester.id(),
                        kind: TimeoutKind::Wedged {
                            target: target.id(),
                            retries: retry_count,
                        },
                        dump: format_threads(runtime, threads),
                    });
                    reset_priority(&*self.priority, target.system_tid(), priority_change);
                    return Err(error);
                }
                retry_count += 1;
            } else {
                sleep_iter += 1;
            }
        }

        if complained {
            if let Some(first_start) = first_start {
                log::warn!(
                    target: "vmkit::quiescence",
                    "threadid={}: spin on suspend resolved in {} msec",
                    requester.id(),
                    (self.clock.now() - first_start).as_millis()
                );
            }
        }

        if !priority_change.is_empty() {
            reset_priority(&*self.priority, target.system_tid(), priority_change);
        }
        Ok(())
    }
}
