use crate::runtime::{
    threads::{Thread, ThreadStatus},
    Runtime, RuntimeState,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    ops::{Deref, DerefMut},
    time::Duration,
};

/// A monitor is a mutex paired with a condition variable.
///
/// Besides the plain acquire, a monitor can be entered "with handshake": the
/// acquiring thread advertises itself as `VMWAIT` while it blocks, so a
/// suspend-all that holds the lock never waits on a thread that is only
/// waiting for that same lock.
pub struct Monitor<T> {
    lock: Mutex<T>,
    cvar: Condvar,
}

impl<T> Monitor<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: Mutex::new(value),
            cvar: Condvar::new(),
        }
    }

    pub fn lock_no_handshake(&self) -> MonitorGuard<'_, T> {
        MonitorGuard {
            guard: self.lock.lock(),
            monitor: self,
        }
    }

    pub fn try_lock_no_handshake(&self) -> Option<MonitorGuard<'_, T>> {
        self.lock.try_lock().map(|guard| MonitorGuard {
            guard,
            monitor: self,
        })
    }

    /// Acquire the monitor on behalf of `thread`, which must be the calling
    /// thread.
    ///
    /// A thread that was `RUNNING` and picked up a suspend request while
    /// blocked does not return holding the lock: it releases it, honours the
    /// request and tries again. Otherwise a suspend-all that has just released
    /// this lock would let it continue running managed code.
    pub fn lock_with_handshake<R: Runtime>(
        &self,
        vm: &RuntimeState<R>,
        thread: &Thread,
    ) -> MonitorGuard<'_, T> {
        let prior = thread.status();
        loop {
            vm.change_status(thread, ThreadStatus::VmWait);
            let guard = self.lock.lock();

            // publish RUNNING before looking at the count, same as `change_status`
            thread.store_status(prior);
            if prior != ThreadStatus::Running || !thread.has_pending_suspend() {
                return MonitorGuard {
                    guard,
                    monitor: self,
                };
            }

            thread.store_status(ThreadStatus::VmWait);
            drop(guard);
            vm.change_status(thread, ThreadStatus::Running);
        }
    }

    pub fn notify_all(&self) {
        self.cvar.notify_all();
    }

    pub fn notify_one(&self) {
        self.cvar.notify_one();
    }
}

pub struct MonitorGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    monitor: &'a Monitor<T>,
}

impl<'a, T> MonitorGuard<'a, T> {
    pub fn monitor(&self) -> &'a Monitor<T> {
        self.monitor
    }

    /// Wait on the condition variable. The caller is responsible for its own
    /// status while parked.
    pub fn wait_no_handshake(&mut self) {
        self.monitor.cvar.wait(&mut self.guard);
    }

    /// Returns `true` if the wait timed out.
    pub fn wait_for(&mut self, timeout: Duration) -> bool {
        self.monitor.cvar.wait_for(&mut self.guard, timeout).timed_out()
    }
}

impl<T> Deref for MonitorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for MonitorGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}
