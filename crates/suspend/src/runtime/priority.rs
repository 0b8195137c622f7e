//! Scheduling priority of native threads.
//!
//! A thread that will not reach a safe point is sometimes just starved: it
//! runs in the background cgroup or at a high nice value while the requester
//! sleeps. The quiescence waiter temporarily moves such a thread back to
//! normal priority and restores it afterwards.

use std::io;

use crate::{error::Error, Result};

const NORMAL_PRIORITY: i32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SchedPolicy {
    Foreground,
    Background,
}

/// Access to OS scheduling knobs, keyed by system thread id.
pub trait PriorityControl: Send + Sync {
    /// Nice value of `tid`.
    fn priority(&self, tid: i32) -> Result<i32>;
    fn set_priority(&self, tid: i32, nice: i32) -> Result<()>;
    fn policy(&self, tid: i32) -> Result<SchedPolicy>;
    fn set_policy(&self, tid: i32, policy: SchedPolicy) -> Result<()>;
}

impl<T: PriorityControl + ?Sized> PriorityControl for std::sync::Arc<T> {
    fn priority(&self, tid: i32) -> Result<i32> {
        (**self).priority(tid)
    }

    fn set_priority(&self, tid: i32, nice: i32) -> Result<()> {
        (**self).set_priority(tid, nice)
    }

    fn policy(&self, tid: i32) -> Result<SchedPolicy> {
        (**self).policy(tid)
    }

    fn set_policy(&self, tid: i32, policy: SchedPolicy) -> Result<()> {
        (**self).set_policy(tid, policy)
    }
}

fn os_error(tid: i32, err: errno::Errno) -> Error {
    Error::Priority {
        tid,
        source: io::Error::from_raw_os_error(err.0),
    }
}

/// [`PriorityControl`] backed by `getpriority(2)` and `sched_setscheduler(2)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsPriority;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        impl PriorityControl for OsPriority {
            fn priority(&self, tid: i32) -> Result<i32> {
                // -1 is a valid nice value, errno tells the two apart
                errno::set_errno(errno::Errno(0));
                let nice = unsafe { libc::getpriority(libc::PRIO_PROCESS, tid as libc::id_t) };
                let err = errno::errno();
                if nice == -1 && err.0 != 0 {
                    return Err(os_error(tid, err));
                }
                Ok(nice)
            }

            fn set_priority(&self, tid: i32, nice: i32) -> Result<()> {
                if unsafe { libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, nice) } != 0 {
                    return Err(os_error(tid, errno::errno()));
                }
                Ok(())
            }

            fn policy(&self, tid: i32) -> Result<SchedPolicy> {
                let policy = unsafe { libc::sched_getscheduler(tid) };
                match policy {
                    -1 => Err(os_error(tid, errno::errno())),
                    libc::SCHED_IDLE | libc::SCHED_BATCH => Ok(SchedPolicy::Background),
                    _ => Ok(SchedPolicy::Foreground),
                }
            }

            fn set_policy(&self, tid: i32, policy: SchedPolicy) -> Result<()> {
                let param = libc::sched_param { sched_priority: 0 };
                let policy = match policy {
                    SchedPolicy::Foreground => libc::SCHED_OTHER,
                    SchedPolicy::Background => libc::SCHED_BATCH,
                };
                if unsafe { libc::sched_setscheduler(tid, policy, &param) } != 0 {
                    return Err(os_error(tid, errno::errno()));
                }
                Ok(())
            }
        }
    } else {
        impl PriorityControl for OsPriority {
            fn priority(&self, tid: i32) -> Result<i32> {
                Err(unsupported(tid))
            }

            fn set_priority(&self, tid: i32, _nice: i32) -> Result<()> {
                Err(unsupported(tid))
            }

            fn policy(&self, tid: i32) -> Result<SchedPolicy> {
                Err(unsupported(tid))
            }

            fn set_policy(&self, tid: i32, _policy: SchedPolicy) -> Result<()> {
                Err(unsupported(tid))
            }
        }

        fn unsupported(tid: i32) -> Error {
            Error::Priority {
                tid,
                source: io::Error::from(io::ErrorKind::Unsupported),
            }
        }
    }
}

/// What [`raise_priority_if_needed`] changed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PriorityChange {
    pub saved_policy: Option<SchedPolicy>,
    pub saved_priority: Option<i32>,
}

impl PriorityChange {
    pub fn is_empty(&self) -> bool {
        self.saved_policy.is_none() && self.saved_priority.is_none()
    }
}

/// Move `tid` to the foreground at normal priority if it runs below normal.
/// Failures are logged and leave the thread as it was.
pub fn raise_priority_if_needed(control: &dyn PriorityControl, tid: i32) -> PriorityChange {
    let mut change = PriorityChange::default();

    let priority = match control.priority(tid) {
        Ok(priority) => priority,
        Err(err) => {
            log::warn!(target: "vmkit::priority", "{}", err);
            return change;
        }
    };

    if priority <= NORMAL_PRIORITY {
        return change;
    }

    match control.policy(tid) {
        Ok(SchedPolicy::Background) => match control.set_policy(tid, SchedPolicy::Foreground) {
            Ok(()) => {
                change.saved_policy = Some(SchedPolicy::Background);
                log::debug!(target: "vmkit::priority", "Temporarily moving tid {} to fg", tid);
            }
            Err(err) => log::warn!(target: "vmkit::priority", "{}", err),
        },
        Ok(SchedPolicy::Foreground) => (),
        Err(err) => log::warn!(target: "vmkit::priority", "{}", err),
    }

    match control.set_priority(tid, NORMAL_PRIORITY) {
        Ok(()) => {
            change.saved_priority = Some(priority);
            log::debug!(
                target: "vmkit::priority",
                "Temporarily raised priority on tid {} ({} -> {})",
                tid,
                priority,
                NORMAL_PRIORITY
            );
        }
        Err(err) => log::warn!(target: "vmkit::priority", "{}", err),
    }

    change
}

/// Undo a [`raise_priority_if_needed`].
pub fn reset_priority(control: &dyn PriorityControl, tid: i32, change: PriorityChange) {
    if let Some(policy) = change.saved_policy {
        match control.set_policy(tid, policy) {
            Ok(()) => log::debug!(target: "vmkit::priority", "Restored policy of {} to {}", tid, policy),
            Err(err) => log::warn!(target: "vmkit::priority", "{}", err),
        }
    }

    if let Some(priority) = change.saved_priority {
        match control.set_priority(tid, priority) {
            Ok(()) => log::debug!(target: "vmkit::priority", "Restored priority of {} to {}", tid, priority),
            Err(err) => log::warn!(target: "vmkit::priority", "{}", err),
        }
    }
}
