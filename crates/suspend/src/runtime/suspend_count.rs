//! Suspend counters.
//!
//! Every thread carries two counters: `suspend_count`, the number of
//! outstanding requests to keep it parked, and `dbg_suspend_count`, the part of
//! those requests that came from the debugger. The counters live in atomics so
//! the owning thread can poll them without a lock, but they are only ever
//! written through [`adjust_suspend_counts`], which needs the
//! [`SuspendCounts`] guarded by the suspend-count lock.

use std::sync::atomic::Ordering;

use super::{interp_break::SubMode, threads::Thread};

/// Process-wide suspension state, guarded by the suspend-count lock.
///
/// Only the lock owns one; it cannot be built outside this crate.
///
/// ```compile_fail
/// let _ = vmkit_suspend::runtime::suspend_count::SuspendCounts::default();
/// ```
///
/// ```compile_fail
/// let _ = vmkit_suspend::runtime::suspend_count::SuspendCounts::new();
/// ```
#[derive(Debug)]
pub struct SuspendCounts {
    /// Sum of `suspend_count` over every attached thread.
    sum: i32,
    /// Number of suspend-all operations currently in force.
    all_depth: i32,
    /// Part of `all_depth` coming from debugger suspends.
    all_dbg_depth: i32,
}

impl SuspendCounts {
    pub(crate) const fn new() -> Self {
        Self {
            sum: 0,
            all_depth: 0,
            all_dbg_depth: 0,
        }
    }

    /// Cheap "is anybody suspended" probe.
    pub fn sum(&self) -> i32 {
        self.sum
    }

    /// Counts a thread attaching right now has to start with.
    pub fn global_depth(&self) -> (i32, i32) {
        (self.all_depth, self.all_dbg_depth)
    }

    pub(crate) fn enter_suspend_all(&mut self, debug: bool) {
        self.all_depth += 1;
        if debug {
            self.all_dbg_depth += 1;
        }
    }

    /// Undo one [`enter_suspend_all`](Self::enter_suspend_all). A debug leave
    /// only consumes a debug suspend-all.
    pub(crate) fn leave_suspend_all(&mut self, debug: bool) {
        if debug {
            if self.all_dbg_depth > 0 {
                self.all_dbg_depth -= 1;
                self.all_depth -= 1;
            }
        } else if self.all_depth > self.all_dbg_depth {
            self.all_depth -= 1;
        }
    }

    pub(crate) fn clear_debug_depth(&mut self) {
        self.all_depth -= self.all_dbg_depth;
        self.all_dbg_depth = 0;
    }
}

/// Add `delta` to the thread's suspend count and `dbg_delta` to its debugger
/// count, and keep `SUSPEND_PENDING` in its control word in step with the
/// result.
///
/// This is the only place suspend counters are written. Taking `&mut
/// SuspendCounts` proves the caller holds the suspend-count lock.
///
/// ```compile_fail
/// use vmkit_suspend::runtime::suspend_count::adjust_suspend_counts;
/// ```
pub(crate) fn adjust_suspend_counts(counts: &mut SuspendCounts, thread: &Thread, delta: i32, dbg_delta: i32) {
    let suspend = thread.suspend_count.load(Ordering::Relaxed) + delta;
    let dbg = thread.dbg_suspend_count.load(Ordering::Relaxed) + dbg_delta;

    assert!(
        0 <= dbg && dbg <= suspend,
        "{}: bad suspend counts: suspend={} dbg={} (delta {}, {})",
        thread,
        suspend,
        dbg,
        delta,
        dbg_delta
    );

    // The stores are SeqCst: paired with the SeqCst status store in
    // `change_status`, either the target sees the new count or the requester
    // sees the target RUNNING.
    thread.suspend_count.store(suspend, Ordering::SeqCst);
    thread.dbg_suspend_count.store(dbg, Ordering::SeqCst);
    counts.sum += delta;
    debug_assert!(counts.sum >= 0, "negative process-wide suspend count");

    if suspend != 0 {
        thread
            .interp_break
            .update(SubMode::SUSPEND_PENDING, SubMode::empty());
    } else {
        thread
            .interp_break
            .update(SubMode::empty(), SubMode::SUSPEND_PENDING);
    }
}
