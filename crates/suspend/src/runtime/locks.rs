//! The three locks of the suspend machinery.
//!
//! Acquisition order is `suspend_request` (only ever try-locked), then
//! `thread_list`, then `suspend_count`. The suspend-count lock is held only for
//! short, non-blocking sections, except by a thread parked in a full suspend
//! check, which waits on its condition variable.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::{suspend_count::SuspendCounts, threads::Thread};
use crate::sync::Monitor;

/// Attached threads. The condition variable of the list monitor is signalled
/// whenever a thread detaches.
#[derive(Default)]
pub struct ThreadList {
    threads: Vec<Arc<Thread>>,
}

impl ThreadList {
    pub const fn new() -> Self {
        Self {
            threads: Vec::new(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Thread>> {
        self.threads.iter()
    }

    pub fn as_slice(&self) -> &[Arc<Thread>] {
        &self.threads
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn contains(&self, thread: &Thread) -> bool {
        self.threads
            .get(thread.index_in_thread_list())
            .is_some_and(|linked| std::ptr::eq(&**linked, thread))
    }

    pub(crate) fn add(&mut self, thread: Arc<Thread>) {
        thread.set_index_in_thread_list(self.threads.len());
        self.threads.push(thread);
    }

    /// Swap-remove `thread`. Returns `false` if it was not linked.
    pub(crate) fn remove(&mut self, thread: &Thread) -> bool {
        if !self.contains(thread) {
            return false;
        }

        let idx = thread.index_in_thread_list();

        self.threads.swap_remove(idx);
        if let Some(moved) = self.threads.get(idx) {
            moved.set_index_in_thread_list(idx);
        }
        true
    }
}

pub struct LockTriad {
    /// Guards list membership and cross-thread field access.
    pub thread_list: Monitor<ThreadList>,
    /// Serializes suspend-all, resume-all and undo.
    pub suspend_request: Mutex<()>,
    /// Guards every suspend counter. Its condition variable is the resume
    /// signal.
    pub suspend_count: Monitor<SuspendCounts>,
}

impl LockTriad {
    pub const fn new() -> Self {
        Self {
            thread_list: Monitor::new(ThreadList::new()),
            suspend_request: Mutex::new(()),
            suspend_count: Monitor::new(SuspendCounts::new()),
        }
    }

    pub fn try_lock_suspend_request(&self) -> Option<MutexGuard<'_, ()>> {
        self.suspend_request.try_lock()
    }
}

impl Default for LockTriad {
    fn default() -> Self {
        Self::new()
    }
}
