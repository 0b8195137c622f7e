use std::{
    fmt::{self, Write as _},
    sync::{
        atomic::{AtomicI32, AtomicUsize, Ordering},
        Arc,
    },
    thread::{JoinHandle, ThreadId},
};

use atomic::Atomic;
use parking_lot::Mutex;

use super::{
    interp_break::{BreakFlags, InterpBreak, InterpBreakCell, SubMode},
    safepoint::CallbackSlot,
    suspend_count::adjust_suspend_counts,
    Runtime, RuntimeState,
};
use crate::{error::Error, Result};

/// Thread status as seen by the suspend machinery.
///
/// Every status except `Running` means the thread is not touching managed
/// state, either because it has left managed code or because it is parked.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreadStatus {
    /// Allocated, not yet linked into the thread list.
    #[default]
    Initializing,
    /// Linked, not yet running managed code.
    Starting,
    /// Running managed code. The only status a suspend-all waits on.
    Running,
    /// Blocked inside the runtime, e.g. waiting for one of its locks.
    #[strum(serialize = "VMWAIT")]
    VmWait,
    /// Running native code.
    Native,
    /// Blocked on a managed monitor.
    Monitor,
    Wait,
    TimedWait,
    /// Parked by a full suspend check.
    Suspended,
    /// Detached.
    Zombie,
}

unsafe impl bytemuck::NoUninit for ThreadStatus {}

impl ThreadStatus {
    pub fn is_running(self) -> bool {
        self == ThreadStatus::Running
    }
}

/// Suspension events reported to [`Runtime::trace`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuspendEvent {
    StatusChange {
        from: ThreadStatus,
        to: ThreadStatus,
    },
    /// A full suspend check was entered.
    FullSuspendCheck,
    /// The thread is parked.
    Suspended,
    /// The thread left the park.
    Resumed,
}

/// A thread known to the runtime.
pub struct Thread {
    id: u32,
    name: String,
    system_tid: i32,
    handle: ThreadId,
    status: Atomic<ThreadStatus>,
    pub(crate) suspend_count: AtomicI32,
    pub(crate) dbg_suspend_count: AtomicI32,
    pub(crate) interp_break: InterpBreakCell,
    pub(crate) safepoint_callback: Mutex<CallbackSlot>,
    index_in_thread_list: AtomicUsize,
}

fn current_system_tid() -> i32 {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            unsafe { libc::syscall(libc::SYS_gettid) as i32 }
        } else {
            0
        }
    }
}

impl Thread {
    /// A thread record for the calling OS thread. It does not participate in
    /// suspension until it is linked into a thread list.
    pub(crate) fn new(id: u32, name: &str) -> Self {
        Self {
            id,
            name: name.to_owned(),
            system_tid: current_system_tid(),
            handle: std::thread::current().id(),
            status: Atomic::new(ThreadStatus::Initializing),
            suspend_count: AtomicI32::new(0),
            dbg_suspend_count: AtomicI32::new(0),
            interp_break: InterpBreakCell::new(),
            safepoint_callback: Mutex::new(CallbackSlot::default()),
            index_in_thread_list: AtomicUsize::new(usize::MAX),
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(id: u32, name: &str) -> Self {
        Self::new(id, name)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn system_tid(&self) -> i32 {
        self.system_tid
    }

    pub fn handle(&self) -> ThreadId {
        self.handle
    }

    pub fn status(&self) -> ThreadStatus {
        self.status.load(Ordering::SeqCst)
    }

    /// Raw status store. Only the owning thread calls this, and only where a
    /// suspend check is not wanted.
    pub(crate) fn store_status(&self, status: ThreadStatus) {
        self.status.store(status, Ordering::SeqCst);
    }

    pub fn interp_break(&self) -> InterpBreak {
        self.interp_break.load()
    }

    /// The hot-path test done before every instruction fetch.
    #[inline(always)]
    pub fn break_flags(&self) -> BreakFlags {
        self.interp_break.break_flags()
    }

    pub(crate) fn has_pending_suspend(&self) -> bool {
        self.suspend_count.load(Ordering::SeqCst) != 0
    }

    /// `(suspend_count, dbg_suspend_count)` without taking the suspend-count
    /// lock. The pair may be torn.
    pub fn suspend_counts_unsynchronized(&self) -> (i32, i32) {
        (
            self.suspend_count.load(Ordering::Relaxed),
            self.dbg_suspend_count.load(Ordering::Relaxed),
        )
    }

    /// Advisory: there is a pending suspend and the thread is not running.
    pub fn is_suspended(&self) -> bool {
        self.suspend_count.load(Ordering::Acquire) != 0 && !self.status().is_running()
    }

    pub(crate) fn index_in_thread_list(&self) -> usize {
        self.index_in_thread_list.load(Ordering::Relaxed)
    }

    pub(crate) fn set_index_in_thread_list(&self, ix: usize) {
        self.index_in_thread_list.store(ix, Ordering::Relaxed);
    }
}

impl fmt::Display for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "threadid={} ({})", self.id, self.name)
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (suspend, dbg) = self.suspend_counts_unsynchronized();
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("system_tid", &self.system_tid)
            .field("status", &self.status())
            .field("suspend_count", &suspend)
            .field("dbg_suspend_count", &dbg)
            .finish()
    }
}

/// Human readable dump of one thread: a header line, its suspend state and
/// whatever the runtime adds.
pub fn format_thread<R: Runtime>(runtime: &R, thread: &Thread) -> String {
    let mut out = String::new();
    let (suspend, dbg) = thread.suspend_counts_unsynchronized();
    let _ = writeln!(
        out,
        "\"{}\" threadid={} sysTid={} {}",
        thread.name(),
        thread.id(),
        thread.system_tid(),
        thread.status()
    );
    let _ = writeln!(
        out,
        "  | suspend={} dbg={} sub_mode={:?}",
        suspend,
        dbg,
        thread.interp_break().sub_mode
    );
    for line in runtime.dump_thread(thread).lines() {
        let _ = writeln!(out, "  {}", line);
    }
    out
}

pub fn format_threads<R: Runtime>(runtime: &R, threads: &[Arc<Thread>]) -> String {
    threads
        .iter()
        .map(|thread| format_thread(runtime, thread))
        .collect::<Vec<_>>()
        .join("\n")
}

impl<R: Runtime> RuntimeState<R> {
    /// Register the calling OS thread.
    ///
    /// If a suspend-all is in force the new thread inherits its counts and
    /// parks before returning.
    pub fn attach_current_thread(&self, name: &str) -> Arc<Thread> {
        let thread = Arc::new(Thread::new(self.next_thread_id(), name));
        thread.store_status(ThreadStatus::Starting);

        {
            // the new thread is not a suspend target yet, no handshake needed
            let mut list = self.locks.thread_list.lock_no_handshake();
            {
                let mut counts = self.locks.suspend_count.lock_no_handshake();
                let (depth, dbg_depth) = counts.global_depth();
                if depth != 0 {
                    adjust_suspend_counts(&mut counts, &thread, depth, dbg_depth);
                }
            }
            list.add(thread.clone());
        }

        log::debug!(target: "vmkit::threads", "{} attached, sysTid={}", thread, thread.system_tid());

        self.change_status(&thread, ThreadStatus::VmWait);
        self.change_status(&thread, ThreadStatus::Running);
        thread
    }

    /// Unlink `thread`, which must be the calling thread.
    pub fn detach_current_thread(&self, thread: &Thread) -> Result<()> {
        self.change_status(thread, ThreadStatus::VmWait);
        let mut list = self.locks.thread_list.lock_with_handshake(self, thread);
        if !list.remove(thread) {
            return Err(Error::NotAttached);
        }

        {
            let mut counts = self.locks.suspend_count.lock_no_handshake();
            let (suspend, dbg) = thread.suspend_counts_unsynchronized();
            if suspend != 0 {
                adjust_suspend_counts(&mut counts, thread, -suspend, -dbg);
            }
        }

        thread.store_status(ThreadStatus::Zombie);
        let _ = self.debugger_thread.compare_exchange(
            thread.id(),
            0,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        list.monitor().notify_all();
        drop(list);

        log::debug!(target: "vmkit::threads", "{} detached", thread);
        Ok(())
    }

    /// Spawn an OS thread that is attached for the duration of `f`.
    pub fn spawn<F, T>(self: &Arc<Self>, name: &str, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce(&Arc<Thread>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let vm = self.clone();
        let thread_name = name.to_owned();
        std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let thread = vm.attach_current_thread(&thread_name);
                let result = f(&thread);
                if let Err(err) = vm.detach_current_thread(&thread) {
                    log::error!(target: "vmkit::threads", "{}: {}", thread, err);
                }
                result
            })
            .map_err(Error::Spawn)
    }

    /// Wait until every thread except `current` has detached.
    pub fn join_all(&self, current: &Thread) {
        let old = self.change_status(current, ThreadStatus::VmWait);
        {
            let mut list = self.locks.thread_list.lock_no_handshake();
            while list.iter().any(|thread| thread.id() != current.id()) {
                list.wait_no_handshake();
            }
        }
        self.change_status(current, old);
    }

    /// Snapshot of the attached threads.
    pub fn threads(&self, current: &Thread) -> Vec<Arc<Thread>> {
        let list = self.locks.thread_list.lock_with_handshake(self, current);
        list.as_slice().to_vec()
    }

    /// Change the status of `thread`, which must be the calling thread.
    /// Returns the previous status.
    ///
    /// Entering `Running` publishes the status before looking at the suspend
    /// count, so a concurrent suspend-all either sees the thread running and
    /// waits for it, or the thread sees the new count and parks right here.
    pub fn change_status(&self, thread: &Thread, new_status: ThreadStatus) -> ThreadStatus {
        let old_status = thread.status();
        self.runtime.trace(
            thread,
            SuspendEvent::StatusChange {
                from: old_status,
                to: new_status,
            },
        );

        if new_status == ThreadStatus::Running {
            thread.status.store(ThreadStatus::Running, Ordering::SeqCst);
            if thread.suspend_count.load(Ordering::SeqCst) != 0 {
                self.full_suspend_check(thread);
            }
        } else {
            thread.status.store(new_status, Ordering::Release);
        }

        old_status
    }

    /// Safe-point suspend check. Returns `true` if the thread was parked.
    #[inline]
    pub fn check_suspend_pending(&self, thread: &Thread) -> bool {
        if thread.suspend_count.load(Ordering::Acquire) == 0 {
            return false;
        }
        self.full_suspend_check(thread)
    }

    /// Park `thread`, the calling thread, until its suspend count drops to
    /// zero. Returns whether it actually parked.
    pub fn full_suspend_check(&self, thread: &Thread) -> bool {
        self.runtime.trace(thread, SuspendEvent::FullSuspendCheck);

        let mut counts = self.locks.suspend_count.lock_no_handshake();
        if thread.suspend_count.load(Ordering::Relaxed) == 0 {
            return false;
        }

        let prior = thread.status();
        thread.store_status(ThreadStatus::Suspended);
        self.runtime.trace(thread, SuspendEvent::Suspended);
        if self.options.trace {
            log::trace!(target: "vmkit::threads", "{}: self-suspending", thread);
        }

        while thread.suspend_count.load(Ordering::Relaxed) != 0 {
            counts.wait_no_handshake();
        }

        thread.store_status(prior);
        drop(counts);

        self.runtime.trace(thread, SuspendEvent::Resumed);
        if self.options.trace {
            log::trace!(target: "vmkit::threads", "{}: self-reviving, status={}", thread, prior);
        }
        true
    }

    /// `(suspend_count, dbg_suspend_count)` read under the suspend-count lock.
    pub fn suspend_counts(&self, thread: &Thread) -> (i32, i32) {
        let _counts = self.locks.suspend_count.lock_no_handshake();
        thread.suspend_counts_unsynchronized()
    }

    /// Process-wide sum of suspend counts.
    pub fn suspend_count_sum(&self) -> i32 {
        self.locks.suspend_count.lock_no_handshake().sum()
    }

    /// Route `thread` through the slow dispatch path for `mode`.
    pub fn enable_sub_mode(&self, thread: &Thread, mode: SubMode) {
        assert!(
            !mode.intersects(SubMode::RESERVED),
            "{:?} is owned by the suspend machinery",
            mode & SubMode::RESERVED
        );
        let _counts = self.locks.suspend_count.lock_no_handshake();
        thread.interp_break.update(mode, SubMode::empty());
    }

    pub fn disable_sub_mode(&self, thread: &Thread, mode: SubMode) {
        assert!(
            !mode.intersects(SubMode::RESERVED),
            "{:?} is owned by the suspend machinery",
            mode & SubMode::RESERVED
        );
        let _counts = self.locks.suspend_count.lock_no_handshake();
        thread.interp_break.update(SubMode::empty(), mode);
    }

    pub fn dump_threads(&self, threads: &[Arc<Thread>]) -> String {
        format_threads(&self.runtime, threads)
    }

    pub fn dump_all_threads(&self, current: &Thread) -> String {
        let list = self.locks.thread_list.lock_with_handshake(self, current);
        format_threads(&self.runtime, list.as_slice())
    }
}
