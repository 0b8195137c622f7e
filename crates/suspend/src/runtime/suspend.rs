//! Suspend and resume requests.
//!
//! Suspending a thread means raising its suspend count and waiting until it
//! is no longer `RUNNING`. The thread itself parks at its next safe point or
//! status change; see [`RuntimeState::full_suspend_check`].

use std::sync::atomic::Ordering;

use parking_lot::MutexGuard;

use super::{
    quiescence::{TimeoutKind, TimeoutReport},
    suspend_count::{adjust_suspend_counts, SuspendCounts},
    threads::{format_threads, SuspendEvent, Thread, ThreadStatus},
    Runtime, RuntimeState,
};
use crate::Result;

/// Why a suspend-all was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum SuspendCause {
    #[strum(serialize = "GC")]
    Gc,
    #[strum(serialize = "debug")]
    Debug,
    #[strum(serialize = "debug-event")]
    DebugEvent,
    #[strum(serialize = "stack-dump")]
    StackDump,
    #[strum(serialize = "dex-opt")]
    DexOpt,
    #[strum(serialize = "verify")]
    Verify,
    #[strum(serialize = "hprof")]
    Hprof,
    #[strum(serialize = "sampling")]
    Sampling,
    #[strum(serialize = "table-resize")]
    TableResize,
    #[strum(serialize = "ic-patch")]
    IcPatch,
    #[strum(serialize = "cc-reset")]
    CcReset,
    #[strum(serialize = "refresh")]
    Refresh,
}

impl SuspendCause {
    /// Debugger suspends are counted separately and never target the
    /// debugger-connection thread.
    pub fn is_debug(self) -> bool {
        matches!(self, SuspendCause::Debug | SuspendCause::DebugEvent)
    }
}

impl<R: Runtime> RuntimeState<R> {
    /// Name `thread` as the debugger-connection thread, or clear it.
    pub fn set_debugger_thread(&self, thread: Option<&Thread>) {
        self.debugger_thread
            .store(thread.map_or(0, Thread::id), Ordering::Relaxed);
    }

    pub fn debugger_thread(&self) -> Option<u32> {
        match self.debugger_thread.load(Ordering::Relaxed) {
            0 => None,
            id => Some(id),
        }
    }

    fn is_excluded(&self, current: &Thread, thread: &Thread, cause: SuspendCause) -> bool {
        thread.id() == current.id()
            || (cause.is_debug() && self.debugger_thread() == Some(thread.id()))
    }

    /// Acquire the thread-suspend lock.
    ///
    /// The lock is never waited on: if another suspend-all is in flight, it
    /// is probably trying to suspend us, so we honour that first and back
    /// off. Contention that outlasts `lock_timeout` is fatal.
    fn lock_suspend_request(&self, current: &Thread, cause: SuspendCause) -> Result<MutexGuard<'_, ()>> {
        let waiter = &self.waiter;
        let mut start = waiter.clock().now();
        let mut sleep_iter = 0;

        loop {
            if let Some(guard) = self.locks.try_lock_suspend_request() {
                return Ok(guard);
            }

            if !self.check_suspend_pending(current) {
                // a resume-all about to release the lock, a suspend-all that
                // has not raised our count yet, or two debugger events racing
                log::info!(
                    target: "vmkit::suspend",
                    "threadid={} ODD: want thread-suspend lock ({}), it's held, no suspend pending",
                    current.id(),
                    cause
                );
            } else {
                // we were suspended, the holder made progress
                sleep_iter = 0;
            }

            if sleep_iter == 0 {
                start = waiter.clock().now();
            }
            if !waiter.iterative_sleep(sleep_iter, self.options.lock_timeout, start) {
                log::error!(
                    target: "vmkit::suspend",
                    "threadid={}: couldn't get thread-suspend lock ({}), bailing",
                    current.id(),
                    cause
                );
                // the list may be held by a wedged suspend-all, do not wait for it
                let dump = match self.locks.thread_list.try_lock_no_handshake() {
                    Some(list) => format_threads(&self.runtime, list.as_slice()),
                    None => String::from("<thread list is locked>"),
                };
                return Err(waiter.timed_out(TimeoutReport {
                    requester: current.id(),
                    kind: TimeoutKind::SuspendLock { cause },
                    dump,
                }));
            }
            sleep_iter += 1;
        }
    }

    /// Bring every other thread to a non-`RUNNING` state.
    ///
    /// On return each of them is parked, or outside managed code and will
    /// park before it next runs managed code. If the timeout action returns
    /// instead of aborting, the error is reported and the suspend-all stays
    /// in force; it has to be undone with [`resume_all_threads`].
    ///
    /// [`resume_all_threads`]: RuntimeState::resume_all_threads
    pub fn suspend_all_threads(&self, current: &Thread, cause: SuspendCause) -> Result<()> {
        let trace = self.options.trace;
        if trace {
            log::trace!(target: "vmkit::suspend", "{}: SuspendAll starting ({})", current, cause);
        }

        let request = self.lock_suspend_request(current, cause)?;
        let list = self.locks.thread_list.lock_with_handshake(self, current);

        {
            let mut counts = self.locks.suspend_count.lock_no_handshake();
            counts.enter_suspend_all(cause.is_debug());
            for thread in list.iter() {
                if self.is_excluded(current, thread, cause) {
                    continue;
                }
                adjust_suspend_counts(&mut counts, thread, 1, cause.is_debug() as i32);
            }
        }

        for thread in list.iter() {
            if self.is_excluded(current, thread, cause) {
                continue;
            }

            self.waiter
                .wait_for_quiescence(&self.runtime, current, thread, list.as_slice())?;
            if trace {
                log::trace!(
                    target: "vmkit::suspend",
                    "{}:   {} status={}",
                    current,
                    thread,
                    thread.status()
                );
            }
        }

        drop(list);
        drop(request);

        if trace {
            log::trace!(target: "vmkit::suspend", "{}: SuspendAll complete", current);
        }
        Ok(())
    }

    /// Undo one [`suspend_all_threads`](RuntimeState::suspend_all_threads)
    /// with the same cause.
    pub fn resume_all_threads(&self, current: &Thread, cause: SuspendCause) -> Result<()> {
        let trace = self.options.trace;
        if trace {
            log::trace!(target: "vmkit::suspend", "{}: ResumeAll starting ({})", current, cause);
        }

        let request = self.lock_suspend_request(current, cause)?;
        let list = self.locks.thread_list.lock_with_handshake(self, current);

        {
            let mut counts = self.locks.suspend_count.lock_no_handshake();
            counts.leave_suspend_all(cause.is_debug());
            for thread in list.iter() {
                if self.is_excluded(current, thread, cause) {
                    continue;
                }
                self.drop_one_suspend(&mut counts, thread, cause.is_debug());
            }
        }

        drop(list);
        // release before waking anybody, a woken thread may want it right away
        drop(request);

        if trace {
            log::trace!(target: "vmkit::suspend", "{}: ResumeAll waking others", current);
        }
        self.broadcast_resume();

        if trace {
            log::trace!(target: "vmkit::suspend", "{}: ResumeAll complete", current);
        }
        Ok(())
    }

    /// Remove every debugger suspension, leaving only the general ones.
    /// Used when the debugger detaches. Unlike a debug suspend-all this also
    /// covers the caller and the debugger thread.
    pub fn undo_debugger_suspensions(&self, current: &Thread) -> Result<()> {
        let request = self.lock_suspend_request(current, SuspendCause::Debug)?;
        let list = self.locks.thread_list.lock_with_handshake(self, current);

        {
            let mut counts = self.locks.suspend_count.lock_no_handshake();
            counts.clear_debug_depth();
            for thread in list.iter() {
                let (_, dbg) = thread.suspend_counts_unsynchronized();
                if dbg != 0 {
                    adjust_suspend_counts(&mut counts, thread, -dbg, -dbg);
                }
            }
        }

        drop(list);
        drop(request);

        self.broadcast_resume();
        log::debug!(target: "vmkit::suspend", "{}: undo debugger suspensions complete", current);
        Ok(())
    }

    /// Debugger suspend of a single thread. `target` must not be `current`.
    pub fn suspend_thread(&self, current: &Thread, target: &Thread) -> Result<()> {
        assert!(
            target.id() != current.id(),
            "{}: a thread cannot suspend itself through suspend_thread",
            current
        );

        let list = self.locks.thread_list.lock_with_handshake(self, current);
        assert!(list.contains(target), "{} is not attached", target);

        {
            let mut counts = self.locks.suspend_count.lock_no_handshake();
            adjust_suspend_counts(&mut counts, target, 1, 1);
        }

        self.waiter
            .wait_for_quiescence(&self.runtime, current, target, list.as_slice())
    }

    /// Undo one [`suspend_thread`](RuntimeState::suspend_thread). `target` must
    /// not be `current`.
    pub fn resume_thread(&self, current: &Thread, target: &Thread) {
        assert!(
            target.id() != current.id(),
            "{}: a thread cannot resume itself through resume_thread",
            current
        );

        let list = self.locks.thread_list.lock_with_handshake(self, current);
        assert!(list.contains(target), "{} is not attached", target);

        let mut counts = self.locks.suspend_count.lock_no_handshake();
        self.drop_one_suspend(&mut counts, target, true);
        if target.suspend_count.load(Ordering::Relaxed) == 0 {
            counts.monitor().notify_all();
        }
    }

    /// Wait until `target`, already counted as suspended, stops running.
    pub fn wait_for_suspend(&self, current: &Thread, target: &Thread) -> Result<()> {
        let list = self.locks.thread_list.lock_with_handshake(self, current);
        self.waiter
            .wait_for_quiescence(&self.runtime, current, target, list.as_slice())
    }

    /// Suspend the calling thread, e.g. after posting a debugger event, until
    /// somebody resumes it.
    pub fn suspend_self(&self, thread: &Thread, from_debugger_activity: bool) {
        let mut counts = self.locks.suspend_count.lock_no_handshake();
        adjust_suspend_counts(&mut counts, thread, 1, 1);

        let prior = thread.status();
        thread.store_status(ThreadStatus::Suspended);
        self.runtime.trace(thread, SuspendEvent::Suspended);

        // the debugger cannot resume us before we wait: it needs this lock
        if from_debugger_activity {
            self.runtime.debugger_suspended(thread);
        }

        if self.options.trace {
            log::trace!(target: "vmkit::suspend", "{}: self-suspending (dbg)", thread);
        }
        while thread.suspend_count.load(Ordering::Relaxed) != 0 {
            counts.wait_no_handshake();
        }

        thread.store_status(prior);
        drop(counts);
        self.runtime.trace(thread, SuspendEvent::Resumed);
    }

    /// Drop one suspension of `thread`, never below zero and never below its
    /// debugger suspensions.
    fn drop_one_suspend(&self, counts: &mut SuspendCounts, thread: &Thread, debug: bool) {
        let (suspend, dbg) = thread.suspend_counts_unsynchronized();
        if suspend == 0 {
            log::debug!(target: "vmkit::suspend", "{}: suspend count already zero", thread);
            return;
        }

        // a debugger resume only removes debugger suspensions
        if debug && dbg == 0 {
            log::debug!(
                target: "vmkit::suspend",
                "{}: no debugger suspensions to drop (suspend={})",
                thread,
                suspend
            );
            return;
        }

        let dbg_delta = if debug { -1 } else { 0 };
        if suspend - 1 < dbg + dbg_delta {
            log::debug!(
                target: "vmkit::suspend",
                "{}: only debugger suspensions left (suspend={} dbg={})",
                thread,
                suspend,
                dbg
            );
            return;
        }

        adjust_suspend_counts(counts, thread, -1, dbg_delta);
    }

    fn broadcast_resume(&self) {
        let counts = self.locks.suspend_count.lock_no_handshake();
        counts.monitor().notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize},
            Arc,
        },
        thread::JoinHandle,
        time::Duration,
    };

    use super::*;
    use crate::{
        error::Error,
        mock::{test_runtime, wait_until, ManualClock, MockPriority, MockVM, RecordingTimeout},
        options::SuspendOptions,
        runtime::{priority::SchedPolicy, quiescence::Clock, RuntimeBuilder},
    };

    type Vm = Arc<RuntimeState<MockVM>>;

    /// Worker threads polling safe points in a tight loop.
    fn spawn_workers(vm: &Vm, n: usize, stop: &Arc<AtomicBool>) -> Vec<(Arc<Thread>, JoinHandle<()>)> {
        (0..n)
            .map(|i| {
                let (tx, rx) = std::sync::mpsc::channel();
                let worker_vm = vm.clone();
                let stop = stop.clone();
                let handle = vm
                    .spawn(&format!("worker-{}", i), move |thread| {
                        tx.send(thread.clone()).unwrap();
                        while !stop.load(Ordering::Relaxed) {
                            worker_vm.safe_point(thread);
                            std::hint::spin_loop();
                        }
                    })
                    .unwrap();
                (rx.recv().unwrap(), handle)
            })
            .collect()
    }

    fn stop_workers(stop: &AtomicBool, workers: Vec<(Arc<Thread>, JoinHandle<()>)>) {
        stop.store(true, Ordering::Relaxed);
        for (_, handle) in workers {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_cause_names() {
        assert_eq!(SuspendCause::Gc.to_string(), "GC");
        assert_eq!(SuspendCause::DebugEvent.to_string(), "debug-event");
        assert!(SuspendCause::Debug.is_debug());
        assert!(!SuspendCause::StackDump.is_debug());
    }

    #[test]
    fn test_suspend_all_and_resume_all() {
        let vm = test_runtime(MockVM::new());
        let gc = vm.attach_current_thread("gc");
        let stop = Arc::new(AtomicBool::new(false));
        let workers = spawn_workers(&vm, 4, &stop);

        vm.suspend_all_threads(&gc, SuspendCause::Gc).unwrap();
        for (worker, _) in &workers {
            assert_ne!(worker.status(), ThreadStatus::Running);
            assert!(worker.is_suspended());
            assert_eq!(vm.suspend_counts(worker), (1, 0));
        }
        assert_eq!(vm.suspend_counts(&gc), (0, 0));
        assert_eq!(vm.suspend_count_sum(), 4);

        vm.resume_all_threads(&gc, SuspendCause::Gc).unwrap();
        for (worker, _) in &workers {
            wait_until(|| worker.status() == ThreadStatus::Running);
            assert_eq!(vm.suspend_counts(worker), (0, 0));
        }
        assert_eq!(vm.suspend_count_sum(), 0);

        stop_workers(&stop, workers);
        vm.detach_current_thread(&gc).unwrap();
    }

    #[test]
    fn test_debugger_suspend_survives_gc_resume() {
        let vm = test_runtime(MockVM::new());
        let main = vm.attach_current_thread("main");
        let stop = Arc::new(AtomicBool::new(false));
        let workers = spawn_workers(&vm, 1, &stop);
        let target = workers[0].0.clone();

        vm.suspend_thread(&main, &target).unwrap();
        assert_eq!(vm.suspend_counts(&target), (1, 1));

        vm.suspend_all_threads(&main, SuspendCause::Gc).unwrap();
        assert_eq!(vm.suspend_counts(&target), (2, 1));

        vm.resume_all_threads(&main, SuspendCause::Gc).unwrap();
        assert_eq!(vm.suspend_counts(&target), (1, 1));
        assert!(target.is_suspended());

        vm.undo_debugger_suspensions(&main).unwrap();
        assert_eq!(vm.suspend_counts(&target), (0, 0));
        wait_until(|| target.status() == ThreadStatus::Running);

        stop_workers(&stop, workers);
        vm.detach_current_thread(&main).unwrap();
    }

    #[test]
    fn test_round_trip_keeps_prior_counts() {
        let vm = test_runtime(MockVM::new());
        let main = vm.attach_current_thread("main");
        let stop = Arc::new(AtomicBool::new(false));
        let workers = spawn_workers(&vm, 3, &stop);

        vm.suspend_thread(&main, &workers[1].0).unwrap();
        let before = workers
            .iter()
            .map(|(worker, _)| vm.suspend_counts(worker))
            .collect::<Vec<_>>();

        vm.suspend_all_threads(&main, SuspendCause::StackDump).unwrap();
        vm.resume_all_threads(&main, SuspendCause::StackDump).unwrap();

        let after = workers
            .iter()
            .map(|(worker, _)| vm.suspend_counts(worker))
            .collect::<Vec<_>>();
        assert_eq!(before, after);

        vm.resume_thread(&main, &workers[1].0);
        stop_workers(&stop, workers);
        vm.detach_current_thread(&main).unwrap();
    }

    #[test]
    fn test_undo_debugger_suspensions_is_idempotent() {
        let vm = test_runtime(MockVM::new());
        let main = vm.attach_current_thread("main");
        let stop = Arc::new(AtomicBool::new(false));
        let workers = spawn_workers(&vm, 2, &stop);

        vm.suspend_all_threads(&main, SuspendCause::Debug).unwrap();
        vm.suspend_thread(&main, &workers[0].0).unwrap();
        assert_eq!(vm.suspend_counts(&workers[0].0), (2, 2));

        vm.undo_debugger_suspensions(&main).unwrap();
        let once = workers
            .iter()
            .map(|(worker, _)| vm.suspend_counts(worker))
            .collect::<Vec<_>>();
        assert!(once.iter().all(|&counts| counts == (0, 0)));

        vm.undo_debugger_suspensions(&main).unwrap();
        let twice = workers
            .iter()
            .map(|(worker, _)| vm.suspend_counts(worker))
            .collect::<Vec<_>>();
        assert_eq!(once, twice);

        // the suspend-all was folded into the undo
        vm.resume_all_threads(&main, SuspendCause::Debug).unwrap();
        assert_eq!(vm.suspend_count_sum(), 0);

        stop_workers(&stop, workers);
        vm.detach_current_thread(&main).unwrap();
    }

    #[test]
    fn test_no_double_counting() {
        let vm = test_runtime(MockVM::new());
        let main = vm.attach_current_thread("main");
        let stop = Arc::new(AtomicBool::new(false));
        let workers = spawn_workers(&vm, 1, &stop);
        let target = workers[0].0.clone();

        vm.suspend_all_threads(&main, SuspendCause::Gc).unwrap();
        vm.suspend_thread(&main, &target).unwrap();
        assert_eq!(vm.suspend_counts(&target).0, 2);

        vm.resume_thread(&main, &target);
        assert_eq!(vm.suspend_counts(&target).0, 1);
        assert!(target.is_suspended());

        vm.resume_all_threads(&main, SuspendCause::Gc).unwrap();
        assert_eq!(vm.suspend_counts(&target), (0, 0));

        stop_workers(&stop, workers);
        vm.detach_current_thread(&main).unwrap();
    }

    #[test]
    fn test_debugger_resume_keeps_gc_suspension() {
        let vm = test_runtime(MockVM::new());
        let gc = vm.attach_current_thread("gc");
        let stop = Arc::new(AtomicBool::new(false));
        let steps = Arc::new(AtomicUsize::new(0));

        let (tx, rx) = std::sync::mpsc::channel();
        let worker_vm = vm.clone();
        let worker_stop = stop.clone();
        let worker_steps = steps.clone();
        let worker = vm
            .spawn("stepper", move |thread| {
                tx.send(thread.clone()).unwrap();
                while !worker_stop.load(Ordering::Relaxed) {
                    worker_steps.fetch_add(1, Ordering::SeqCst);
                    worker_vm.safe_point(thread);
                }
            })
            .unwrap();
        let target = rx.recv().unwrap();

        vm.suspend_all_threads(&gc, SuspendCause::Gc).unwrap();
        assert_eq!(vm.suspend_counts(&target), (1, 0));

        vm.resume_thread(&gc, &target);
        assert_eq!(vm.suspend_counts(&target), (1, 0));
        let before = steps.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(steps.load(Ordering::SeqCst), before);
        assert_ne!(target.status(), ThreadStatus::Running);

        // same for a debug resume-all after the debugger has gone
        vm.resume_all_threads(&gc, SuspendCause::Debug).unwrap();
        assert_eq!(vm.suspend_counts(&target), (1, 0));

        vm.resume_all_threads(&gc, SuspendCause::Gc).unwrap();
        assert_eq!(vm.suspend_counts(&target), (0, 0));
        stop.store(true, Ordering::Relaxed);
        worker.join().unwrap();
        vm.detach_current_thread(&gc).unwrap();
    }

    #[test]
    fn test_undo_covers_debugger_thread() {
        let vm = test_runtime(MockVM::new());
        let main = vm.attach_current_thread("main");
        let stop = Arc::new(AtomicBool::new(false));
        let workers = spawn_workers(&vm, 1, &stop);
        let jdwp = workers[0].0.clone();
        vm.set_debugger_thread(Some(&jdwp));

        vm.suspend_thread(&main, &jdwp).unwrap();
        assert_eq!(vm.suspend_counts(&jdwp), (1, 1));

        vm.undo_debugger_suspensions(&main).unwrap();
        assert_eq!(vm.suspend_counts(&jdwp), (0, 0));
        assert_eq!(vm.suspend_count_sum(), 0);
        wait_until(|| jdwp.status() == ThreadStatus::Running);

        vm.set_debugger_thread(None);
        stop_workers(&stop, workers);
        vm.detach_current_thread(&main).unwrap();
    }

    #[test]
    fn test_resume_of_zero_count_is_tolerated() {
        let vm = test_runtime(MockVM::new());
        let main = vm.attach_current_thread("main");
        let stop = Arc::new(AtomicBool::new(false));
        let workers = spawn_workers(&vm, 1, &stop);

        vm.resume_all_threads(&main, SuspendCause::Gc).unwrap();
        vm.resume_thread(&main, &workers[0].0);
        assert_eq!(vm.suspend_counts(&workers[0].0), (0, 0));

        stop_workers(&stop, workers);
        vm.detach_current_thread(&main).unwrap();
    }

    #[test]
    fn test_debug_suspend_skips_debugger_thread() {
        let vm = test_runtime(MockVM::new());
        let main = vm.attach_current_thread("main");
        let stop = Arc::new(AtomicBool::new(false));
        let workers = spawn_workers(&vm, 2, &stop);
        let (jdwp, other) = (workers[0].0.clone(), workers[1].0.clone());
        vm.set_debugger_thread(Some(&jdwp));

        vm.suspend_all_threads(&main, SuspendCause::DebugEvent).unwrap();
        assert_eq!(vm.suspend_counts(&jdwp), (0, 0));
        assert_eq!(vm.suspend_counts(&other), (1, 1));

        // a GC suspend-all does not exclude it
        vm.suspend_all_threads(&main, SuspendCause::Gc).unwrap();
        assert_eq!(vm.suspend_counts(&jdwp), (1, 0));
        vm.resume_all_threads(&main, SuspendCause::Gc).unwrap();

        vm.resume_all_threads(&main, SuspendCause::DebugEvent).unwrap();
        assert_eq!(vm.suspend_counts(&other), (0, 0));

        vm.set_debugger_thread(None);
        assert_eq!(vm.debugger_thread(), None);
        stop_workers(&stop, workers);
        vm.detach_current_thread(&main).unwrap();
    }

    #[test]
    fn test_status_change_races_with_suspend_all() {
        let vm = test_runtime(MockVM::new());
        let main = vm.attach_current_thread("main");
        let stop = Arc::new(AtomicBool::new(false));
        let executed = Arc::new(AtomicUsize::new(0));

        let (tx, rx) = std::sync::mpsc::channel();
        let worker_vm = vm.clone();
        let worker_stop = stop.clone();
        let worker_executed = executed.clone();
        let worker = vm
            .spawn("racer", move |thread| {
                tx.send(thread.clone()).unwrap();
                let mut i = 0usize;
                while !worker_stop.load(Ordering::Relaxed) {
                    worker_vm.change_status(thread, ThreadStatus::Native);
                    match i % 3 {
                        0 => (),
                        1 => std::thread::yield_now(),
                        _ => std::thread::sleep(Duration::from_micros(50)),
                    }
                    worker_vm.change_status(thread, ThreadStatus::Running);
                    // one managed instruction
                    worker_executed.fetch_add(1, Ordering::SeqCst);
                    worker_vm.safe_point(thread);
                    i += 1;
                }
            })
            .unwrap();
        let racer = rx.recv().unwrap();

        for _ in 0..50 {
            vm.suspend_all_threads(&main, SuspendCause::Gc).unwrap();
            let before = executed.load(Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(2));
            assert_eq!(executed.load(Ordering::SeqCst), before);
            assert_ne!(racer.status(), ThreadStatus::Running);
            vm.resume_all_threads(&main, SuspendCause::Gc).unwrap();
        }

        stop.store(true, Ordering::Relaxed);
        worker.join().unwrap();

        // every park was preceded by a full suspend check of the racer
        let events = vm.runtime().events_of(racer.id());
        for (ix, event) in events.iter().enumerate() {
            if *event == SuspendEvent::Suspended {
                assert_eq!(events[ix - 1], SuspendEvent::FullSuspendCheck);
            }
        }
        vm.detach_current_thread(&main).unwrap();
    }

    #[test]
    fn test_wedged_thread_reports_timeout() {
        let timeout = Arc::new(RecordingTimeout::new());
        let vm = RuntimeBuilder::new(MockVM::new())
            .options(SuspendOptions {
                first_sleep: Duration::from_millis(20),
                more_sleep: Duration::from_millis(20),
                min_sleep: Duration::from_millis(1),
                max_retries: 2,
                boost_after_retries: 1,
                ..Default::default()
            })
            .priority(MockPriority::new(0, SchedPolicy::Foreground))
            .on_timeout(timeout.clone())
            .build()
            .unwrap();
        let main = vm.attach_current_thread("main");

        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = std::sync::mpsc::channel();
        let spin_stop = stop.clone();
        let spinner = vm
            .spawn("spinner", move |thread| {
                tx.send(thread.clone()).unwrap();
                // never polls a safe point
                while !spin_stop.load(Ordering::Relaxed) {
                    std::hint::spin_loop();
                }
            })
            .unwrap();
        let target = rx.recv().unwrap();

        let result = vm.suspend_all_threads(&main, SuspendCause::Gc);
        assert!(matches!(result, Err(Error::Wedged { retries: 2, .. })));
        let reports = timeout.reports();
        assert_eq!(reports.len(), 1);
        assert!(matches!(
            reports[0].kind,
            TimeoutKind::Wedged { target: id, .. } if id == target.id()
        ));
        assert!(reports[0].dump.contains("\"spinner\""));

        stop.store(true, Ordering::Relaxed);
        vm.resume_all_threads(&main, SuspendCause::Gc).unwrap();
        spinner.join().unwrap();
        vm.detach_current_thread(&main).unwrap();
    }

    #[test]
    fn test_request_lock_contention_backs_off() {
        let vm = test_runtime(MockVM::new());
        let main = vm.attach_current_thread("main");
        let (tx, rx) = std::sync::mpsc::channel();

        let holder_vm = vm.clone();
        let holder = std::thread::spawn(move || {
            let guard = holder_vm.locks.suspend_request.lock();
            tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(50));
            drop(guard);
        });
        rx.recv().unwrap();

        vm.suspend_all_threads(&main, SuspendCause::Gc).unwrap();
        vm.resume_all_threads(&main, SuspendCause::Gc).unwrap();
        holder.join().unwrap();
        vm.detach_current_thread(&main).unwrap();
    }

    #[test]
    fn test_request_lock_timeout() {
        let clock = Arc::new(ManualClock::new());
        let timeout = Arc::new(RecordingTimeout::new());
        let vm = RuntimeBuilder::new(MockVM::new())
            .clock(clock.clone())
            .on_timeout(timeout.clone())
            .build()
            .unwrap();
        let main = vm.attach_current_thread("main");

        let held = vm.locks.suspend_request.lock();
        let result = vm.suspend_all_threads(&main, SuspendCause::Hprof);
        assert!(matches!(
            result,
            Err(Error::SuspendLockTimeout {
                cause: SuspendCause::Hprof,
                ..
            })
        ));
        assert!(clock.now() >= Duration::from_secs(3));
        assert_eq!(timeout.reports().len(), 1);
        drop(held);

        vm.detach_current_thread(&main).unwrap();
    }

    #[test]
    fn test_suspend_self_notifies_debugger() {
        let vm = test_runtime(MockVM::new());
        let main = vm.attach_current_thread("main");
        let (tx, rx) = std::sync::mpsc::channel();

        let worker_vm = vm.clone();
        let worker = vm
            .spawn("event-poster", move |thread| {
                tx.send(thread.clone()).unwrap();
                worker_vm.suspend_self(thread, true);
                worker_vm.suspend_counts(thread)
            })
            .unwrap();
        let target = rx.recv().unwrap();

        wait_until(|| target.status() == ThreadStatus::Suspended);
        assert_eq!(vm.runtime().debugger_notifications(), vec![target.id()]);
        assert_eq!(vm.suspend_counts(&target), (1, 1));

        vm.wait_for_suspend(&main, &target).unwrap();
        vm.resume_thread(&main, &target);
        assert_eq!(worker.join().unwrap(), (0, 0));
        vm.detach_current_thread(&main).unwrap();
    }

    #[test]
    fn test_thread_attaching_during_suspend_all_starts_suspended() {
        let vm = test_runtime(MockVM::new());
        let main = vm.attach_current_thread("main");
        let ran = Arc::new(AtomicBool::new(false));

        vm.suspend_all_threads(&main, SuspendCause::Gc).unwrap();

        let worker_ran = ran.clone();
        let worker = vm
            .spawn("late", move |_| worker_ran.store(true, Ordering::SeqCst))
            .unwrap();
        wait_until(|| {
            vm.threads(&main)
                .iter()
                .any(|thread| thread.name() == "late" && thread.status() == ThreadStatus::Suspended)
        });
        assert!(!ran.load(Ordering::SeqCst));

        vm.resume_all_threads(&main, SuspendCause::Gc).unwrap();
        worker.join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
        vm.detach_current_thread(&main).unwrap();
    }

    #[test]
    #[should_panic(expected = "cannot suspend itself")]
    fn test_suspend_thread_rejects_self() {
        let vm = test_runtime(MockVM::new());
        let main = vm.attach_current_thread("main");
        let _ = vm.suspend_thread(&main, &main);
    }
}
