//! Safe-point polling.
//!
//! A managed thread calls [`RuntimeState::safe_point`] at loop back-edges,
//! calls and returns. On the fast path that is one load of its break flags.

use super::{
    interp_break::{BreakFlags, SubMode},
    threads::Thread,
    Runtime, RuntimeState,
};

/// Work run by a thread on itself at its next safe point. Returning `true`
/// keeps the callback armed for the following safe point.
pub type SafepointCallback = Box<dyn FnMut(&Thread) -> bool + Send>;

/// Per-thread callback slot. `epoch` moves on every install or clear, so a
/// callback that was replaced while it ran is not put back.
#[derive(Default)]
pub(crate) struct CallbackSlot {
    callback: Option<SafepointCallback>,
    epoch: u64,
}

impl<R: Runtime> RuntimeState<R> {
    /// Install or clear the safe-point callback of `thread`.
    pub fn set_safepoint_callback(&self, thread: &Thread, callback: Option<SafepointCallback>) {
        let armed = callback.is_some();
        let previous = {
            let _counts = self.locks.suspend_count.lock_no_handshake();
            let mut slot = thread.safepoint_callback.lock();
            slot.epoch = slot.epoch.wrapping_add(1);
            if armed {
                thread
                    .interp_break
                    .update(SubMode::CALLBACK_PENDING, SubMode::empty());
            } else {
                thread
                    .interp_break
                    .update(SubMode::empty(), SubMode::CALLBACK_PENDING);
            }
            std::mem::replace(&mut slot.callback, callback)
        };
        drop(previous);
    }

    /// Full safe-point poll for `thread`, the calling thread. Returns `true` if
    /// it was parked.
    #[inline]
    pub fn safe_point(&self, thread: &Thread) -> bool {
        if !thread.break_flags().contains(BreakFlags::SAFE_POINT) {
            return false;
        }
        self.safe_point_slow(thread)
    }

    #[inline(never)]
    fn safe_point_slow(&self, thread: &Thread) -> bool {
        if thread
            .interp_break()
            .sub_mode
            .contains(SubMode::CALLBACK_PENDING)
        {
            self.run_safepoint_callback(thread);
        }
        self.check_suspend_pending(thread)
    }

    fn run_safepoint_callback(&self, thread: &Thread) {
        // the callback may install a new one, so it runs unlocked
        let (mut callback, epoch) = {
            let mut slot = thread.safepoint_callback.lock();
            match slot.callback.take() {
                Some(callback) => (callback, slot.epoch),
                None => return,
            }
        };

        let keep = callback(thread);

        let _counts = self.locks.suspend_count.lock_no_handshake();
        let mut slot = thread.safepoint_callback.lock();
        if slot.epoch != epoch {
            // replaced or cleared meanwhile, the control word is already right
            return;
        }
        if keep {
            slot.callback = Some(callback);
        } else {
            thread
                .interp_break
                .update(SubMode::empty(), SubMode::CALLBACK_PENDING);
        }
    }
}
