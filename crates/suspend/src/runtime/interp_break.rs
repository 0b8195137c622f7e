//! Per-thread interpreter control word.
//!
//! The interpreter keeps one word per thread that tells it whether the next
//! instruction may be fetched through the fast handler table or has to go
//! through the slow one. The slow table performs safe-point checks, single
//! stepping, tracing etc. The word is never edited by hand: it is derived from
//! the set of active [`SubMode`]s by [`InterpBreak::from_sub_mode`] and swapped in
//! atomically, so a thread only has to test a single value on its hot path.

use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Reasons for a thread to leave the fast dispatch path.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct SubMode: u16 {
        const METHOD_TRACE = 1 << 0;
        const EMULATOR_TRACE = 1 << 1;
        const INST_COUNTING = 1 << 2;
        const DEBUGGER_ACTIVE = 1 << 3;
        /// Owned by the suspend counters: set iff the suspend count is non-zero.
        const SUSPEND_PENDING = 1 << 4;
        /// Owned by safe-point callbacks.
        const CALLBACK_PENDING = 1 << 5;
        const COUNTED_STEP = 1 << 6;
        const CHECK_ALWAYS = 1 << 7;
        const SAMPLE_TRACE = 1 << 8;
        const JIT_TRACE_BUILD = 1 << 9;
        const JIT_SELF_VERIFICATION = 1 << 10;
    }
}

impl SubMode {
    /// Modes that need a check before every instruction.
    pub const SINGLE_STEP_MASK: SubMode = SubMode::METHOD_TRACE
        .union(SubMode::EMULATOR_TRACE)
        .union(SubMode::INST_COUNTING)
        .union(SubMode::DEBUGGER_ACTIVE)
        .union(SubMode::COUNTED_STEP)
        .union(SubMode::CHECK_ALWAYS)
        .union(SubMode::SAMPLE_TRACE)
        .union(SubMode::JIT_TRACE_BUILD)
        .union(SubMode::JIT_SELF_VERIFICATION);

    /// Modes that only need the next safe point.
    pub const SAFE_POINT_MASK: SubMode = SubMode::SUSPEND_PENDING.union(SubMode::CALLBACK_PENDING);

    /// Modes that can only be changed by the suspend machinery itself.
    pub const RESERVED: SubMode = Self::SAFE_POINT_MASK;
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct BreakFlags: u8 {
        const SINGLE_STEP = 1 << 0;
        const SAFE_POINT = 1 << 1;
    }
}

/// Instruction handler table the interpreter fetches from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum DispatchTable {
    /// No breaks pending.
    #[default]
    Main,
    /// Any break pending; handlers call back into the runtime first.
    Alt,
}

impl DispatchTable {
    pub fn select(flags: BreakFlags) -> Self {
        if flags.is_empty() {
            DispatchTable::Main
        } else {
            DispatchTable::Alt
        }
    }
}

const BREAK_FLAGS_SHIFT: u32 = 0;
const SUB_MODE_SHIFT: u32 = 8;
const DISPATCH_SHIFT: u32 = 32;

/// Decoded control word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct InterpBreak {
    pub break_flags: BreakFlags,
    pub sub_mode: SubMode,
    pub dispatch: DispatchTable,
}

impl InterpBreak {
    /// Derive break flags and dispatch table from the active sub-modes.
    pub fn from_sub_mode(sub_mode: SubMode) -> Self {
        let mut break_flags = BreakFlags::empty();
        if sub_mode.intersects(SubMode::SINGLE_STEP_MASK) {
            break_flags |= BreakFlags::SINGLE_STEP;
        }
        if sub_mode.intersects(SubMode::SAFE_POINT_MASK) {
            break_flags |= BreakFlags::SAFE_POINT;
        }

        Self {
            break_flags,
            sub_mode,
            dispatch: DispatchTable::select(break_flags),
        }
    }

    pub fn suspend_pending(&self) -> bool {
        self.sub_mode.contains(SubMode::SUSPEND_PENDING)
    }

    pub const fn encode(self) -> u64 {
        ((self.break_flags.bits() as u64) << BREAK_FLAGS_SHIFT)
            | ((self.sub_mode.bits() as u64) << SUB_MODE_SHIFT)
            | ((matches!(self.dispatch, DispatchTable::Alt) as u64) << DISPATCH_SHIFT)
    }

    pub fn decode(word: u64) -> Self {
        Self {
            break_flags: BreakFlags::from_bits_truncate((word >> BREAK_FLAGS_SHIFT) as u8),
            sub_mode: SubMode::from_bits_truncate((word >> SUB_MODE_SHIFT) as u16),
            dispatch: if (word >> DISPATCH_SHIFT) & 1 != 0 {
                DispatchTable::Alt
            } else {
                DispatchTable::Main
            },
        }
    }
}

/// Atomic storage for [`InterpBreak`].
pub struct InterpBreakCell {
    word: AtomicU64,
}

impl InterpBreakCell {
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    /// The hot-path test: is anything asking for the slow path?
    #[inline(always)]
    pub fn break_flags(&self) -> BreakFlags {
        BreakFlags::from_bits_truncate((self.word.load(Ordering::Acquire) >> BREAK_FLAGS_SHIFT) as u8)
    }

    pub fn load(&self) -> InterpBreak {
        InterpBreak::decode(self.word.load(Ordering::Acquire))
    }

    /// Enable `enable` and disable `disable` in one atomic step, recomputing the
    /// derived fields. Returns the new value.
    pub fn update(&self, enable: SubMode, disable: SubMode) -> InterpBreak {
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            let old = InterpBreak::decode(current);
            let new = InterpBreak::from_sub_mode((old.sub_mode | enable) - disable);
            match self.word.compare_exchange_weak(
                current,
                new.encode(),
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return new,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for InterpBreakCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_modes_use_main_table() {
        let brk = InterpBreak::from_sub_mode(SubMode::empty());
        assert!(brk.break_flags.is_empty());
        assert_eq!(brk.dispatch, DispatchTable::Main);
        assert_eq!(brk.encode(), 0);
    }

    #[test]
    fn test_suspend_pending_is_a_safe_point_break() {
        let brk = InterpBreak::from_sub_mode(SubMode::SUSPEND_PENDING);
        assert_eq!(brk.break_flags, BreakFlags::SAFE_POINT);
        assert_eq!(brk.dispatch, DispatchTable::Alt);
        assert!(brk.suspend_pending());
    }

    #[test]
    fn test_single_step_and_safe_point_combine() {
        let brk = InterpBreak::from_sub_mode(SubMode::DEBUGGER_ACTIVE | SubMode::CALLBACK_PENDING);
        assert_eq!(brk.break_flags, BreakFlags::SINGLE_STEP | BreakFlags::SAFE_POINT);
        assert_eq!(InterpBreak::decode(brk.encode()), brk);
    }

    #[test]
    fn test_cell_update_recomputes() {
        let cell = InterpBreakCell::new();
        cell.update(SubMode::SUSPEND_PENDING | SubMode::METHOD_TRACE, SubMode::empty());
        assert_eq!(
            cell.break_flags(),
            BreakFlags::SAFE_POINT | BreakFlags::SINGLE_STEP
        );

        let brk = cell.update(SubMode::empty(), SubMode::SUSPEND_PENDING);
        assert_eq!(brk.break_flags, BreakFlags::SINGLE_STEP);
        assert_eq!(brk.dispatch, DispatchTable::Alt);

        let brk = cell.update(SubMode::empty(), SubMode::METHOD_TRACE);
        assert_eq!(brk, InterpBreak::default());
        assert_eq!(cell.load().dispatch, DispatchTable::Main);
    }
}
