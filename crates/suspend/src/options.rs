use std::time::Duration;

use crate::{define_flag, error::Error, Result};

pub struct SuspendFlags;

define_flag!(SuspendFlags => u64, first_sleep_ms, 250, "Time to wait for a thread to reach a safe point before complaining (default: 250ms)");
define_flag!(SuspendFlags => u64, more_sleep_ms, 750, "Length of every following wait round (default: 750ms)");
define_flag!(SuspendFlags => u64, min_sleep_ms, 10, "Initial back-off sleep, doubled every iteration (default: 10ms)");
define_flag!(SuspendFlags => u32, max_retries, 10, "Number of wait rounds before a stuck thread is fatal (default: 10)");
define_flag!(SuspendFlags =>
    u32,
    boost_after_retries,
    1,
    "Raise the priority of a thread that did not stop after this many rounds (default: 1)"
);
define_flag!(SuspendFlags =>
    u64,
    lock_timeout_ms,
    3000,
    "Give up acquiring the thread-suspend lock after this long (default: 3000ms)"
);
define_flag!(SuspendFlags => bool, trace, false, "Log every suspend/resume step (default: false)");

/// Typed view of the suspend flags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuspendOptions {
    pub first_sleep: Duration,
    pub more_sleep: Duration,
    pub min_sleep: Duration,
    pub max_retries: u32,
    pub boost_after_retries: u32,
    pub lock_timeout: Duration,
    pub trace: bool,
}

impl Default for SuspendOptions {
    fn default() -> Self {
        Self {
            first_sleep: Duration::from_millis(250),
            more_sleep: Duration::from_millis(750),
            min_sleep: Duration::from_millis(10),
            max_retries: 10,
            boost_after_retries: 1,
            lock_timeout: Duration::from_millis(3000),
            trace: false,
        }
    }
}

impl SuspendOptions {
    pub fn from_flags() -> Result<Self> {
        let options = Self {
            first_sleep: Duration::from_millis(suspendflags_first_sleep_ms()),
            more_sleep: Duration::from_millis(suspendflags_more_sleep_ms()),
            min_sleep: Duration::from_millis(suspendflags_min_sleep_ms()),
            max_retries: suspendflags_max_retries(),
            boost_after_retries: suspendflags_boost_after_retries(),
            lock_timeout: Duration::from_millis(suspendflags_lock_timeout_ms()),
            trace: suspendflags_trace(),
        };

        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.first_sleep.is_zero() || self.more_sleep.is_zero() || self.min_sleep.is_zero() {
            return Err(Error::InvalidOption(format!(
                "sleep intervals must be non-zero: first={:?} more={:?} min={:?}",
                self.first_sleep, self.more_sleep, self.min_sleep
            )));
        }

        if self.min_sleep > self.first_sleep {
            return Err(Error::InvalidOption(format!(
                "min sleep is larger than first sleep: {:?} > {:?}",
                self.min_sleep, self.first_sleep
            )));
        }

        if self.boost_after_retries > self.max_retries {
            return Err(Error::InvalidOption(format!(
                "priority boost after {} retries would never happen (max retries: {})",
                self.boost_after_retries, self.max_retries
            )));
        }

        if self.lock_timeout.is_zero() {
            return Err(Error::InvalidOption(
                "thread-suspend lock timeout cannot be zero".to_owned(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_flags() {
        assert_eq!(SuspendOptions::from_flags().unwrap(), SuspendOptions::default());
    }

    #[test]
    fn test_validate() {
        assert!(SuspendOptions::default().validate().is_ok());

        let options = SuspendOptions {
            min_sleep: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(Error::InvalidOption(_))));

        let options = SuspendOptions {
            boost_after_retries: 11,
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = SuspendOptions {
            more_sleep: Duration::ZERO,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }
}
