use std::io;

use crate::{runtime::suspend::SuspendCause, utils::flags::FlagError};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Flag(#[from] FlagError),

    #[error("invalid suspend option: {0}")]
    InvalidOption(String),

    #[error("unable to adjust scheduling of sysTid={tid}: {source}")]
    Priority {
        tid: i32,
        #[source]
        source: io::Error,
    },

    /// A target stayed `RUNNING` past the retry bound and the timeout action
    /// chose not to abort the process.
    #[error("threadid={requester}: stuck on threadid={target} after {retries} retries")]
    Wedged {
        requester: u32,
        target: u32,
        retries: u32,
    },

    #[error("threadid={requester}: couldn't get thread-suspend lock ({cause})")]
    SuspendLockTimeout { requester: u32, cause: SuspendCause },

    #[error("current thread is not attached to the runtime")]
    NotAttached,

    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] io::Error),
}
