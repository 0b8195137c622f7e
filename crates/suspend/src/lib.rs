pub mod error;
pub mod mock;
pub mod options;
pub mod runtime;
pub mod sync;
pub mod utils;

pub use error::{Error, Result};
pub use runtime::{
    suspend::SuspendCause,
    threads::{Thread, ThreadStatus},
    Runtime, RuntimeBuilder, RuntimeState,
};
