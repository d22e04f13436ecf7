//! Worker-thread plumbing: single-assignment futures, a bounded executor and
//! cooperative cancellation tokens.

pub mod cancel;
pub mod executor;
pub mod future;

pub use cancel::{CancelToken, JobCancelled};
pub use executor::TaskExecutor;
pub use future::{FutureError, Outcome, TaskFuture};
