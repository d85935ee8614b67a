//! `threadloom` provides two concurrency primitives meant to be used together:
//!
//! - [`queue::BlockingQueue`]: a bounded, two-lock FIFO queue with blocking and
//!   timed `put`/`take`, non-blocking `offer`/`poll`, bulk drain, and fail-fast
//!   snapshot iteration.
//! - [`parallel::ParallelLoop`]: a data-parallel for-loop engine that fans a
//!   body over a source onto a pluggable [`executor::Executor`], with bounded
//!   parallelism, cooperative `Stop`/`Break` cancellation, per-worker local
//!   state, and aggregated panic propagation.
//!
//! [`pool::Pool`] is a small thread-pool [`executor::Executor`] provided so the
//! two primitives above have something concrete to run against; it is not part
//! of the contract either one depends on.

mod pool;
pub mod executor;
pub mod parallel;
pub mod queue;

pub use executor::{Executor, Rejected, ThreadFactory};
pub use parallel::{AggregateError, Failure, LoopResult, LoopState, ParallelLoop, ParallelOptions};
pub use pool::Pool;
pub use queue::{BlockingQueue, ConcurrentModification};
