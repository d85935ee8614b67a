//! The contract [`ParallelLoop`](crate::parallel::ParallelLoop) consumes to run
//! worker tasks, plus the thread-naming contract [`Pool`](crate::pool::Pool)
//! consumes internally.

use core::fmt;
use std::error;

/// A unit of work submitted to an [`Executor`]. Boxed so the engine can move it
/// across the `execute` boundary without knowing the executor's internals.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Returned by [`Executor::execute`] when the executor will not run the task.
///
/// This is not a hard failure: [`ParallelLoop`](crate::parallel::ParallelLoop)
/// treats it as a signal to stop growing its worker count and proceed with
/// however many workers were already accepted.
#[derive(Debug)]
pub struct Rejected;

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("executor rejected the submitted task")
    }
}

impl error::Error for Rejected {}

/// The minimal interface [`ParallelLoop`](crate::parallel::ParallelLoop)
/// requires from whatever runs its worker tasks.
///
/// An executor may run `task` on a fresh thread, on a pooled thread, or
/// synchronously on the calling thread before returning; the engine makes no
/// assumption about which, only that `Ok(())` means the task will eventually
/// run and `Err(Rejected)` means it will not.
pub trait Executor {
    /// Submits `task` for execution. Implementations must not block waiting
    /// for `task` to finish; a synchronous executor that runs `task` inline
    /// before returning is allowed, but one that queues it and blocks until a
    /// worker is free defeats the purpose of the incremental-submission
    /// protocol the engine relies on.
    fn execute(&self, task: Task) -> Result<(), Rejected>;

    /// The number of threads this executor keeps warm, if that is a
    /// meaningful and discoverable quantity for it. `None` means the
    /// executor's capacity is unbounded or not known ahead of submission.
    ///
    /// [`ParallelLoop`](crate::parallel::ParallelLoop) folds this into its
    /// degree-of-parallelism cap when present.
    fn core_size(&self) -> Option<u32> {
        None
    }
}

impl<E: Executor + ?Sized> Executor for &E {
    fn execute(&self, task: Task) -> Result<(), Rejected> {
        E::execute(self, task)
    }

    fn core_size(&self) -> Option<u32> {
        E::core_size(self)
    }
}

/// Produces named threads for a pooled executor. Consumed optionally by
/// [`Pool`](crate::pool::Pool); most callers never need to implement this
/// themselves.
pub trait ThreadFactory {
    /// Spawns `task` on a new OS thread named `name`, returning once the
    /// thread has been handed off to the platform scheduler.
    fn spawn(&self, name: &str, task: Task) -> std::io::Result<()>;
}

/// The [`ThreadFactory`] [`Pool`](crate::pool::Pool) uses unless given
/// another: plain `std::thread::Builder::spawn`, detached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeThreadFactory;

impl ThreadFactory for NativeThreadFactory {
    fn spawn(&self, name: &str, task: Task) -> std::io::Result<()> {
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(task)
            .map(|handle| {
                // Detached: `Pool` tracks completion through its own
                // channels, not through `JoinHandle`.
                drop(handle);
            })
    }
}
