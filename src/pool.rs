//! A small thread pool [`Executor`]. `ParallelLoop` and `BlockingQueue` do not
//! depend on this type; it exists so they have something concrete to run
//! against, and so callers who don't want to wire up their own executor (say,
//! a `rayon::ThreadPool` adapter, or a runtime's blocking-task spawner) have a
//! default.
//!
//! Threads are grown lazily, one submission at a time, up to a fixed cap, and
//! a worker that finishes a task respawns itself before picking up the next
//! one rather than looping in place; this means a task that panics takes its
//! own stack down with it but does not shrink the pool; a fresh thread is
//! already on its way to replace it by the time the panic has finished
//! unwinding.

use core::mem::replace;
use core::ops::Range;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::available_parallelism;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::executor::{Executor, NativeThreadFactory, Rejected, Task, ThreadFactory};

/// A thread pool that implements [`Executor`].
///
/// Cloning a [`Pool`] yields another handle to the same pool (like `Arc`);
/// dropping every handle lets idle worker threads wind down the next time
/// they would otherwise respawn, but a thread currently blocked waiting for
/// work keeps the pool's internals alive until it receives one more task or
/// the process exits.
#[derive(Clone)]
pub struct Pool(Arc<State>);

struct State {
    send: Sender<Task>,
    receive: Receiver<Task>,
    ready: AtomicUsize,
    size: Range<AtomicUsize>,
    factory: Box<dyn ThreadFactory + Send + Sync>,
}

impl Pool {
    /// A process-wide pool sized to [`available_parallelism`], created on
    /// first use.
    pub fn global() -> &'static Self {
        static POOL: OnceLock<Pool> = OnceLock::new();
        POOL.get_or_init(|| Pool::new(None))
    }

    /// Creates a pool capped at `size` threads, or at
    /// [`available_parallelism`] (falling back to 8) when `size` is `None`.
    pub fn new(size: Option<usize>) -> Self {
        Self::with_thread_factory(size, NativeThreadFactory)
    }

    /// Creates a pool that spawns its worker threads through `factory`.
    pub fn with_thread_factory(size: Option<usize>, factory: impl ThreadFactory + Send + Sync + 'static) -> Self {
        Self(Arc::new(State::new(size, Box::new(factory))))
    }

    /// The configured thread cap.
    pub fn size(&self) -> usize {
        self.0.size.end.load(Ordering::Relaxed)
    }
}

impl Executor for Pool {
    fn execute(&self, task: Task) -> Result<(), Rejected> {
        self.0.submit(task)
    }

    fn core_size(&self) -> Option<u32> {
        Some(self.size() as u32)
    }
}

impl State {
    fn new(size: Option<usize>, factory: Box<dyn ThreadFactory + Send + Sync>) -> Self {
        let (send, receive) = unbounded();
        Self {
            send,
            receive,
            ready: AtomicUsize::new(0),
            size: AtomicUsize::new(0)..AtomicUsize::new(self::size(size)),
            factory,
        }
    }

    fn submit(self: &Arc<Self>, task: Task) -> Result<(), Rejected> {
        if self.ready.load(Ordering::Relaxed) == 0 {
            if let Some(index) = self.next() {
                Self::spawn(self, index);
            }
        }
        self.send.send(task).map_err(|_| Rejected)
    }

    /// Claims the next thread-pool slot, growing `size.start` toward
    /// `size.end`. Returns `None` once the cap is reached; callers then rely
    /// on already-running workers to eventually drain the channel.
    fn next(&self) -> Option<usize> {
        let mut start = self.size.start.load(Ordering::Relaxed);
        loop {
            let end = self.size.end.load(Ordering::Relaxed);
            let next = start.checked_add(1)?.min(end);
            start = match self.size.start.compare_exchange_weak(
                start,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(next) if next < end => break Some(next),
                Ok(_) => break None,
                Err(start) => start,
            }
        }
    }

    fn spawn(state: &Arc<Self>, index: usize) {
        let weak = Arc::downgrade(state);
        state.ready.fetch_add(1, Ordering::Relaxed);
        let name = format!("threadloom-pool-{index}");
        // A spawn failure here just means the pool has one fewer live
        // worker than its nominal size; `submit` will retry growing it on
        // the next call that finds `ready == 0`.
        let _ = state.factory.spawn(&name, Box::new(move || Self::run(weak, index)));
    }

    fn run(state: Weak<Self>, index: usize) {
        struct SpawnOnDrop(Weak<State>, usize);

        impl Drop for SpawnOnDrop {
            fn drop(&mut self) {
                if let Some(state) = replace(&mut self.0, Weak::new()).upgrade() {
                    State::spawn(&state, self.1);
                }
            }
        }

        let sentinel = SpawnOnDrop(state, index);
        while let Some(state) = sentinel.0.upgrade() {
            if state.size.end.load(Ordering::Relaxed) <= sentinel.1 {
                // The pool has shrunk past this worker's slot.
                state.size.start.fetch_sub(1, Ordering::Relaxed);
                break;
            }
            let Ok(task) = state.receive.recv() else {
                break;
            };
            state.ready.fetch_sub(1, Ordering::Relaxed);
            task();
            state.ready.fetch_add(1, Ordering::Relaxed);
        }
        core::mem::forget(sentinel);
    }
}

fn size(size: Option<usize>) -> usize {
    match size {
        Some(size) => size,
        None => available_parallelism().map_or(8, |n| n.get()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn runs_submitted_tasks() {
        let pool = Pool::new(Some(4));
        let (done_send, done_recv) = mpsc::channel();
        for value in 0..8 {
            let done_send = done_send.clone();
            pool.execute(Box::new(move || {
                done_send.send(value).unwrap();
            }))
            .unwrap();
        }
        drop(done_send);
        let mut received: Vec<_> = done_recv.into_iter().collect();
        received.sort_unstable();
        assert_eq!(received, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn reports_core_size() {
        let pool = Pool::new(Some(3));
        assert_eq!(pool.core_size(), Some(3));
    }

    #[test]
    fn survives_a_panicking_task() {
        let pool = Pool::new(Some(2));
        let (done_send, done_recv) = mpsc::channel();
        pool.execute(Box::new(|| panic!("boom"))).unwrap();
        let done_send2 = done_send.clone();
        pool.execute(Box::new(move || {
            done_send2.send(()).unwrap();
        }))
        .unwrap();
        drop(done_send);
        done_recv.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
    }
}
