//! A data-parallel for-loop engine driven by a pluggable [`Executor`].
//!
//! [`ParallelLoop::for_each`] (and the per-worker-state sibling
//! [`ParallelLoop::for_each_with_local`]) fan a body over a source onto an
//! executor, with the calling thread itself running as worker 0, lazy and
//! incremental worker submission, cooperative `Stop`/`Break` cancellation via
//! [`LoopState`], and aggregated panic propagation.

use core::any::Any;
use core::cell::Cell;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::borrow::Cow;
use std::error;
use std::sync::{Arc, Condvar, Mutex};

use crate::executor::{Executor, Task};

/// Tunables for one [`ParallelLoop::for_each`] call.
///
/// Converts from a bare `u32`, so most callers just pass a number:
/// `engine.for_each(&pool, source, 4, body)`.
#[derive(Debug, Clone, Copy)]
pub struct ParallelOptions {
    /// Caps how many concurrent workers (including the driver) the loop will
    /// run. `0` means "unbounded by the caller, still capped by whatever the
    /// executor reports through [`Executor::core_size`]"; `1` runs the whole
    /// loop inline on the caller with zero executor submissions.
    pub max_degree_of_parallelism: u32,
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self {
            max_degree_of_parallelism: 0,
        }
    }
}

impl From<u32> for ParallelOptions {
    fn from(max_degree_of_parallelism: u32) -> Self {
        Self {
            max_degree_of_parallelism,
        }
    }
}

/// The outcome of a completed [`ParallelLoop::for_each`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopResult {
    /// `true` only when the source was exhausted with no `stop()`, no
    /// `break_()`, and no body failure.
    pub is_completed: bool,
    /// The lowest index ever passed to `LoopState::break_`, across every
    /// worker, or `None` if `break_` was never called.
    pub lowest_break_iteration: Option<u64>,
}

/// A worker body's panic, turned into a displayable message.
///
/// Payloads that are themselves a `&'static str`, `String`, `Box<str>`, or
/// `Cow<'static, str>` (the shapes `panic!`, `assert!`, and friends produce)
/// are rendered directly; anything else is reported generically.
pub struct Failure {
    message: Option<Cow<'static, str>>,
}

impl Failure {
    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self {
            message: cast(payload),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => f.write_str(message),
            None => f.write_str("worker panicked with a non-string payload"),
        }
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failure").field("message", &self.message).finish()
    }
}

impl error::Error for Failure {}

fn cast(payload: Box<dyn Any + Send>) -> Option<Cow<'static, str>> {
    let payload = match payload.downcast::<&'static str>() {
        Ok(message) => return Some(Cow::Borrowed(*message)),
        Err(payload) => payload,
    };
    let payload = match payload.downcast::<String>() {
        Ok(message) => return Some(Cow::Owned(*message)),
        Err(payload) => payload,
    };
    let payload = match payload.downcast::<Box<str>>() {
        Ok(message) => return Some(Cow::Owned(message.to_string())),
        Err(payload) => payload,
    };
    match payload.downcast::<Cow<'static, str>>() {
        Ok(message) => Some(*message),
        Err(_) => None,
    }
}

/// Returned from [`ParallelLoop::for_each`] when exactly one body invocation
/// panicked. Wraps the first such [`Failure`]; later ones are discarded.
#[derive(Debug)]
pub struct AggregateError {
    failure: Failure,
}

impl AggregateError {
    pub fn failure(&self) -> &Failure {
        &self.failure
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parallel loop body failed: {}", self.failure)
    }
}

impl error::Error for AggregateError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&self.failure)
    }
}

/// The lowest index ever passed to `break_`, or "none yet", stored as one
/// atomic with `u64::MAX` as the "none" sentinel so a reader never observes
/// a presence flag and a value that were set by two different updates.
struct LowestBreak(AtomicU64);

impl LowestBreak {
    const NONE: u64 = u64::MAX;

    fn new() -> Self {
        Self(AtomicU64::new(Self::NONE))
    }

    fn get(&self) -> Option<u64> {
        match self.0.load(Ordering::Acquire) {
            Self::NONE => None,
            value => Some(value),
        }
    }

    /// Lowers the stored value to `index` if `index` is smaller, via the
    /// same compare-and-retry shape `checkito::parallel::State::next` uses
    /// to claim a slot.
    fn update(&self, index: u64) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            if current != Self::NONE && current <= index {
                return;
            }
            match self
                .0
                .compare_exchange_weak(current, index, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

struct Shared {
    is_stopped: AtomicBool,
    is_exceptional: AtomicBool,
    lowest_break: LowestBreak,
    failure: Mutex<Option<Failure>>,
    /// Submission attempts granted so far, including the driver (slot 0).
    attempted: AtomicU32,
    /// Submissions the executor actually accepted, including the driver.
    accepted: AtomicU32,
    /// The attempt cap; shrunk down to `attempted` the moment a submission is
    /// rejected, so no further attempts are made for the rest of this call.
    target: AtomicU32,
}

impl Shared {
    fn should_exit_before_claim(&self, next_index: u64) -> bool {
        self.is_stopped.load(Ordering::Acquire)
            || self.is_exceptional.load(Ordering::Acquire)
            || matches!(self.lowest_break.get(), Some(lowest) if lowest <= next_index)
    }

    fn record_failure(&self, failure: Failure) {
        self.is_exceptional.store(true, Ordering::Release);
        let mut slot = self.failure.lock().unwrap();
        if slot.is_none() {
            *slot = Some(failure);
        }
    }

    fn next_submission_slot(&self) -> bool {
        let mut start = self.attempted.load(Ordering::Relaxed);
        loop {
            let end = self.target.load(Ordering::Relaxed);
            if start >= end {
                return false;
            }
            match self.attempted.compare_exchange_weak(
                start,
                start + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => start = actual,
            }
        }
    }

    fn mark_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    fn close_submissions(&self) {
        let mut end = self.target.load(Ordering::Relaxed);
        loop {
            let attempted = self.attempted.load(Ordering::Relaxed);
            if attempted >= end {
                return;
            }
            match self.target.compare_exchange_weak(
                end,
                attempted,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => end = actual,
            }
        }
    }
}

/// A per-worker handle to the loop's shared coordination state, passed to
/// every body invocation.
///
/// Each worker owns one `LoopState` (its `current_index` is private to that
/// worker); the `Stop`/`Break`/failure flags it exposes are shared across
/// every worker in the same `for_each` call.
pub struct LoopState {
    shared: Arc<Shared>,
    current_index: Cell<u64>,
}

impl LoopState {
    /// The iteration index this worker most recently claimed.
    pub fn current_index(&self) -> u64 {
        self.current_index.get()
    }

    /// Signals every worker to claim no further iterations. Iterations
    /// already in flight are not preempted.
    pub fn stop(&self) {
        self.shared.is_stopped.store(true, Ordering::Release);
    }

    /// Signals that iterations at or after `index` should be skipped;
    /// iterations before it still run to completion. The lowest index ever
    /// passed wins across every caller.
    pub fn break_(&self, index: u64) {
        self.shared.lowest_break.update(index);
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped.load(Ordering::Acquire)
    }

    pub fn is_exceptional(&self) -> bool {
        self.shared.is_exceptional.load(Ordering::Acquire)
    }

    pub fn lowest_break_iteration(&self) -> Option<u64> {
        self.shared.lowest_break.get()
    }

    /// `true` once `stop()` was called, a body elsewhere panicked, or
    /// `break_` was called with an index at or before this worker's current
    /// one. Bodies that want to abort promptly should poll this.
    pub fn should_exit_current_iteration(&self) -> bool {
        self.is_stopped()
            || self.is_exceptional()
            || matches!(self.lowest_break_iteration(), Some(lowest) if lowest <= self.current_index())
    }
}

struct Cursor<T> {
    source: Box<dyn Iterator<Item = T> + Send>,
    next_index: u64,
}

struct WaitGroup {
    remaining: Mutex<u32>,
    idle: Condvar,
}

impl WaitGroup {
    fn new() -> Self {
        Self {
            remaining: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    fn add(&self, n: u32) {
        *self.remaining.lock().unwrap() += n;
    }

    fn done(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        *remaining -= 1;
        if *remaining == 0 {
            self.idle.notify_all();
        }
    }

    fn wait(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        while *remaining > 0 {
            remaining = self.idle.wait(remaining).unwrap();
        }
    }
}

/// Guards the release of a worker's local state: ordinarily just a deferred
/// call to `local_finally`, but structured as a drop guard (in the spirit of
/// `pool::State::run`'s `SpawnOnDrop`) so the call still happens if a future
/// change to `run_worker` adds an early return.
struct LocalGuard<'a, L> {
    local: Option<L>,
    finally: &'a (dyn Fn(L) + Send + Sync),
}

impl<L> Drop for LocalGuard<'_, L> {
    fn drop(&mut self) {
        if let Some(local) = self.local.take() {
            (self.finally)(local);
        }
    }
}

struct Job<'a, T, L> {
    cursor: Mutex<Cursor<T>>,
    shared: Arc<Shared>,
    wait_group: Arc<WaitGroup>,
    executor: &'a (dyn Executor + Send + Sync),
    body: Box<dyn Fn(T, &LoopState, L) -> L + Send + Sync + 'a>,
    local_init: Arc<dyn Fn() -> L + Send + Sync>,
    local_finally: Arc<dyn Fn(L) + Send + Sync>,
}

fn run_worker<T: Send + 'static, L: Send + 'static>(job: Arc<Job<'_, T, L>>) {
    let mut guard = LocalGuard {
        local: Some((job.local_init)()),
        finally: job.local_finally.as_ref(),
    };

    loop {
        let claimed = {
            let mut cursor = job.cursor.lock().unwrap();
            if job.shared.should_exit_before_claim(cursor.next_index) {
                None
            } else {
                cursor.source.next().map(|item| {
                    let index = cursor.next_index;
                    cursor.next_index += 1;
                    (item, index)
                })
            }
        };
        let Some((item, index)) = claimed else {
            break;
        };

        if job.shared.next_submission_slot() {
            submit_worker(&job);
        }

        let state = LoopState {
            shared: job.shared.clone(),
            current_index: Cell::new(index),
        };
        let local = guard
            .local
            .take()
            .expect("a worker owns its local state between claims");
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (job.body)(item, &state, local))) {
            Ok(next_local) => guard.local = Some(next_local),
            Err(payload) => {
                job.shared.record_failure(Failure::from_panic(payload));
                // The local value that was being transformed was dropped
                // during the unwind; there is nothing left to finalize.
                guard.local = None;
                break;
            }
        }
    }

    drop(guard);
    job.wait_group.done();
}

fn submit_worker<T: Send + 'static, L: Send + 'static>(job: &Arc<Job<'_, T, L>>) {
    job.wait_group.add(1);
    // SAFETY: `for_each_with_local` calls `job.wait_group.wait()` before
    // returning, and every task submitted here calls `job.wait_group.done()`
    // before it finishes, so this erased clone (and the `executor`/`body`
    // borrows `Job` carries) is always dropped while the real lifetime is
    // still in scope. Same lifetime-extension shape as
    // `checkito::parallel::Executor::iterate_with`'s `Arc::from_raw(Arc::into_raw(..))`.
    let extended: Arc<Job<'static, T, L>> =
        unsafe { Arc::from_raw(Arc::into_raw(job.clone()) as *const Job<'static, T, L>) };
    let task: Task = Box::new(move || run_worker(extended));
    match job.executor.execute(task) {
        Ok(()) => job.shared.mark_accepted(),
        Err(_) => {
            job.wait_group.done();
            job.shared.close_submissions();
        }
    }
}

/// Drives a data-parallel `for_each` over a source, with optional per-worker
/// local state of type `L` (use `ParallelLoop<()>`, built with
/// [`ParallelLoop::new`], when no local state is needed).
pub struct ParallelLoop<L = ()> {
    local_init: Arc<dyn Fn() -> L + Send + Sync>,
    local_finally: Arc<dyn Fn(L) + Send + Sync>,
    actual_degree_of_parallelism: AtomicU32,
}

impl ParallelLoop<()> {
    /// A loop engine with no per-worker local state.
    pub fn new() -> Self {
        Self::with_local(|| (), |()| {})
    }
}

impl Default for ParallelLoop<()> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L> ParallelLoop<L> {
    /// A loop engine whose workers carry local state `L`, built once per
    /// worker with `local_init` and released once per worker with
    /// `local_finally`.
    pub fn with_local(
        local_init: impl Fn() -> L + Send + Sync + 'static,
        local_finally: impl Fn(L) + Send + Sync + 'static,
    ) -> Self {
        Self {
            local_init: Arc::new(local_init),
            local_finally: Arc::new(local_finally),
            actual_degree_of_parallelism: AtomicU32::new(0),
        }
    }

    /// The number of workers (including the driver) that actually ran during
    /// the most recent `for_each`/`for_each_with_local` call on this engine.
    ///
    /// Reading this while another call is in flight on the same engine isn't
    /// meaningful; each `ParallelLoop` is meant to drive one loop at a time.
    pub fn actual_degree_of_parallelism(&self) -> u32 {
        self.actual_degree_of_parallelism.load(Ordering::Acquire)
    }

    /// Runs `body` over `source`, threading per-worker local state `L`
    /// through each invocation.
    ///
    /// The calling thread runs as worker 0; `executor` fields in additional
    /// workers up to `options.max_degree_of_parallelism` (further capped by
    /// `executor.core_size()`), submitting one more for every iteration
    /// claimed so the pool never grows past what the source actually needs.
    /// Returns once every worker has finished.
    pub fn for_each_with_local<'caller, T, E, I>(
        &self,
        executor: &'caller E,
        source: I,
        options: impl Into<ParallelOptions>,
        body: impl Fn(T, &LoopState, L) -> L + Send + Sync + 'caller,
    ) -> Result<LoopResult, AggregateError>
    where
        T: Send + 'static,
        L: Send + 'static,
        E: Executor + Send + Sync + 'caller,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let options = options.into();
        let requested = if options.max_degree_of_parallelism == 0 {
            u32::MAX
        } else {
            options.max_degree_of_parallelism
        };
        let target = requested.min(executor.core_size().unwrap_or(u32::MAX)).max(1);

        let shared = Arc::new(Shared {
            is_stopped: AtomicBool::new(false),
            is_exceptional: AtomicBool::new(false),
            lowest_break: LowestBreak::new(),
            failure: Mutex::new(None),
            attempted: AtomicU32::new(1),
            accepted: AtomicU32::new(1),
            target: AtomicU32::new(target),
        });
        let wait_group = Arc::new(WaitGroup::new());
        wait_group.add(1); // the driver, worker 0

        let job = Arc::new(Job {
            cursor: Mutex::new(Cursor {
                source: Box::new(source.into_iter().fuse()),
                next_index: 0,
            }),
            shared: shared.clone(),
            wait_group: wait_group.clone(),
            executor,
            body: Box::new(body),
            local_init: self.local_init.clone(),
            local_finally: self.local_finally.clone(),
        });

        run_worker(job.clone());
        wait_group.wait();

        let actual = shared.accepted.load(Ordering::Acquire).min(target);
        self.actual_degree_of_parallelism.store(actual, Ordering::Release);

        let failure = shared.failure.lock().unwrap().take();
        let result = match failure {
            Some(failure) => Err(AggregateError { failure }),
            None => Ok(LoopResult {
                is_completed: !shared.is_stopped.load(Ordering::Acquire)
                    && !shared.is_exceptional.load(Ordering::Acquire)
                    && shared.lowest_break.get().is_none(),
                lowest_break_iteration: shared.lowest_break.get(),
            }),
        };
        result
    }
}

impl ParallelLoop<()> {
    /// Runs `body` over `source` with no per-worker local state.
    pub fn for_each<T, E, I>(
        &self,
        executor: &E,
        source: I,
        options: impl Into<ParallelOptions>,
        body: impl Fn(T, &LoopState) + Send + Sync,
    ) -> Result<LoopResult, AggregateError>
    where
        T: Send + 'static,
        E: Executor + Send + Sync,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        self.for_each_with_local(executor, source, options, move |item, state, ()| body(item, state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_break_tracks_the_minimum() {
        let lowest = LowestBreak::new();
        assert_eq!(lowest.get(), None);
        lowest.update(7);
        lowest.update(5);
        lowest.update(9);
        assert_eq!(lowest.get(), Some(5));
    }

    #[test]
    fn cast_recovers_string_panic_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(cast(payload), Some(Cow::Borrowed("boom")));

        let payload: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(cast(payload), Some(Cow::Owned(String::from("kaboom"))));

        let payload: Box<dyn Any + Send> = Box::new(42i32);
        assert_eq!(cast(payload), None);
    }
}
