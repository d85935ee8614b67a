use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use threadloom::executor::{Executor, Rejected, Task};

/// An executor that runs every task on its own detached thread, accepting at
/// most `capacity` submissions (`usize::MAX` for "never reject").
pub struct CountingExecutor {
    accepted: AtomicUsize,
    capacity: usize,
    live: Arc<AtomicUsize>,
    peak_live: Arc<AtomicUsize>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl CountingExecutor {
    pub fn new(capacity: usize) -> Self {
        Self {
            accepted: AtomicUsize::new(0),
            capacity,
            live: Arc::new(AtomicUsize::new(0)),
            peak_live: Arc::new(AtomicUsize::new(0)),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn peak_live(&self) -> usize {
        self.peak_live.load(Ordering::SeqCst)
    }

    /// Blocks until every spawned thread has finished. Call after the
    /// `for_each` under test has returned.
    pub fn join(&self) {
        for handle in self.handles.lock().unwrap().drain(..) {
            handle.join().unwrap();
        }
    }
}

impl Executor for CountingExecutor {
    fn execute(&self, task: Task) -> Result<(), Rejected> {
        if self.accepted.fetch_add(1, Ordering::SeqCst) >= self.capacity {
            self.accepted.fetch_sub(1, Ordering::SeqCst);
            return Err(Rejected);
        }
        let live = self.live.clone();
        let peak_live = self.peak_live.clone();
        let handle = thread::spawn(move || {
            let now = live.fetch_add(1, Ordering::SeqCst) + 1;
            peak_live.fetch_max(now, Ordering::SeqCst);
            task();
            live.fetch_sub(1, Ordering::SeqCst);
        });
        self.handles.lock().unwrap().push(handle);
        Ok(())
    }
}

/// A process-wide pool-backed executor for tests that just need real
/// parallelism without caring about rejection behavior.
pub fn shared_pool() -> &'static threadloom::Pool {
    static POOL: OnceLock<threadloom::Pool> = OnceLock::new();
    POOL.get_or_init(|| threadloom::Pool::new(Some(8)))
}
