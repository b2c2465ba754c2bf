//! Bounded worker pool.
//!
//! A fixed set of threads drains a FIFO queue of opaque closures under a
//! mutex and condition variable. There are no priorities and no per-task
//! timeouts; request timeouts are the reactors' job. `enqueue` fails only
//! after `shutdown`.

use std::collections::VecDeque;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

/// A unit of work executed on a pool thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Task>,
    stopping: bool,
    running: bool,
}

/// Bounded thread pool consuming tasks from a FIFO queue.
pub struct WorkerPool {
    state: Mutex<PoolState>,
    available: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates a stopped pool; call [`start`](Self::start) to spawn threads.
    #[must_use]
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                stopping: false,
                running: false,
            }),
            available: Condvar::new(),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Spawns `thread_count` worker threads. Does nothing if the pool is
    /// already running or the count is zero.
    pub fn start(self: &std::sync::Arc<Self>, thread_count: usize) {
        {
            let mut state = self.state.lock();
            if state.running || thread_count == 0 {
                return;
            }
            state.stopping = false;
            state.running = true;
        }
        let mut threads = self.threads.lock();
        threads.reserve(thread_count);
        for i in 0..thread_count {
            let pool = std::sync::Arc::clone(self);
            match std::thread::Builder::new()
                .name(format!("wasgate-worker-{i}"))
                .spawn(move || pool.run())
            {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    crate::log_error!("spawn worker {i}: {e}");
                    break;
                }
            }
        }
    }

    /// Queues a task. Returns false once the pool is stopping.
    pub fn enqueue(&self, task: Task) -> bool {
        let mut state = self.state.lock();
        if state.stopping || !state.running {
            return false;
        }
        state.queue.push_back(task);
        drop(state);
        self.available.notify_one();
        true
    }

    /// Number of queued (not yet started) tasks.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Stops the pool: sets the stopping flag, wakes every thread, joins
    /// them, and drops any tasks still queued.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.stopping = true;
        }
        self.available.notify_all();

        let handles: Vec<_> = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            let _ = handle.join();
        }

        let mut state = self.state.lock();
        state.queue.clear();
        state.running = false;
    }

    fn run(&self) {
        loop {
            let task = {
                let mut state = self.state.lock();
                loop {
                    if let Some(task) = state.queue.pop_front() {
                        break task;
                    }
                    if state.stopping {
                        return;
                    }
                    self.available.wait(&mut state);
                }
            };
            task();
        }
    }
}
