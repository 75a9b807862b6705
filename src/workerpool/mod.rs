//! # Worker Pool Module
//!
//! A fixed-size pool of worker threads, each with its own job queue and
//! condition variable. Jobs are dispatched to workers by uniform random
//! selection at enqueue time; there is no global queue and no FIFO
//! guarantee across workers.
//!
//! The engine uses the pool for exactly one thing: running the
//! self-rescheduling table roll off the caller's thread. The pool is
//! deliberately generic; any `FnOnce() + Send` job can be enqueued.
//!
//! ## Shutdown
//!
//! Dropping the pool flips each worker's quit flag, wakes every worker,
//! and joins the threads. A worker drains the jobs already in its queue
//! before exiting; jobs enqueued after shutdown began may be dropped.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::{debug, info};

/// A unit of work executed on a worker thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

// ------------------------------------------------------------------------------------------------
// WorkerPool
// ------------------------------------------------------------------------------------------------

/// A pool of worker threads with per-worker queues.
pub struct WorkerPool {
    workers: Vec<Worker>,
}

struct Worker {
    shared: Arc<WorkerState>,
    thread: Option<JoinHandle<()>>,
}

struct WorkerState {
    /// Pending jobs for this worker.
    queue: Mutex<VecDeque<Job>>,

    /// Signaled when a job is pushed or shutdown begins.
    available: Condvar,

    /// Once set, the worker drains its queue and exits.
    quit: AtomicBool,
}

impl WorkerPool {
    /// Spawns `num_threads` workers. Must be at least one.
    pub fn new(num_threads: usize) -> Self {
        assert!(num_threads > 0, "worker pool needs at least one thread");

        let workers = (0..num_threads)
            .map(|idx| {
                let shared = Arc::new(WorkerState {
                    queue: Mutex::new(VecDeque::new()),
                    available: Condvar::new(),
                    quit: AtomicBool::new(false),
                });
                let state = Arc::clone(&shared);
                let thread = std::thread::Builder::new()
                    .name(format!("strata-worker-{idx}"))
                    .spawn(move || Self::toil(state))
                    .expect("failed to spawn worker thread");
                Worker {
                    shared,
                    thread: Some(thread),
                }
            })
            .collect();

        info!(num_threads, "worker pool started");
        Self { workers }
    }

    /// Queues a job on a uniformly random worker and wakes it.
    ///
    /// The job runs on a thread distinct from the caller's.
    pub fn enqueue(&self, job: impl FnOnce() + Send + 'static) {
        let idx = rand::thread_rng().gen_range(0..self.workers.len());
        let state = &self.workers[idx].shared;

        state.queue.lock().push_back(Box::new(job));
        state.available.notify_one();
    }

    /// Number of worker threads in the pool.
    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    /// Life of a worker thread: wait for work, run it, repeat until quit.
    fn toil(state: Arc<WorkerState>) {
        loop {
            let job = {
                let mut queue = state.queue.lock();
                loop {
                    if let Some(job) = queue.pop_front() {
                        break Some(job);
                    }
                    if state.quit.load(Ordering::Acquire) {
                        break None;
                    }
                    // Re-checked on every wakeup; spurious wakeups land
                    // back here harmlessly.
                    state.available.wait(&mut queue);
                }
            };

            match job {
                Some(job) => job(),
                None => return,
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        debug!("shutting down worker pool");
        for worker in &self.workers {
            worker.shared.quit.store(true, Ordering::Release);
            worker.shared.available.notify_all();
        }
        let current = std::thread::current().id();
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.thread().id() == current {
                    // The pool can be dropped from inside one of its own
                    // jobs; that worker detaches instead of self-joining.
                    continue;
                }
                let _ = thread.join();
            }
        }
    }
}
