//! Bounded client worker pool.
//!
//! Each transaction owns a [`WorkerPool`] that clients use to run item I/O in
//! parallel. Threads are spawned lazily up to a cap and exit after being idle
//! for a second. Before prepare the coordinator drains the pool so no client
//! work is still touching the transaction's items.

use crate::error::{CoreError, CoreResult};
use crate::lock::LockLevel;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const IDLE_EXIT: Duration = Duration::from_secs(1);

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Job>,
    threads: usize,
    idle: usize,
    running: usize,
    max_threads: usize,
    spawned: usize,
    shutdown: bool,
}

struct PoolShared {
    name: String,
    state: Mutex<PoolState>,
    work: Condvar,
    quiet: Condvar,
}

/// A lazily grown thread pool with a hard thread cap.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Creates a pool whose threads are named `<name>-<n>`.
    #[must_use]
    pub fn new(name: impl Into<String>, max_threads: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                name: name.into(),
                state: Mutex::new(PoolState {
                    max_threads: max_threads.max(1),
                    ..PoolState::default()
                }),
                work: Condvar::new(),
                quiet: Condvar::new(),
            }),
        }
    }

    /// Queues `task` and returns a handle to its result.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` after shutdown, or `Io` if a worker thread
    /// cannot be spawned.
    pub fn submit<F, T>(&self, task: F) -> CoreResult<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let job: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(task));
            let _ = tx.send(result);
        });

        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(CoreError::invalid_operation(format!(
                "worker pool {} is shut down",
                self.shared.name
            )));
        }
        state.queue.push_back(job);
        let pending = state.queue.len();
        if state.idle < pending && state.threads < state.max_threads {
            state.spawned += 1;
            let thread_name = format!("{}-{}", self.shared.name, state.spawned);
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name(thread_name)
                .spawn(move || worker_loop(&shared))?;
            state.threads += 1;
        }
        drop(state);
        self.shared.work.notify_one();
        Ok(TaskHandle { rx })
    }

    /// Waits until no task is queued or running.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if client work is still running after `timeout`.
    pub fn drain(&self, timeout: Duration) -> CoreResult<()> {
        let started = Instant::now();
        let deadline = started.checked_add(timeout);
        let mut state = self.shared.state.lock();
        while !state.queue.is_empty() || state.running > 0 {
            let timed_out = match deadline {
                Some(deadline) => self.shared.quiet.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.shared.quiet.wait(&mut state);
                    false
                }
            };
            if timed_out && (!state.queue.is_empty() || state.running > 0) {
                return Err(CoreError::lock_timeout(
                    format!("worker pool {}", self.shared.name),
                    LockLevel::Coordinator,
                    &self.shared.name,
                    None,
                    state.queue.len() + state.running,
                    started.elapsed(),
                ));
            }
        }
        Ok(())
    }

    /// Changes the thread cap. Existing threads above the cap exit when idle.
    pub fn set_max_threads(&self, max_threads: usize) {
        self.shared.state.lock().max_threads = max_threads.max(1);
        self.shared.work.notify_all();
    }

    /// Returns the number of live worker threads.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.shared.state.lock().threads
    }

    /// Rejects new tasks and lets workers exit once the queue is empty.
    pub fn shutdown(&self) {
        self.shared.state.lock().shutdown = true;
        self.shared.work.notify_all();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.name)
            .field("threads", &state.threads)
            .field("queued", &state.queue.len())
            .finish_non_exhaustive()
    }
}

fn worker_loop(shared: &PoolShared) {
    let mut state = shared.state.lock();
    loop {
        if state.threads > state.max_threads {
            break;
        }
        if let Some(job) = state.queue.pop_front() {
            state.running += 1;
            drop(state);
            job();
            state = shared.state.lock();
            state.running -= 1;
            if state.queue.is_empty() && state.running == 0 {
                shared.quiet.notify_all();
            }
            continue;
        }
        if state.shutdown {
            break;
        }
        state.idle += 1;
        let timed_out = shared.work.wait_for(&mut state, IDLE_EXIT).timed_out();
        state.idle -= 1;
        if timed_out && state.queue.is_empty() {
            break;
        }
    }
    state.threads -= 1;
    drop(state);
    shared.quiet.notify_all();
}

/// The pending result of a submitted task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: Receiver<thread::Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task finishes and returns its result.
    ///
    /// # Errors
    ///
    /// Returns `Interrupted` if the task panicked or was discarded.
    pub fn join(self) -> CoreResult<T> {
        match self.rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(CoreError::interrupted("client task panicked")),
            Err(_) => Err(CoreError::interrupted("client task was discarded")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn tasks_return_results() {
        let pool = WorkerPool::new("test", 2);
        let handles: Vec<_> = (0..8).map(|i| pool.submit(move || i * 2).unwrap()).collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results, vec![0, 2, 4, 6, 8, 10, 12, 14]);
        assert!(pool.thread_count() <= 2);
    }

    #[test]
    fn drain_waits_for_running_work() {
        let pool = WorkerPool::new("drain", 4);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let done = Arc::clone(&done);
            pool.submit(move || {
                thread::sleep(Duration::from_millis(20));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.drain(Duration::from_secs(5)).unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn drain_times_out() {
        let pool = WorkerPool::new("slow", 1);
        pool.submit(|| thread::sleep(Duration::from_millis(300)))
            .unwrap();
        assert!(pool.drain(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn panics_are_reported() {
        let pool = WorkerPool::new("panic", 1);
        let handle = pool.submit(|| -> u32 { panic!("boom") }).unwrap();
        assert!(matches!(handle.join(), Err(CoreError::Interrupted { .. })));
        assert_eq!(pool.submit(|| 7).unwrap().join().unwrap(), 7);
    }

    #[test]
    fn shutdown_rejects_new_tasks() {
        let pool = WorkerPool::new("closed", 1);
        pool.shutdown();
        assert!(pool.submit(|| ()).is_err());
    }
}
