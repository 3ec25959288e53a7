use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::{debug, warn};

use crate::error::{PeerError, Result};

/// A unit of work handed to a pool.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Executes submitted tasks on background workers.
///
/// The server depends only on this trait; [`ThreadPool`] is the default.
pub trait WorkerPool: Send + Sync {
    /// Set the number of workers used by the next [`start`](Self::start).
    fn configure(&self, worker_count: usize) -> Result<()>;

    /// Spawn the workers. Starting a running pool is a no-op.
    fn start(&self) -> Result<()>;

    /// Queue `task` for execution.
    fn submit(&self, task: Task) -> Result<()>;

    /// Block until every submitted task has finished.
    fn wait_for_idle(&self);

    /// Stop accepting tasks, let queued ones drain, and join the workers.
    fn stop(&self);

    fn is_running(&self) -> bool;
}

/// Fixed-size pool of OS threads pulling tasks from a shared channel.
#[derive(Debug)]
pub struct ThreadPool {
    state: Mutex<PoolState>,
    pending: Arc<Pending>,
}

#[derive(Debug)]
struct PoolState {
    worker_count: usize,
    sender: Option<mpsc::Sender<Task>>,
    workers: Vec<Worker>,
}

/// Count of submitted tasks that have not finished yet.
#[derive(Debug, Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        *lock(&self.count) += 1;
    }

    fn done(&self) {
        let mut count = lock(&self.count);
        *count = count.saturating_sub(1);
        self.idle.notify_all();
    }

    /// Block until at most `remaining` tasks are unfinished.
    fn wait(&self, remaining: usize) {
        let mut count = lock(&self.count);
        while *count > remaining {
            count = self
                .idle
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl ThreadPool {
    /// An idle pool that will run `worker_count` threads once started.
    pub fn new(worker_count: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                worker_count,
                sender: None,
                workers: Vec::new(),
            }),
            pending: Arc::new(Pending::default()),
        }
    }

    pub fn worker_count(&self) -> usize {
        lock(&self.state).worker_count
    }

    fn on_worker_thread(&self) -> bool {
        let current = thread::current().id();
        lock(&self.state)
            .workers
            .iter()
            .any(|worker| worker.thread.thread().id() == current)
    }
}

impl WorkerPool for ThreadPool {
    fn configure(&self, worker_count: usize) -> Result<()> {
        if worker_count == 0 {
            return Err(PeerError::NoWorkers);
        }
        lock(&self.state).worker_count = worker_count;
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.sender.is_some() {
            return Ok(());
        }
        if state.worker_count == 0 {
            return Err(PeerError::NoWorkers);
        }

        let (sender, receiver) = mpsc::channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(state.worker_count);
        for id in 0..state.worker_count {
            match Worker::spawn(id, Arc::clone(&receiver), Arc::clone(&self.pending)) {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    drop(sender);
                    for worker in workers {
                        worker.join();
                    }
                    return Err(PeerError::Spawn(err));
                }
            }
        }

        debug!(workers = workers.len(), "worker pool started");
        state.sender = Some(sender);
        state.workers = workers;
        Ok(())
    }

    fn submit(&self, task: Task) -> Result<()> {
        let state = lock(&self.state);
        let sender = state.sender.as_ref().ok_or(PeerError::PoolStopped)?;
        self.pending.add();
        if sender.send(task).is_err() {
            self.pending.done();
            return Err(PeerError::PoolStopped);
        }
        Ok(())
    }

    fn wait_for_idle(&self) {
        // A task waiting on its own pool only waits for the others.
        let remaining = usize::from(self.on_worker_thread());
        self.pending.wait(remaining);
    }

    fn stop(&self) {
        let workers = {
            let mut state = lock(&self.state);
            // Closing the channel ends each worker once the queue drains.
            drop(state.sender.take());
            std::mem::take(&mut state.workers)
        };
        if workers.is_empty() {
            return;
        }

        let current = thread::current().id();
        for worker in workers {
            // A task stopping its own pool cannot join itself.
            if worker.thread.thread().id() != current {
                worker.join();
            }
        }
        debug!("worker pool stopped");
    }

    fn is_running(&self) -> bool {
        lock(&self.state).sender.is_some()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn spawn(
        id: usize,
        receiver: Arc<Mutex<mpsc::Receiver<Task>>>,
        pending: Arc<Pending>,
    ) -> std::io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("netbase-worker-{id}"))
            .spawn(move || loop {
                let message = lock(&receiver).recv();
                match message {
                    Ok(task) => {
                        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                            warn!(worker = id, "task panicked");
                        }
                        pending.done();
                    }
                    Err(_) => {
                        debug!(worker = id, "worker exiting");
                        break;
                    }
                }
            })?;
        Ok(Self { id, thread })
    }

    fn join(self) {
        if self.thread.join().is_err() {
            warn!(worker = self.id, "worker thread panicked");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn runs_submitted_tasks() {
        let pool = ThreadPool::new(3);
        pool.start().unwrap();
        assert!(pool.is_running());

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        pool.wait_for_idle();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        pool.stop();
        assert!(!pool.is_running());
    }

    #[test]
    fn submit_requires_running_pool() {
        let pool = ThreadPool::new(1);
        let err = pool.submit(Box::new(|| {})).unwrap_err();
        assert!(matches!(err, PeerError::PoolStopped));

        pool.start().unwrap();
        pool.stop();
        let err = pool.submit(Box::new(|| {})).unwrap_err();
        assert!(matches!(err, PeerError::PoolStopped));
    }

    #[test]
    fn zero_workers_rejected() {
        let pool = ThreadPool::new(0);
        assert!(matches!(pool.start().unwrap_err(), PeerError::NoWorkers));
        assert!(matches!(pool.configure(0).unwrap_err(), PeerError::NoWorkers));
        pool.configure(2).unwrap();
        assert_eq!(pool.worker_count(), 2);
        pool.start().unwrap();
    }

    #[test]
    fn wait_for_idle_waits_for_slow_tasks() {
        let pool = ThreadPool::new(2);
        pool.start().unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let done = Arc::clone(&done);
            pool.submit(Box::new(move || {
                thread::sleep(Duration::from_millis(50));
                done.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.wait_for_idle();
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_task_does_not_wedge_pool() {
        let pool = ThreadPool::new(1);
        pool.start().unwrap();
        pool.submit(Box::new(|| panic!("task failure"))).unwrap();
        pool.wait_for_idle();

        let ran = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&ran);
        pool.submit(Box::new(move || {
            flag.store(1, Ordering::SeqCst);
        }))
        .unwrap();
        pool.wait_for_idle();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let pool = ThreadPool::new(1);
        pool.start().unwrap();
        pool.start().unwrap();
        pool.stop();
        pool.stop();
        pool.start().unwrap();
        assert!(pool.is_running());
    }
}
