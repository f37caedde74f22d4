use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info};

/// A unit of background work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Worker pool is shut down")]
    ShutDown,
}

/// Where the job runner sends its work. Implementations decide how and
/// when tasks run; callers only rely on `execute` not waiting for them.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: Task) -> Result<(), PoolError>;
}

/// Fixed-size pool of worker threads fed through a crossbeam channel.
pub struct WorkerPool {
    task_sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// # Panics
    /// Panics if `worker_count` is 0.
    pub fn new(worker_count: usize) -> Self {
        assert!(worker_count > 0, "worker_count must be > 0");
        // Unbounded so `execute` never blocks the submitting request.
        let (task_sender, task_receiver) = unbounded::<Task>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let workers = (0..worker_count)
            .map(|worker_id| {
                let rx = task_receiver.clone();
                let shutdown_flag = Arc::clone(&shutdown);
                thread::Builder::new()
                    .name(format!("esvsync-worker-{}", worker_id))
                    .spawn(move || run_worker(worker_id, rx, shutdown_flag))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    error!("Failed to spawn worker thread: {}", e);
                    None
                }
            })
            .collect::<Vec<_>>();

        info!("Started {} workers", workers.len());

        Self {
            task_sender: Some(task_sender),
            workers,
            shutdown,
        }
    }

    /// Stops accepting tasks. Workers run whatever is still queued, then exit.
    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Closes the queue and waits until every queued task has run.
    pub fn wait(mut self) {
        self.join_workers();
    }

    fn join_workers(&mut self) {
        // Dropping the sender lets workers drain the queue and exit.
        self.task_sender.take();

        for (i, worker) in self.workers.drain(..).enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }
}

impl TaskExecutor for WorkerPool {
    fn execute(&self, task: Task) -> Result<(), PoolError> {
        if self.is_shutdown() {
            return Err(PoolError::ShutDown);
        }
        self.task_sender
            .as_ref()
            .ok_or(PoolError::ShutDown)?
            .send(task)
            .map_err(|_| PoolError::ShutDown)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.join_workers();
        }
    }
}

fn run_worker(worker_id: usize, task_receiver: Receiver<Task>, shutdown: Arc<AtomicBool>) {
    debug!("Worker {} started", worker_id);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            drain(worker_id, &task_receiver);
            break;
        }

        match task_receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(task) => task(),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                debug!("Worker {} task channel disconnected", worker_id);
                break;
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}

/// Runs tasks accepted before shutdown so none is silently lost.
fn drain(worker_id: usize, task_receiver: &Receiver<Task>) {
    let mut drained = 0usize;
    while let Ok(task) = task_receiver.try_recv() {
        task();
        drained += 1;
    }
    if drained > 0 {
        debug!("Worker {} ran {} queued tasks after shutdown", worker_id, drained);
    }
}
