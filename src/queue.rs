//! Fixed-size pools of background workers.
//!
//! Long operations (model answers, image generation) run here so that the
//! dispatcher keeps handling updates. Jobs share one queue and are picked up
//! by whichever worker is free.

use futures_util::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Unit of work executed by a pool
pub type Job = BoxFuture<'static, anyhow::Result<()>>;

/// Errors returned by [`WorkerPool`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// Pool was shut down
    #[error("worker pool '{0}' is stopped")]
    Stopped(String),
}

/// Named pool of tokio workers reading jobs from a shared queue
pub struct WorkerPool {
    name: String,
    sender: mpsc::UnboundedSender<Job>,
    cancel: CancellationToken,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns `workers` workers (at least one)
    #[must_use]
    pub fn start(name: &str, workers: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let cancel = CancellationToken::new();
        let workers = workers.max(1);

        let handles = (0..workers)
            .map(|index| {
                let receiver = Arc::clone(&receiver);
                let cancel = cancel.clone();
                let pool = name.to_string();
                tokio::spawn(worker_loop(pool, index, receiver, cancel))
            })
            .collect();

        info!(pool = name, workers, "Worker pool started");
        Self {
            name: name.to_string(),
            sender,
            cancel,
            handles: std::sync::Mutex::new(handles),
        }
    }

    /// Pool name used in logs
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues a job.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Stopped` after [`WorkerPool::shutdown`].
    pub fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(PoolError::Stopped(self.name.clone()));
        }
        self.sender
            .send(Box::pin(job))
            .map_err(|_| PoolError::Stopped(self.name.clone()))
    }

    /// Stops the workers and waits for them to exit.
    ///
    /// A job that is running is dropped at its next await point.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles = self
            .handles
            .lock()
            .map(|mut guard| std::mem::take(&mut *guard))
            .unwrap_or_default();
        for handle in handles {
            let _ = handle.await;
        }
        info!(pool = %self.name, "Worker pool stopped");
    }
}

async fn worker_loop(
    pool: String,
    index: usize,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    cancel: CancellationToken,
) {
    debug!(pool = %pool, worker = index, "Worker started");
    loop {
        let job = tokio::select! {
            () = cancel.cancelled() => break,
            job = async { receiver.lock().await.recv().await } => job,
        };
        let Some(job) = job else {
            break;
        };

        tokio::select! {
            () = cancel.cancelled() => break,
            result = job => {
                if let Err(e) = result {
                    error!(pool = %pool, worker = index, "Job failed: {e:#}");
                }
            }
        }
    }
    debug!(pool = %pool, worker = index, "Worker exited");
}
