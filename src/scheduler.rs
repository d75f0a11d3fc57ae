use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::job::JobStatus;
use crate::registry::JobRegistry;

/// Executes one job to completion. Implemented by the Transcoder Driver;
/// swapped for a stub in scheduler tests so concurrency-cap and
/// cancellation-race behavior can be exercised without spawning `ffmpeg`.
#[async_trait::async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, job_id: &str, cancel: CancellationToken);
}

/// Bounded FIFO queue backed by a fixed pool of worker tasks, one per
/// `max_concurrent_jobs`. A job never runs until a worker pulls it off the
/// queue, so the number of concurrently running jobs can never exceed the
/// number of workers regardless of how many are submitted.
pub struct Scheduler {
    tx: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        registry: JobRegistry,
        runner: Arc<dyn JobRunner>,
        worker_count: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let rx = Arc::new(Mutex::new(rx));

        for worker_id in 0..worker_count.max(1) {
            let rx = rx.clone();
            let registry = registry.clone();
            let runner = runner.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                worker_loop(worker_id, rx, registry, runner, shutdown).await;
            });
        }

        Scheduler { tx, shutdown }
    }

    /// Enqueue a job that has already been inserted into the registry as
    /// `Pending`. Marks it `Queued` before handing it to the worker pool.
    pub async fn enqueue(&self, registry: &JobRegistry, job_id: String) {
        if let Some(handle) = registry.get(&job_id) {
            handle.write().await.status = JobStatus::Queued;
        }
        if self.tx.send(job_id.clone()).is_err() {
            warn!("failed to enqueue job {job_id}: worker pool channel closed");
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    registry: JobRegistry,
    runner: Arc<dyn JobRunner>,
    shutdown: CancellationToken,
) {
    info!("transcode worker {worker_id} started");
    loop {
        let job_id = {
            let mut guard = rx.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = guard.recv() => match received {
                    Some(id) => id,
                    None => break,
                },
            }
        };

        let Some(handle) = registry.get(&job_id) else {
            continue;
        };
        let cancel = {
            let job = handle.read().await;
            if job.status != JobStatus::Queued {
                // Cancelled (or otherwise moved on) while waiting in line.
                debug!("worker {worker_id} skipping job {job_id}: no longer queued");
                continue;
            }
            job.cancel.clone()
        };

        debug!("worker {worker_id} picked up job {job_id}");
        runner.run(&job_id, cancel).await;
    }
    info!("transcode worker {worker_id} stopped");
}
