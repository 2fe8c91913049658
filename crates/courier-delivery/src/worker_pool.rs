//! Fixed-size worker pool with supervision.
//!
//! Each worker gets a private bounded queue; a record goes to worker
//! `id mod worker_count`. Workers run under a supervisor task that turns an
//! error return or a panic into a [`WorkerEvent::Failed`], so the
//! coordinator never waits on a job whose worker is gone.

use std::{sync::Arc, time::Duration};

use courier_core::{Clock, RecordId};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    backoff::Backoff,
    client::DeliveryClient,
    coordinator::DeliveryConfig,
    error::{DeliveryError, Result},
    worker::{DeliveryWorker, Job, WorkerEvent, WorkerSettings},
};

/// Index of the worker that handles record `id` in a pool of `worker_count`.
///
/// Pure modulo of the id, so a record always lands on the same worker within
/// one process run. Negative ids map into range as well.
pub fn worker_index(id: RecordId, worker_count: usize) -> usize {
    let count = i64::try_from(worker_count.max(1)).unwrap_or(i64::MAX);
    usize::try_from(id.0.rem_euclid(count)).unwrap_or(0)
}

/// Worker pool that owns the workers' queues and supervisor tasks.
pub struct WorkerPool {
    senders: Vec<mpsc::Sender<Job>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `config.worker_count` workers reporting on `events`.
    ///
    /// Workers stop when `cancellation_token` is cancelled.
    pub fn spawn(
        config: &DeliveryConfig,
        client: DeliveryClient,
        events: mpsc::Sender<WorkerEvent>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(
            worker_count = config.worker_count,
            queue_size = config.queue_size,
            "spawning delivery workers"
        );

        let settings = Arc::new(WorkerSettings {
            endpoint_url: config.endpoint_url.clone(),
            delivery_attempts: config.delivery_attempts,
        });

        let mut senders = Vec::with_capacity(config.worker_count);
        let mut worker_handles = Vec::with_capacity(config.worker_count);

        for worker_id in 0..config.worker_count {
            let (sender, receiver) = mpsc::channel(config.queue_size.max(1));
            let worker = DeliveryWorker::new(
                worker_id,
                settings.clone(),
                client.clone(),
                Backoff::new(config.delivery_backoff.clone()),
                receiver,
                events.clone(),
                cancellation_token.clone(),
                clock.clone(),
            );

            let events = events.clone();
            let handle = tokio::spawn(async move {
                let failure = match tokio::spawn(worker.run()).await {
                    Ok(Ok(())) => None,
                    Ok(Err(error)) => {
                        error!(worker_id, error = %error, "delivery worker terminated with error");
                        Some(error)
                    },
                    Err(join_error) => {
                        error!(worker_id, error = %join_error, "delivery worker panicked");
                        Some(DeliveryError::WorkerPanic {
                            worker_id,
                            message: join_error.to_string(),
                        })
                    },
                };

                if let Some(error) = failure {
                    // Receiver gone means the coordinator already stopped.
                    let _ = events.send(WorkerEvent::Failed { worker_id, error }).await;
                }
            });

            senders.push(sender);
            worker_handles.push(handle);
        }

        Self { senders, cancellation_token, worker_handles }
    }

    /// Number of workers in the pool.
    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    /// Queue of the worker responsible for record `id`, with its index.
    ///
    /// Returns `None` once the pool has been shut down.
    pub fn sender_for(&self, id: RecordId) -> Option<(usize, mpsc::Sender<Job>)> {
        let index = worker_index(id, self.senders.len());
        self.senders.get(index).map(|sender| (index, sender.clone()))
    }

    /// Cancels every worker and waits for all of them to stop.
    ///
    /// In-flight deliveries are aborted. Queued jobs are dropped.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if the workers do not stop within
    /// `timeout`, or `WorkerPanic` if a supervisor task itself failed.
    pub async fn shutdown_graceful(&mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "stopping delivery workers"
        );

        self.cancellation_token.cancel();
        self.senders.clear();

        let handles = std::mem::take(&mut self.worker_handles);
        let join_all = async {
            let mut first_error = None;
            for (worker_id, handle) in handles.into_iter().enumerate() {
                if let Err(join_error) = handle.await {
                    error!(worker_id, error = %join_error, "worker supervisor failed during shutdown");
                    first_error.get_or_insert(DeliveryError::WorkerPanic {
                        worker_id,
                        message: join_error.to_string(),
                    });
                }
            }
            first_error
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(None) => {
                info!("delivery workers stopped");
                Ok(())
            },
            Ok(Some(error)) => Err(error),
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout_seconds: timeout.as_secs() })
            },
        }
    }

    /// Check if any workers are still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active_count = self.worker_handles.iter().filter(|h| !h.is_finished()).count();

        if active_count > 0 && !self.cancellation_token.is_cancelled() {
            warn!(
                active_workers = active_count,
                "worker pool dropped without shutdown, cancelling workers"
            );
            self.cancellation_token.cancel();
        }
    }
}
