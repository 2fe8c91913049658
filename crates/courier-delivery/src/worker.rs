//! Single delivery worker.
//!
//! A worker owns a bounded job queue and processes one record at a time:
//! it posts the record up to the attempt cap, sleeping per its delivery
//! backoff between failed attempts, and reports a [`JobOutcome`] on the
//! shared event channel. Workers never touch the store.

use std::sync::Arc;

use courier_core::{Clock, Record, RecordId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    backoff::Backoff,
    client::{DeliveryClient, DeliveryRequest},
    error::{DeliveryError, ErrorCategory, Result},
};

/// A record handed to a worker.
#[derive(Debug, Clone)]
pub struct Job {
    /// Decoded record to deliver.
    pub record: Record,
}

/// Result of delivering one record.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// Delivered record.
    pub record_id: RecordId,
    /// Worker that processed the job.
    pub worker_id: usize,
    /// Retry counter of the record when it was claimed.
    pub retry_count: i32,
    /// Whether the endpoint acknowledged the record.
    pub delivered: bool,
    /// Attempts made in this cycle.
    pub attempts: u32,
    /// Last attempt error when not delivered.
    pub last_error: Option<DeliveryError>,
}

/// Message from the pool to the coordinator.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A job finished, successfully or not.
    Finished(JobOutcome),
    /// A worker stopped abnormally.
    Failed {
        /// Index of the failed worker
        worker_id: usize,
        /// Cause of the failure
        error: DeliveryError,
    },
}

/// Settings shared by every worker in a pool.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Endpoint receiving the records.
    pub endpoint_url: String,
    /// Attempts per record per cycle.
    pub delivery_attempts: u32,
}

/// Individual worker that delivers records from its queue.
pub struct DeliveryWorker {
    id: usize,
    settings: Arc<WorkerSettings>,
    client: DeliveryClient,
    backoff: Backoff,
    jobs: mpsc::Receiver<Job>,
    events: mpsc::Sender<WorkerEvent>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl DeliveryWorker {
    /// Creates a new delivery worker.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        settings: Arc<WorkerSettings>,
        client: DeliveryClient,
        backoff: Backoff,
        jobs: mpsc::Receiver<Job>,
        events: mpsc::Sender<WorkerEvent>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { id, settings, client, backoff, jobs, events, cancellation_token, clock }
    }

    /// Processes jobs until cancelled or the queue closes.
    ///
    /// A job interrupted by cancellation reports nothing; its record keeps
    /// its pre-cycle state.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownRequested` if the coordinator stopped listening for
    /// outcomes while the worker was still running.
    pub async fn run(mut self) -> Result<()> {
        debug!(worker_id = self.id, "delivery worker starting");

        loop {
            let job = tokio::select! {
                biased;
                () = self.cancellation_token.cancelled() => break,
                job = self.jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let Some(outcome) = self.process(job).await else {
                info!(worker_id = self.id, "delivery worker interrupted mid-job");
                break;
            };

            if self.events.send(WorkerEvent::Finished(outcome)).await.is_err() {
                return Err(DeliveryError::ShutdownRequested);
            }
        }

        debug!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }

    /// Delivers one record, or returns `None` if cancelled first.
    async fn process(&mut self, job: Job) -> Option<JobOutcome> {
        let record = job.record;
        let body = record.body();
        let max_attempts = self.settings.delivery_attempts.max(1);
        let mut last_error = None;

        for attempt_number in 1..=max_attempts {
            let request = DeliveryRequest {
                url: self.settings.endpoint_url.clone(),
                record_id: record.id,
                attempt_number,
                body: body.clone(),
            };

            let result = tokio::select! {
                biased;
                () = self.cancellation_token.cancelled() => return None,
                result = self.client.deliver(request) => result,
            };

            match result {
                Ok(response) => {
                    self.backoff.reset();
                    debug!(
                        worker_id = self.id,
                        record_id = %record.id,
                        attempt = attempt_number,
                        status = response.status_code,
                        "record delivered"
                    );
                    return Some(self.outcome(&record, true, attempt_number, None));
                },
                Err(error) => {
                    warn!(
                        worker_id = self.id,
                        record_id = %record.id,
                        attempt = attempt_number,
                        max_attempts,
                        category = %ErrorCategory::from(&error),
                        error = %error,
                        "delivery attempt failed"
                    );

                    if attempt_number < max_attempts && error.is_retryable() {
                        let delay = self.backoff.next_delay();
                        tokio::select! {
                            biased;
                            () = self.cancellation_token.cancelled() => return None,
                            () = self.clock.sleep(delay) => {},
                        }
                        last_error = Some(error);
                    } else {
                        return Some(self.outcome(&record, false, attempt_number, Some(error)));
                    }
                },
            }
        }

        Some(self.outcome(&record, false, max_attempts, last_error))
    }

    fn outcome(
        &self,
        record: &Record,
        delivered: bool,
        attempts: u32,
        last_error: Option<DeliveryError>,
    ) -> JobOutcome {
        JobOutcome {
            record_id: record.id,
            worker_id: self.id,
            retry_count: record.retry_count,
            delivered,
            attempts,
            last_error,
        }
    }
}
