//! Delivery cycle coordinator.
//!
//! Drives one transaction per cycle through the store:
//!
//! ```text
//! IDLE ──▶ CLAIMING ──▶ DISPATCHING ──▶ AWAITING ──▶ COMMITTING ──▶ IDLE
//!              │               │             │
//!              ▼               └──────┬──────┘
//!     rollback + cycle backoff        ▼
//!                                 DRAINING ──▶ commit partial ──▶ close
//! ```
//!
//! Claimed rows are decoded and pushed to the worker picked by
//! `id mod worker_count`. Workers report outcomes back over a channel and the
//! coordinator alone applies them to the open transaction, so the
//! transaction is never shared. The commit waits until every dispatched job
//! has reported. A shutdown signal or a failure to persist an outcome stops
//! dispatch, drains the pool, and commits whatever outcomes were recorded.

use std::{sync::Arc, time::Duration};

use courier_core::{
    storage::rollback_and_wrap, Clock, Record, RecordId, RecordStore, StoreError,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    backoff::{Backoff, BackoffPolicy},
    client::{ClientConfig, DeliveryClient},
    error::{DeliveryError, Result},
    worker::{Job, JobOutcome, WorkerEvent},
    worker_pool::WorkerPool,
};

/// Configuration for the delivery coordinator and its worker pool.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// Capacity of each worker's job queue.
    pub queue_size: usize,

    /// Maximum rows claimed per cycle.
    pub batch_size: usize,

    /// Rows whose retry counter reached this value are no longer claimed.
    pub max_retry: i32,

    /// Delivery attempts per record per cycle.
    pub delivery_attempts: u32,

    /// Endpoint receiving the records.
    pub endpoint_url: String,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Backoff between cycles that claimed nothing or failed to claim.
    pub cycle_backoff: BackoffPolicy,

    /// Backoff between failed delivery attempts.
    pub delivery_backoff: BackoffPolicy,

    /// Maximum time to wait for workers to stop.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            queue_size: crate::DEFAULT_QUEUE_SIZE,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            max_retry: crate::DEFAULT_MAX_RETRY,
            delivery_attempts: crate::DEFAULT_DELIVERY_ATTEMPTS,
            endpoint_url: "http://localhost:8080/".to_string(),
            client_config: ClientConfig::default(),
            cycle_backoff: BackoffPolicy::cycle_default(),
            delivery_backoff: BackoffPolicy::delivery_default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DeliveryConfig {
    /// Checks the configuration for values the coordinator cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be positive"));
        }
        if self.queue_size == 0 {
            return Err(DeliveryError::configuration("queue_size must be positive"));
        }
        if self.batch_size == 0 {
            return Err(DeliveryError::configuration("batch_size must be positive"));
        }
        if self.max_retry <= 0 {
            return Err(DeliveryError::configuration("max_retry must be positive"));
        }
        if self.delivery_attempts == 0 {
            return Err(DeliveryError::configuration("delivery_attempts must be positive"));
        }
        reqwest::Url::parse(&self.endpoint_url).map_err(|e| {
            DeliveryError::configuration(format!("invalid endpoint_url {}: {e}", self.endpoint_url))
        })?;
        for (name, policy) in
            [("cycle_backoff", &self.cycle_backoff), ("delivery_backoff", &self.delivery_backoff)]
        {
            if policy.min > policy.max {
                return Err(DeliveryError::configuration(format!("{name}: min exceeds max")));
            }
            if policy.factor.is_nan() || policy.factor < 1.0 {
                return Err(DeliveryError::configuration(format!("{name}: factor below 1.0")));
            }
            if !(0.0..=1.0).contains(&policy.jitter_factor) {
                return Err(DeliveryError::configuration(format!(
                    "{name}: jitter_factor outside [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

/// Counts for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Rows returned by the claim.
    pub claimed: usize,
    /// Rows handed to a worker.
    pub dispatched: usize,
    /// Rows skipped because they failed to decode. Each one with a readable
    /// id had its retry counter incremented.
    pub skipped: usize,
    /// Rows marked processed.
    pub delivered: usize,
    /// Rows whose retry counter was incremented.
    pub retried: usize,
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every dispatched job reported and the transaction committed.
    Committed(CycleReport),
    /// Nothing was delivered; sleep before the next cycle.
    Idle {
        /// Cycle backoff delay
        sleep: Duration,
    },
    /// A shutdown signal drained the pool; the partial result committed and
    /// the store is closed.
    Interrupted(CycleReport),
}

/// Totals over a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Cycles started.
    pub cycles: u64,
    /// Cycles that ended in a commit.
    pub committed_cycles: u64,
    /// Rows marked processed.
    pub delivered: u64,
    /// Rows whose retry counter was incremented.
    pub retried: u64,
    /// Rows skipped on decode failure.
    pub skipped: u64,
}

impl RunSummary {
    fn record(&mut self, report: &CycleReport) {
        self.delivered += report.delivered as u64;
        self.retried += report.retried as u64;
        self.skipped += report.skipped as u64;
    }
}

enum Interrupt {
    Shutdown,
    Fatal(DeliveryError),
}

enum Wake {
    Shutdown,
    Event(Option<WorkerEvent>),
    Slot(std::result::Result<mpsc::OwnedPermit<Job>, mpsc::error::SendError<()>>),
}

/// Coordinates claim, dispatch, await and commit against one store.
pub struct Coordinator {
    store: Box<dyn RecordStore>,
    config: DeliveryConfig,
    pool: WorkerPool,
    events: mpsc::Receiver<WorkerEvent>,
    cycle_backoff: Backoff,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    summary: RunSummary,
    tx_open: bool,
    finished: bool,
}

impl Coordinator {
    /// Validates `config` and spawns the worker pool.
    ///
    /// Cancelling `shutdown` drains the pool and ends the run. The pool runs
    /// on a child token, so dropping the coordinator never cancels the
    /// caller's token.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` for an invalid configuration or an HTTP
    /// client that cannot be built.
    pub fn start(
        store: Box<dyn RecordStore>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;

        info!(
            worker_count = config.worker_count,
            batch_size = config.batch_size,
            max_retry = config.max_retry,
            endpoint = %config.endpoint_url,
            "starting delivery coordinator"
        );

        let client = DeliveryClient::new(config.client_config.clone())?;
        let (event_tx, events) = mpsc::channel(config.batch_size + config.worker_count);
        let pool =
            WorkerPool::spawn(&config, client, event_tx, shutdown.child_token(), clock.clone());
        let cycle_backoff = Backoff::new(config.cycle_backoff.clone());

        Ok(Self {
            store,
            config,
            pool,
            events,
            cycle_backoff,
            clock,
            shutdown,
            summary: RunSummary::default(),
            tx_open: false,
            finished: false,
        })
    }

    /// Totals so far.
    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Runs cycles until shutdown.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the run: a failure to persist an
    /// outcome (`WorkerFatal`), a commit or rollback failure, or a worker
    /// pool failure. The store is closed either way.
    pub async fn run(mut self) -> Result<RunSummary> {
        loop {
            if self.shutdown.is_cancelled() {
                self.drain(false).await?;
                return Ok(self.summary);
            }

            match self.run_cycle().await {
                Ok(CycleOutcome::Committed(_)) => {},
                Ok(CycleOutcome::Idle { sleep }) => {
                    info!(sleep_ms = sleep.as_millis(), "no rows delivered, backing off");
                    tokio::select! {
                        biased;
                        () = self.shutdown.cancelled() => {},
                        () = self.clock.sleep(sleep) => {},
                    }
                },
                Ok(CycleOutcome::Interrupted(_)) => return Ok(self.summary),
                Err(error) => {
                    if !self.finished {
                        if let Err(drain_error) = self.drain(false).await {
                            warn!(error = %drain_error, "cleanup after failed cycle also failed");
                        }
                    }
                    return Err(error);
                },
            }
        }
    }

    /// Runs a single cycle.
    ///
    /// After `Interrupted` or an error the coordinator is finished and must
    /// not be cycled again.
    ///
    /// # Errors
    ///
    /// Returns fatal errors only; empty and failed claims come back as
    /// `Idle`.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        if self.finished {
            return Err(DeliveryError::internal("coordinator already shut down"));
        }
        self.summary.cycles += 1;

        if let Err(error) = self.store.begin().await {
            warn!(error = %error, "failed to begin transaction");
            return Ok(self.idle());
        }
        self.tx_open = true;

        let rows = match self.store.claim_batch(self.config.batch_size, self.config.max_retry).await
        {
            Ok(rows) if rows.is_empty() => {
                self.tx_open = false;
                self.store.rollback().await?;
                debug!("claim returned no rows");
                return Ok(self.idle());
            },
            Ok(rows) => rows,
            Err(error) => {
                self.tx_open = false;
                let error = rollback_and_wrap(&mut *self.store, error).await;
                if matches!(error, StoreError::RollbackFailed { .. }) {
                    return Err(error.into());
                }
                warn!(error = %error, "claim failed");
                return Ok(self.idle());
            },
        };

        let mut report = CycleReport { claimed: rows.len(), ..CycleReport::default() };
        info!(claimed = report.claimed, "claimed batch");

        let mut outstanding = 0usize;
        let mut interrupt = None;

        'dispatch: for row in rows {
            let id_hint = row.id_hint();
            let record = match Record::decode(row) {
                Ok(record) => record,
                Err(error) => {
                    warn!(record_id = ?id_hint, error = %error, "skipping undecodable row");
                    report.skipped += 1;
                    if let Err(error) = self.age_undecodable(id_hint).await {
                        interrupt = Some(Interrupt::Fatal(error));
                        break;
                    }
                    continue;
                },
            };

            let Some((worker_id, sender)) = self.pool.sender_for(record.id) else {
                interrupt = Some(Interrupt::Fatal(DeliveryError::internal("worker pool is gone")));
                break;
            };

            // Wait for queue space without going deaf to outcomes or shutdown.
            let permit = loop {
                let wake = tokio::select! {
                    biased;
                    () = self.shutdown.cancelled() => Wake::Shutdown,
                    event = self.events.recv() => Wake::Event(event),
                    slot = sender.clone().reserve_owned() => Wake::Slot(slot),
                };

                match wake {
                    Wake::Shutdown => {
                        interrupt = Some(Interrupt::Shutdown);
                        break 'dispatch;
                    },
                    Wake::Event(event) => {
                        outstanding = outstanding.saturating_sub(1);
                        if let Err(error) = self.handle_event(event, &mut report).await {
                            interrupt = Some(Interrupt::Fatal(error));
                            break 'dispatch;
                        }
                    },
                    Wake::Slot(Ok(permit)) => break permit,
                    Wake::Slot(Err(_closed)) => {
                        interrupt = Some(Interrupt::Fatal(DeliveryError::WorkerPanic {
                            worker_id,
                            message: "job queue closed".to_string(),
                        }));
                        break 'dispatch;
                    },
                }
            };

            debug!(record_id = %record.id, worker_id, "dispatching record");
            permit.send(Job { record });
            outstanding += 1;
            report.dispatched += 1;
        }

        while interrupt.is_none() && outstanding > 0 {
            let wake = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => Wake::Shutdown,
                event = self.events.recv() => Wake::Event(event),
            };

            match wake {
                Wake::Shutdown => interrupt = Some(Interrupt::Shutdown),
                Wake::Event(event) => {
                    outstanding -= 1;
                    if let Err(error) = self.handle_event(event, &mut report).await {
                        interrupt = Some(Interrupt::Fatal(error));
                    }
                },
                Wake::Slot(_) => {},
            }
        }

        match interrupt {
            None => {
                self.tx_open = false;
                self.store.commit().await?;
                self.summary.committed_cycles += 1;
                self.summary.record(&report);
                info!(
                    dispatched = report.dispatched,
                    delivered = report.delivered,
                    retried = report.retried,
                    skipped = report.skipped,
                    "cycle committed"
                );

                if report.dispatched == 0 {
                    // Only undecodable rows: they were aged, now back off before reclaiming.
                    return Ok(self.idle());
                }
                self.cycle_backoff.reset();
                Ok(CycleOutcome::Committed(report))
            },
            Some(Interrupt::Shutdown) => {
                info!(outstanding, "shutdown requested, draining workers");
                self.drain_cycle(&mut report).await?;
                Ok(CycleOutcome::Interrupted(report))
            },
            Some(Interrupt::Fatal(error)) => {
                error!(error = %error, outstanding, "fatal error, draining workers");
                if let Err(drain_error) = self.drain_cycle(&mut report).await {
                    warn!(error = %drain_error, "drain after fatal error also failed");
                }
                Err(error)
            },
        }
    }

    /// Stops the pool, commits any open transaction and closes the store.
    ///
    /// # Errors
    ///
    /// Returns the first commit, outcome or pool failure encountered.
    pub async fn shutdown(mut self) -> Result<RunSummary> {
        self.drain(true).await?;
        Ok(self.summary)
    }

    fn idle(&mut self) -> CycleOutcome {
        CycleOutcome::Idle { sleep: self.cycle_backoff.next_delay() }
    }

    async fn drain_cycle(&mut self, report: &mut CycleReport) -> Result<()> {
        let result = self.drain_with_report(true, report).await;
        self.summary.committed_cycles += u64::from(result.is_ok());
        self.summary.record(report);
        info!(
            delivered = report.delivered,
            retried = report.retried,
            "partial cycle committed"
        );
        result
    }

    async fn drain(&mut self, commit: bool) -> Result<()> {
        let mut report = CycleReport::default();
        let result = self.drain_with_report(commit, &mut report).await;
        self.summary.record(&report);
        result
    }

    /// Stops every worker, applies the outcomes they reported before
    /// stopping, then commits (or rolls back) and closes the store.
    async fn drain_with_report(&mut self, commit: bool, report: &mut CycleReport) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let mut first_error = self.pool.shutdown_graceful(self.config.shutdown_timeout).await.err();

        while let Ok(event) = self.events.try_recv() {
            if !self.tx_open {
                debug!(?event, "discarding worker event outside a transaction");
                continue;
            }
            if let Err(error) = self.handle_event(Some(event), report).await {
                first_error.get_or_insert(error);
            }
        }

        if self.tx_open {
            self.tx_open = false;
            let result = if commit { self.store.commit().await } else { self.store.rollback().await };
            if let Err(error) = result {
                error!(error = %error, commit, "failed to finish transaction during shutdown");
                first_error.get_or_insert(error.into());
            }
        }

        for error in self.store.close().await {
            error!(error = %error, "error while closing store");
        }
        info!("delivery coordinator stopped");

        first_error.map_or(Ok(()), Err)
    }

    /// Applies one worker event to the open transaction.
    ///
    /// Any error returned here is fatal for the run.
    async fn handle_event(
        &mut self,
        event: Option<WorkerEvent>,
        report: &mut CycleReport,
    ) -> Result<()> {
        match event {
            Some(WorkerEvent::Finished(outcome)) => self.apply_outcome(&outcome, report).await,
            Some(WorkerEvent::Failed { worker_id, error }) => {
                error!(worker_id, error = %error, "delivery worker failed");
                Err(error)
            },
            None => Err(DeliveryError::internal("worker event channel closed")),
        }
    }

    /// Counts a failed cycle against a row that cannot be decoded, so it
    /// leaves the claim once it reaches the retry ceiling.
    async fn age_undecodable(&mut self, id_hint: Option<i64>) -> Result<()> {
        let Some(id) = id_hint.map(RecordId) else {
            warn!("undecodable row has no readable id, it will be claimed again");
            return Ok(());
        };

        self.store.mark_retried(id).await.map_err(|error| {
            DeliveryError::worker_fatal(format!(
                "failed to record decode failure for record {id}: {error}"
            ))
        })
    }

    async fn apply_outcome(&mut self, outcome: &JobOutcome, report: &mut CycleReport) -> Result<()> {
        let id = outcome.record_id;

        let result = if outcome.delivered {
            self.store.mark_processed(id).await.map(|()| report.delivered += 1)
        } else {
            if outcome.retry_count + 1 >= self.config.max_retry {
                warn!(
                    record_id = %id,
                    retry = outcome.retry_count + 1,
                    max_retry = self.config.max_retry,
                    error = ?outcome.last_error.as_ref().map(ToString::to_string),
                    "retry budget exhausted, record will not be claimed again"
                );
            } else {
                debug!(record_id = %id, attempts = outcome.attempts, "delivery failed, retry scheduled");
            }
            self.store.mark_retried(id).await.map(|()| report.retried += 1)
        };

        result.map_err(|error| {
            DeliveryError::worker_fatal(format!("failed to record outcome for record {id}: {error}"))
        })
    }
}
