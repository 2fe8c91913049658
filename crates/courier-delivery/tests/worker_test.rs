//! Integration tests for workers and the worker pool.
//!
//! Workers are driven directly through their queues; outcomes are read off
//! the event channel the coordinator would normally consume.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use courier_core::{BusinessField, Clock, Record, RecordId, TestClock};
use courier_delivery::{
    worker::{Job, JobOutcome, WorkerEvent},
    worker_pool::WorkerPool,
    DeliveryConfig,
};
use tokio::{sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

fn record(id: i64) -> Record {
    Record {
        id: RecordId(id),
        is_processed: false,
        retry_count: 0,
        fields: vec![BusinessField { name: "name".into(), value: format!("lead {id}") }],
    }
}

fn config(server: &MockServer) -> DeliveryConfig {
    DeliveryConfig {
        worker_count: 4,
        queue_size: 2,
        delivery_attempts: 3,
        endpoint_url: server.uri(),
        shutdown_timeout: Duration::from_secs(5),
        ..DeliveryConfig::default()
    }
}

struct Harness {
    pool: WorkerPool,
    events: mpsc::Receiver<WorkerEvent>,
    token: CancellationToken,
    clock: TestClock,
}

impl Harness {
    fn start(config: &DeliveryConfig) -> Self {
        let clock = TestClock::new();
        let token = CancellationToken::new();
        let (event_tx, events) = mpsc::channel(32);
        let client = courier_delivery::client::DeliveryClient::new(config.client_config.clone())
            .expect("client");
        let pool = WorkerPool::spawn(
            config,
            client,
            event_tx,
            token.clone(),
            Arc::new(clock.clone()) as Arc<dyn Clock>,
        );
        Self { pool, events, token, clock }
    }

    async fn submit(&self, record: Record) -> usize {
        let (worker_id, sender) = self.pool.sender_for(record.id).expect("pool running");
        sender.send(Job { record }).await.expect("queue open");
        worker_id
    }

    async fn next_outcome(&mut self) -> JobOutcome {
        let event = timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("outcome within timeout")
            .expect("channel open");
        match event {
            WorkerEvent::Finished(outcome) => outcome,
            WorkerEvent::Failed { worker_id, error } => panic!("worker {worker_id} failed: {error}"),
        }
    }
}

#[tokio::test]
async fn delivered_record_reported_by_its_worker() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let mut harness = Harness::start(&config(&server));

    let worker_id = harness.submit(record(6)).await;
    let outcome = harness.next_outcome().await;

    assert_eq!(worker_id, 2);
    assert_eq!(outcome.worker_id, 2);
    assert_eq!(outcome.record_id, RecordId(6));
    assert!(outcome.delivered);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(harness.clock.sleep_count(), 0);

    harness.pool.shutdown_graceful(Duration::from_secs(5)).await?;
    Ok(())
}

#[tokio::test]
async fn failing_record_uses_whole_attempt_budget() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;
    let mut harness = Harness::start(&config(&server));

    harness.submit(record(1)).await;
    let outcome = harness.next_outcome().await;

    assert!(!outcome.delivered);
    assert_eq!(outcome.attempts, 3);
    assert!(outcome.last_error.is_some());
    // Two backoff sleeps between three attempts: 1s then 1.1s, each ±25%.
    assert_eq!(harness.clock.sleep_count(), 2);
    assert!(harness.clock.elapsed() >= Duration::from_secs(2));
    assert!(harness.clock.elapsed() <= Duration::from_millis(2_700));

    harness.pool.shutdown_graceful(Duration::from_secs(5)).await?;
    Ok(())
}

#[tokio::test]
async fn recovery_within_budget_counts_as_delivered() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let mut harness = Harness::start(&config(&server));

    harness.submit(record(3)).await;
    let outcome = harness.next_outcome().await;

    assert!(outcome.delivered);
    assert_eq!(outcome.attempts, 2);

    harness.pool.shutdown_graceful(Duration::from_secs(5)).await?;
    Ok(())
}

#[tokio::test]
async fn cancellation_aborts_in_flight_delivery_without_outcome() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;
    let mut harness = Harness::start(&config(&server));

    harness.submit(record(8)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    harness.token.cancel();
    timeout(Duration::from_secs(2), harness.pool.shutdown_graceful(Duration::from_secs(5)))
        .await
        .expect("workers stop promptly")?;

    assert!(!harness.pool.has_active_workers());
    assert!(harness.events.try_recv().is_err(), "aborted job must not report");
    assert!(harness.pool.sender_for(RecordId(8)).is_none());
    Ok(())
}

#[tokio::test]
async fn dispatch_is_stable_for_repeated_ids() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let mut harness = Harness::start(&config(&server));

    for id in [1, 5, 9, 13] {
        assert_eq!(harness.submit(record(id)).await, 1);
        assert_eq!(harness.next_outcome().await.worker_id, 1);
    }

    harness.pool.shutdown_graceful(Duration::from_secs(5)).await?;
    Ok(())
}
