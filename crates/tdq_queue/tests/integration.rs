use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use ntest::timeout;
use tdq_queue::{
    worker_details::{WorkerConfigurations, WorkerSettings},
    Queue, QueueConfig,
};
use tdq_test_utils::{
    passing_result, prioritized_job, test_configuration_with_retries, test_entry,
    test_entry_configurations, testing_result,
};
use tdq_utils::{
    clock::FakeClock,
    decay::ExpDecay,
    net_protocol::{
        ids::{JobId, RequestId, WorkerId},
        models::{Bucket, TestEntryConfiguration, TestingResult},
        queue::{QueueState, RequestError, RunningQueueState, ScheduleStrategy},
    },
    payload_signature::PayloadSignature,
    time::EpochMillis,
};
use tdq_workers::{
    BucketExecutor, BucketFetchResult, EnvironmentHandle, NoopEnvironmentProvider, QueueClient,
    QueueClientError, Worker, WorkerConfig, WorkerExit,
};

const UNREACHABLE_STATUS: &str = "127.0.0.1:1";

fn workers(ids: &[(&str, u32)]) -> WorkerConfigurations {
    WorkerConfigurations::new(ids.iter().map(|(id, parallel)| {
        (
            WorkerId::from(*id),
            WorkerSettings {
                number_of_parallel_buckets: *parallel,
            },
        )
    }))
    .unwrap()
}

fn local_config(workers: WorkerConfigurations) -> QueueConfig {
    let mut config = QueueConfig::new(workers);
    config.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.check_again_interval = Duration::from_millis(10);
    config.stuck_bucket_sweep_interval = Duration::from_millis(10);
    config
}

async fn register(client: &QueueClient, worker: &str) -> PayloadSignature {
    client
        .register_worker(
            WorkerId::from(worker),
            UNREACHABLE_STATUS.parse::<SocketAddr>().unwrap(),
        )
        .await
        .unwrap()
        .payload_signature
}

async fn fetch(
    client: &QueueClient,
    request: &str,
    worker: &str,
    signature: PayloadSignature,
) -> Bucket {
    match client
        .fetch_bucket(RequestId::from(request), WorkerId::from(worker), signature)
        .await
        .unwrap()
    {
        BucketFetchResult::Bucket(bucket) => bucket,
        other => panic!("expected a bucket, got {other:?}"),
    }
}

async fn submit(
    client: &QueueClient,
    result: TestingResult,
    request: &str,
    worker: &str,
    signature: PayloadSignature,
) -> Result<(), QueueClientError> {
    client
        .send_bucket_result(
            WorkerId::from(worker),
            RequestId::from(request),
            result,
            signature,
        )
        .await
        .map(|_| ())
}

#[tokio::test]
#[timeout(10000)]
async fn failing_test_without_retries() {
    let mut queue = Queue::start(local_config(workers(&[("w1", 1)])))
        .await
        .unwrap();
    let client = QueueClient::new(queue.server_addr());

    let buckets = client
        .schedule_tests(
            RequestId::from("schedule"),
            ScheduleStrategy::Unsplit,
            test_entry_configurations(&["pass", "fail"]),
            prioritized_job("j1"),
        )
        .await
        .unwrap();
    assert_eq!(buckets, 1);

    let signature = register(&client, "w1").await;
    let bucket = fetch(&client, "r1", "w1", signature).await;
    let result = testing_result(&bucket, &[("pass", true), ("fail", false)]);
    submit(&client, result.clone(), "r1", "w1", signature)
        .await
        .unwrap();

    let state = client.job_state(JobId::from("j1")).await.unwrap();
    assert_eq!(state.queue_state, QueueState::Depleted);
    let results = client.job_results(JobId::from("j1")).await.unwrap();
    assert_eq!(results.testing_results, vec![result]);

    queue.shutdown().await.unwrap();
}

#[tokio::test]
#[timeout(10000)]
async fn failing_test_is_retried() {
    let mut queue = Queue::start(local_config(workers(&[("w1", 1)])))
        .await
        .unwrap();
    let client = QueueClient::new(queue.server_addr());

    let entries = ["pass", "fail"]
        .into_iter()
        .map(|method| TestEntryConfiguration {
            test_entry: test_entry(method),
            configuration: test_configuration_with_retries(1),
        })
        .collect();
    client
        .schedule_tests(
            RequestId::from("schedule"),
            ScheduleStrategy::Unsplit,
            entries,
            prioritized_job("j1"),
        )
        .await
        .unwrap();

    let signature = register(&client, "w1").await;
    let bucket = fetch(&client, "r1", "w1", signature).await;
    submit(
        &client,
        testing_result(&bucket, &[("pass", true), ("fail", false)]),
        "r1",
        "w1",
        signature,
    )
    .await
    .unwrap();

    let state = client.job_state(JobId::from("j1")).await.unwrap();
    assert_eq!(
        state.queue_state,
        QueueState::Running(RunningQueueState {
            enqueued_bucket_count: 1,
            dequeued_bucket_count: 0,
        })
    );

    // Only worker, so it gets the retry even though it failed it.
    let retry = fetch(&client, "r2", "w1", signature).await;
    assert_eq!(retry.test_entries, vec![test_entry("fail")]);
    submit(&client, passing_result(&retry), "r2", "w1", signature)
        .await
        .unwrap();

    let results = client
        .wait_for_job_results(JobId::from("j1"), ExpDecay::constant(Duration::from_millis(5)))
        .await
        .unwrap();
    let mut outcomes: Vec<(String, bool)> = results
        .testing_results
        .iter()
        .flat_map(|r| r.unfiltered_results.iter())
        .map(|r| (r.test_entry.test_name.method_name.clone(), r.succeeded()))
        .collect();
    outcomes.sort();
    assert_eq!(
        outcomes,
        vec![("fail".to_owned(), true), ("pass".to_owned(), true)]
    );

    queue.shutdown().await.unwrap();
}

#[tokio::test]
#[timeout(10000)]
async fn silent_worker_bucket_is_recovered() {
    let clock = Arc::new(FakeClock::new(EpochMillis::from_millis(1_000_000)));
    let mut config = local_config(workers(&[("w1", 1), ("w2", 1)]));
    config.clock = clock.clone();
    config.maximum_not_reporting_duration = Duration::from_secs(50);
    let mut queue = Queue::start(config).await.unwrap();
    let client = QueueClient::new(queue.server_addr());

    client
        .schedule_tests(
            RequestId::from("schedule"),
            ScheduleStrategy::Unsplit,
            test_entry_configurations(&["t1"]),
            prioritized_job("j1"),
        )
        .await
        .unwrap();

    let signature = register(&client, "w1").await;
    let bucket = fetch(&client, "r1", "w1", signature).await;

    clock.advance(Duration::from_secs(51));
    register(&client, "w2").await;

    // The sweep runs in the background.
    loop {
        let state = client.job_state(JobId::from("j1")).await.unwrap();
        if state.queue_state
            == QueueState::Running(RunningQueueState {
                enqueued_bucket_count: 1,
                dequeued_bucket_count: 0,
            })
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let recovered = fetch(&client, "r2", "w2", signature).await;
    assert_eq!(recovered.bucket_id, bucket.bucket_id);

    queue.shutdown().await.unwrap();
}

#[tokio::test]
#[timeout(10000)]
async fn equal_priority_jobs_alternate() {
    let mut queue = Queue::start(local_config(workers(&[("w1", 1)])))
        .await
        .unwrap();
    let client = QueueClient::new(queue.server_addr());

    for (job, tests) in [("j1", ["a1", "a2", "a3"]), ("j2", ["b1", "b2", "b3"])] {
        let buckets = client
            .schedule_tests(
                RequestId::from(job),
                ScheduleStrategy::Individual,
                test_entry_configurations(&tests),
                prioritized_job(job),
            )
            .await
            .unwrap();
        assert_eq!(buckets, 3);
    }

    let signature = register(&client, "w1").await;
    let mut methods = vec![];
    for i in 0..6 {
        let bucket = fetch(&client, &format!("r{i}"), "w1", signature).await;
        methods.push(bucket.test_entries[0].test_name.method_name.clone());
    }
    assert_eq!(methods, vec!["a1", "b1", "a2", "b2", "a3", "b3"]);

    queue.shutdown().await.unwrap();
}

#[tokio::test]
#[timeout(10000)]
async fn wrong_signature_is_rejected() {
    let mut queue = Queue::start(local_config(workers(&[("w1", 1)])))
        .await
        .unwrap();
    let client = QueueClient::new(queue.server_addr());

    client
        .schedule_tests(
            RequestId::from("schedule"),
            ScheduleStrategy::Unsplit,
            test_entry_configurations(&["t1"]),
            prioritized_job("j1"),
        )
        .await
        .unwrap();
    let signature = register(&client, "w1").await;
    let bucket = fetch(&client, "r1", "w1", signature).await;

    let result = submit(
        &client,
        passing_result(&bucket),
        "r1",
        "w1",
        PayloadSignature::new_random(),
    )
    .await;
    assert!(matches!(
        result,
        Err(QueueClientError::Rejected(
            RequestError::PayloadSignatureMismatch
        ))
    ));

    let state = client.job_state(JobId::from("j1")).await.unwrap();
    assert_eq!(
        state.queue_state,
        QueueState::Running(RunningQueueState {
            enqueued_bucket_count: 0,
            dequeued_bucket_count: 1,
        })
    );

    // The right signature still goes through afterwards.
    submit(&client, passing_result(&bucket), "r1", "w1", signature)
        .await
        .unwrap();

    queue.shutdown().await.unwrap();
}

#[tokio::test]
#[timeout(10000)]
async fn result_after_delete_is_not_found() {
    let mut queue = Queue::start(local_config(workers(&[("w1", 1)])))
        .await
        .unwrap();
    let client = QueueClient::new(queue.server_addr());

    client
        .schedule_tests(
            RequestId::from("schedule"),
            ScheduleStrategy::Unsplit,
            test_entry_configurations(&["t1"]),
            prioritized_job("j1"),
        )
        .await
        .unwrap();
    let signature = register(&client, "w1").await;
    let bucket = fetch(&client, "r1", "w1", signature).await;

    client.delete_job(JobId::from("j1")).await.unwrap();

    match submit(&client, passing_result(&bucket), "r1", "w1", signature).await {
        Err(QueueClientError::Rejected(error)) => assert!(error.is_not_found()),
        other => panic!("expected a not-found rejection, got {other:?}"),
    }
    assert!(matches!(
        client.job_state(JobId::from("j1")).await,
        Err(QueueClientError::Rejected(RequestError::UnknownJob { .. }))
    ));

    queue.shutdown().await.unwrap();
}

#[tokio::test]
#[timeout(10000)]
async fn reports_version() {
    let mut queue = Queue::start(local_config(workers(&[("w1", 1)])))
        .await
        .unwrap();
    let client = QueueClient::new(queue.server_addr());

    assert_eq!(client.queue_version().await.unwrap(), tdq_utils::VERSION);

    queue.shutdown().await.unwrap();
}

struct PassingExecutor;

#[async_trait]
impl BucketExecutor for PassingExecutor {
    async fn execute(&self, bucket: &Bucket, _: &EnvironmentHandle) -> TestingResult {
        tokio::time::sleep(Duration::from_millis(5)).await;
        passing_result(bucket)
    }
}

#[tokio::test]
#[timeout(20000)]
async fn workers_drain_two_jobs() {
    let mut queue = Queue::start(local_config(workers(&[("w1", 2), ("w2", 1)])))
        .await
        .unwrap();
    let queue_addr = queue.server_addr();
    let client = QueueClient::new(queue_addr);

    for (job, tests) in [
        ("j1", ["a1", "a2", "a3", "a4"]),
        ("j2", ["b1", "b2", "b3", "b4"]),
    ] {
        client
            .schedule_tests(
                RequestId::from(job),
                ScheduleStrategy::Individual,
                test_entry_configurations(&tests),
                prioritized_job(job),
            )
            .await
            .unwrap();
    }

    let run_worker = |id: &str| {
        Worker::new(
            WorkerConfig::new(WorkerId::from(id), queue_addr),
            Arc::new(PassingExecutor),
            Arc::new(NoopEnvironmentProvider),
        )
        .run()
    };
    let (w1, w2) = tokio::join!(run_worker("w1"), run_worker("w2"));
    assert_eq!(w1.unwrap(), WorkerExit::QueueDepleted);
    assert_eq!(w2.unwrap(), WorkerExit::QueueDepleted);

    for job in ["j1", "j2"] {
        let results = client
            .wait_for_job_results(JobId::from(job), ExpDecay::constant(Duration::from_millis(5)))
            .await
            .unwrap();
        assert_eq!(results.testing_results.len(), 4);
        assert!(results.testing_results.iter().all(|r| r.all_succeeded()));
    }
    assert!(queue.is_depleted());

    queue.shutdown().await.unwrap();
}
