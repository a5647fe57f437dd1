//! The worker loop: register, then fetch, execute, and report buckets until the queue says stop.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tdq_utils::{
    error::AnyError,
    id_generator::{SharedIdGenerator, UniqueIdGenerator, UuidGenerator},
    net_protocol::{
        ids::{RequestId, WorkerId},
        models::{Bucket, TestDestination, TestEntryResult, TestingResult},
        queue::{RequestError, WorkerConfiguration},
    },
};
use thiserror::Error;

use crate::{
    client::{BucketFetchResult, QueueClient, QueueClientError},
    status::{CurrentlyProcessingBuckets, WorkerStatusServer},
};

/// An execution environment prepared for one bucket. Opaque to the worker loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentHandle {
    pub id: String,
    pub test_destination: TestDestination,
}

/// Prepares and disposes of the places tests execute in.
#[async_trait]
pub trait ExecutionEnvironmentProvider: Send + Sync {
    async fn provision(
        &self,
        test_destination: &TestDestination,
    ) -> Result<EnvironmentHandle, AnyError>;

    async fn teardown(&self, handle: EnvironmentHandle);
}

/// For executors that need no environment.
#[derive(Debug, Default)]
pub struct NoopEnvironmentProvider;

#[async_trait]
impl ExecutionEnvironmentProvider for NoopEnvironmentProvider {
    async fn provision(
        &self,
        test_destination: &TestDestination,
    ) -> Result<EnvironmentHandle, AnyError> {
        Ok(EnvironmentHandle {
            id: "noop".to_owned(),
            test_destination: test_destination.clone(),
        })
    }

    async fn teardown(&self, _handle: EnvironmentHandle) {}
}

/// Runs the tests of a bucket.
///
/// Entries missing from the returned result are treated by the queue as lost, and so retried
/// like failures.
#[async_trait]
pub trait BucketExecutor: Send + Sync {
    async fn execute(&self, bucket: &Bucket, environment: &EnvironmentHandle) -> TestingResult;
}

pub struct WorkerConfig {
    pub worker_id: WorkerId,
    pub queue_addr: SocketAddr,
    /// Where the status endpoint listens. The bound address is what the worker registers with.
    pub status_bind_addr: SocketAddr,
    pub request_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(worker_id: WorkerId, queue_addr: SocketAddr) -> Self {
        Self {
            worker_id,
            queue_addr,
            status_bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            request_timeout: crate::client::DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Why a worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    QueueDepleted,
    NotAlive,
    Rejected(RequestError),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("{0}")]
    Client(#[from] QueueClientError),

    #[error("worker status server failed: {0}")]
    StatusServer(#[from] io::Error),
}

pub struct Worker {
    config: WorkerConfig,
    executor: Arc<dyn BucketExecutor>,
    environments: Arc<dyn ExecutionEnvironmentProvider>,
    id_generator: SharedIdGenerator,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        executor: Arc<dyn BucketExecutor>,
        environments: Arc<dyn ExecutionEnvironmentProvider>,
    ) -> Self {
        Self {
            config,
            executor,
            environments,
            id_generator: UuidGenerator::shared(),
        }
    }

    pub fn with_id_generator(mut self, id_generator: SharedIdGenerator) -> Self {
        self.id_generator = id_generator;
        self
    }

    /// Registers with the queue and works until there is nothing left to do.
    /// Runs as many fetch loops as the queue allows parallel buckets.
    #[tracing::instrument(level = "debug", skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn run(self) -> Result<WorkerExit, WorkerError> {
        let processing = CurrentlyProcessingBuckets::default();
        let mut status_server =
            WorkerStatusServer::start(self.config.status_bind_addr, processing.clone()).await?;

        let client =
            QueueClient::new(self.config.queue_addr).with_request_timeout(self.config.request_timeout);

        let exit = match client
            .register_worker(self.config.worker_id.clone(), status_server.addr())
            .await
        {
            Ok(configuration) => {
                tracing::info!(
                    parallel_buckets = configuration.number_of_parallel_buckets,
                    "registered with queue"
                );
                self.work(&client, &configuration, &processing).await
            }
            Err(QueueClientError::Rejected(error)) => Ok(WorkerExit::Rejected(error)),
            Err(error) => Err(error.into()),
        };

        status_server.shutdown().await?;

        tracing::info!(?exit, "worker stopped");
        exit
    }

    async fn work(
        &self,
        client: &QueueClient,
        configuration: &WorkerConfiguration,
        processing: &CurrentlyProcessingBuckets,
    ) -> Result<WorkerExit, WorkerError> {
        let lanes = (0..configuration.number_of_parallel_buckets.max(1))
            .map(|lane| self.run_lane(lane, client, configuration, processing));
        let exits = futures::future::join_all(lanes).await;

        let mut combined = WorkerExit::QueueDepleted;
        for exit in exits {
            match exit? {
                WorkerExit::QueueDepleted => {}
                WorkerExit::NotAlive => {
                    if combined == WorkerExit::QueueDepleted {
                        combined = WorkerExit::NotAlive;
                    }
                }
                rejected @ WorkerExit::Rejected(_) => combined = rejected,
            }
        }
        Ok(combined)
    }

    async fn run_lane(
        &self,
        lane: u32,
        client: &QueueClient,
        configuration: &WorkerConfiguration,
        processing: &CurrentlyProcessingBuckets,
    ) -> Result<WorkerExit, WorkerError> {
        let worker_id = &self.config.worker_id;
        let payload_signature = configuration.payload_signature;

        loop {
            let request_id = RequestId::new(self.id_generator.generate());
            let fetched = match client
                .fetch_bucket(request_id.clone(), worker_id.clone(), payload_signature)
                .await
            {
                Ok(fetched) => fetched,
                Err(QueueClientError::Rejected(error)) => return Ok(WorkerExit::Rejected(error)),
                Err(error) => return Err(error.into()),
            };

            let bucket = match fetched {
                BucketFetchResult::Bucket(bucket) => bucket,
                BucketFetchResult::CheckAgainLater(after) => {
                    tracing::debug!(lane, ?after, "nothing to fetch yet");
                    tokio::time::sleep(after).await;
                    continue;
                }
                BucketFetchResult::QueueIsEmpty => return Ok(WorkerExit::QueueDepleted),
                BucketFetchResult::WorkerIsNotAlive => return Ok(WorkerExit::NotAlive),
            };

            let bucket_id = bucket.bucket_id.clone();
            tracing::debug!(lane, %bucket_id, tests = bucket.test_entries.len(), "executing bucket");

            processing.insert(bucket_id.clone());
            let testing_result = self.execute(&bucket).await;
            let sent = client
                .send_bucket_result(
                    worker_id.clone(),
                    request_id,
                    testing_result,
                    payload_signature,
                )
                .await;
            processing.remove(&bucket_id);

            match sent {
                Ok(_) => {}
                Err(QueueClientError::Rejected(error)) => {
                    tracing::warn!(lane, %bucket_id, %error, "queue rejected bucket result");
                    return Ok(WorkerExit::Rejected(error));
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    async fn execute(&self, bucket: &Bucket) -> TestingResult {
        match self.environments.provision(bucket.test_destination()).await {
            Ok(environment) => {
                let result = self.executor.execute(bucket, &environment).await;
                self.environments.teardown(environment).await;
                result
            }
            Err(error) => {
                tracing::error!(bucket_id = %bucket.bucket_id, %error, "could not provision environment");
                // Nothing ran; every entry is lost and goes through the retry rules.
                TestingResult {
                    bucket_id: bucket.bucket_id.clone(),
                    test_destination: bucket.test_destination().clone(),
                    unfiltered_results: bucket
                        .test_entries
                        .iter()
                        .cloned()
                        .map(TestEntryResult::lost)
                        .collect(),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::{collections::VecDeque, net::SocketAddr, sync::Arc, time::Duration};

    use async_trait::async_trait;
    use ntest::timeout;
    use parking_lot::Mutex;
    use tdq_test_utils::{bucket, passing_result};
    use tdq_utils::{
        error::AnyError,
        net_async::ServerListener,
        net_protocol::{
            self,
            ids::WorkerId,
            models::{Bucket, TestDestination, TestingResult},
            queue::{
                BucketResultResponse, DequeueBucketResponse, Message, RegisterWorkerResponse,
                Request, RequestError, WorkerConfiguration,
            },
        },
        payload_signature::PayloadSignature,
    };
    use tracing_test::traced_test;

    use super::{
        BucketExecutor, EnvironmentHandle, ExecutionEnvironmentProvider, NoopEnvironmentProvider,
        Worker, WorkerConfig, WorkerExit,
    };

    struct PassingExecutor;

    #[async_trait]
    impl BucketExecutor for PassingExecutor {
        async fn execute(&self, bucket: &Bucket, _: &EnvironmentHandle) -> TestingResult {
            passing_result(bucket)
        }
    }

    struct BrokenEnvironments;

    #[async_trait]
    impl ExecutionEnvironmentProvider for BrokenEnvironments {
        async fn provision(&self, _: &TestDestination) -> Result<EnvironmentHandle, AnyError> {
            Err(provisioning_error("no simulators left"))
        }

        async fn teardown(&self, _: EnvironmentHandle) {}
    }

    fn provisioning_error(msg: &str) -> AnyError {
        std::io::Error::new(std::io::ErrorKind::Other, msg.to_owned()).into()
    }

    /// Serves buckets from `buckets` one fetch at a time, then reports the queue empty.
    /// Records every submitted result.
    struct FakeQueue {
        addr: SocketAddr,
        results: Arc<Mutex<Vec<TestingResult>>>,
    }

    async fn fake_queue(
        signature: PayloadSignature,
        parallel_buckets: u32,
        buckets: Vec<Bucket>,
        register_response: Option<RegisterWorkerResponse>,
    ) -> FakeQueue {
        let listener = ServerListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let results: Arc<Mutex<Vec<TestingResult>>> = Default::default();
        let pending = Arc::new(Mutex::new(VecDeque::from(buckets)));

        tokio::spawn({
            let results = results.clone();
            async move {
                loop {
                    let (mut conn, _) = listener.accept().await.unwrap();
                    let Request { message } = net_protocol::async_read(&mut conn).await.unwrap();
                    match message {
                        Message::RegisterWorker(_) => {
                            let response = register_response.clone().unwrap_or(
                                RegisterWorkerResponse::WorkerRegisterSuccess {
                                    worker_configuration: WorkerConfiguration {
                                        number_of_parallel_buckets: parallel_buckets,
                                        payload_signature: signature,
                                    },
                                },
                            );
                            net_protocol::async_write(&mut conn, &response).await.unwrap();
                        }
                        Message::GetBucket(payload) => {
                            assert_eq!(payload.payload_signature, signature);
                            let response = match pending.lock().pop_front() {
                                Some(bucket) => DequeueBucketResponse::BucketDequeued { bucket },
                                None => DequeueBucketResponse::QueueIsEmpty,
                            };
                            net_protocol::async_write(&mut conn, &response).await.unwrap();
                        }
                        Message::BucketResult(payload) => {
                            let bucket_id = payload.testing_result.bucket_id.clone();
                            results.lock().push(payload.testing_result);
                            net_protocol::async_write(
                                &mut conn,
                                &BucketResultResponse::BucketResultAccepted { bucket_id },
                            )
                            .await
                            .unwrap();
                        }
                        other => panic!("unexpected message {other:?}"),
                    }
                }
            }
        });

        FakeQueue { addr, results }
    }

    fn worker(queue: &FakeQueue, environments: Arc<dyn ExecutionEnvironmentProvider>) -> Worker {
        let mut config = WorkerConfig::new(WorkerId::from("w1"), queue.addr);
        config.request_timeout = Duration::from_secs(5);
        Worker::new(config, Arc::new(PassingExecutor), environments)
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn works_until_queue_is_empty() {
        let signature = PayloadSignature::new_random();
        let buckets = vec![bucket("b1", &["t1"]), bucket("b2", &["t2", "t3"])];
        let queue = fake_queue(signature, 2, buckets.clone(), None).await;

        let exit = worker(&queue, Arc::new(NoopEnvironmentProvider))
            .run()
            .await
            .unwrap();
        assert_eq!(exit, WorkerExit::QueueDepleted);

        let mut results = queue.results.lock().clone();
        results.sort_by(|a, b| a.bucket_id.cmp(&b.bucket_id));
        assert_eq!(
            results,
            buckets.iter().map(passing_result).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    #[traced_test]
    #[timeout(10000)]
    async fn failed_provisioning_reports_lost_results() {
        let signature = PayloadSignature::new_random();
        let queue = fake_queue(signature, 1, vec![bucket("b1", &["t1", "t2"])], None).await;

        let exit = worker(&queue, Arc::new(BrokenEnvironments))
            .run()
            .await
            .unwrap();
        assert_eq!(exit, WorkerExit::QueueDepleted);

        let results = queue.results.lock().clone();
        assert_eq!(results.len(), 1);
        assert!(results[0].unfiltered_results.iter().all(|r| r.is_lost()));
        assert_eq!(results[0].unfiltered_results.len(), 2);
        assert!(logs_contain("could not provision environment"));
    }

    #[tokio::test]
    #[traced_test]
    #[timeout(10000)]
    async fn rejected_registration_stops_worker() {
        let signature = PayloadSignature::new_random();
        let rejection = RequestError::WorkerIsBlocked {
            worker_id: WorkerId::from("w1"),
        };
        let queue = fake_queue(
            signature,
            1,
            vec![bucket("b1", &["t1"])],
            Some(RegisterWorkerResponse::Error(rejection.clone())),
        )
        .await;

        let exit = worker(&queue, Arc::new(NoopEnvironmentProvider))
            .run()
            .await
            .unwrap();
        assert_eq!(exit, WorkerExit::Rejected(rejection));
        assert!(queue.results.lock().is_empty());
        assert!(logs_contain("worker stopped"));
        assert!(!logs_contain("registered with queue"));
    }
}
