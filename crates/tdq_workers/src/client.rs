//! The client half of the queue protocol. Every request opens its own connection.

use std::{io, net::SocketAddr, time::Duration};

use serde::de::DeserializeOwned;
use tdq_utils::{
    decay::ExpDecay,
    net_async,
    net_protocol::{
        self,
        ids::{BucketId, JobId, RequestId, WorkerId},
        models::{Bucket, TestEntryConfiguration, TestingResult},
        queue::{
            BucketResultPayload, BucketResultResponse, DequeueBucketPayload,
            DequeueBucketResponse, JobDeleteResponse, JobResults, JobResultsResponse, JobState,
            JobStateResponse, Message, PrioritizedJob, QueueVersionResponse,
            RegisterWorkerPayload, RegisterWorkerResponse, Request, RequestError,
            ScheduleStrategy, ScheduleTestsPayload, ScheduleTestsResponse, WorkerConfiguration,
        },
    },
    payload_signature::PayloadSignature,
    retry::async_retry_n,
    timeout_future::TimeoutFuture,
};
use thiserror::Error;
use tracing::instrument;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_ATTEMPTS: usize = 5;

#[derive(Debug, Error)]
pub enum QueueClientError {
    #[error("failed to talk to the queue: {0}")]
    Io(#[from] io::Error),

    #[error("the queue rejected the request: {0}")]
    Rejected(#[from] RequestError),
}

/// What a worker gets back when asking for work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketFetchResult {
    Bucket(Bucket),
    QueueIsEmpty,
    CheckAgainLater(Duration),
    WorkerIsNotAlive,
}

#[derive(Debug, Clone)]
pub struct QueueClient {
    queue_addr: SocketAddr,
    request_timeout: Duration,
    connect_decay: ExpDecay,
}

impl QueueClient {
    pub fn new(queue_addr: SocketAddr) -> Self {
        Self {
            queue_addr,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_decay: ExpDecay::quadratic(Duration::from_millis(100), Duration::from_secs(3)),
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn queue_addr(&self) -> SocketAddr {
        self.queue_addr
    }

    /// Sends one request and reads its response. Only connecting is retried: a request that
    /// reached the queue is never replayed.
    async fn request<T: DeserializeOwned>(&self, message: Message) -> io::Result<T> {
        let queue_addr = self.queue_addr;
        let connect_timeout = self.request_timeout;

        let mut stream = async_retry_n(CONNECT_ATTEMPTS, self.connect_decay, |attempt| async move {
            if attempt > 1 {
                tracing::info!(attempt, %queue_addr, "reattempting connection to queue");
            }
            net_async::connect(queue_addr, connect_timeout).await
        })
        .await?;

        let request = Request { message };
        let exchange = async {
            net_protocol::async_write(&mut stream, &request).await?;
            net_protocol::async_read(&mut stream).await
        };

        match TimeoutFuture::new(exchange, self.request_timeout).wait().await {
            Some(response) => response,
            None => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!(
                    "queue at {queue_addr} did not answer within {:?}",
                    self.request_timeout
                ),
            )),
        }
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn register_worker(
        &self,
        worker_id: WorkerId,
        worker_rest_address: SocketAddr,
    ) -> Result<WorkerConfiguration, QueueClientError> {
        let response = self
            .request(Message::RegisterWorker(RegisterWorkerPayload {
                worker_id,
                worker_rest_address,
            }))
            .await?;
        match response {
            RegisterWorkerResponse::WorkerRegisterSuccess {
                worker_configuration,
            } => Ok(worker_configuration),
            RegisterWorkerResponse::Error(error) => Err(error.into()),
        }
    }

    #[instrument(level = "trace", skip(self, payload_signature))]
    pub async fn fetch_bucket(
        &self,
        request_id: RequestId,
        worker_id: WorkerId,
        payload_signature: PayloadSignature,
    ) -> Result<BucketFetchResult, QueueClientError> {
        let response = self
            .request(Message::GetBucket(DequeueBucketPayload {
                request_id,
                worker_id,
                payload_signature,
            }))
            .await?;
        Ok(match response {
            DequeueBucketResponse::BucketDequeued { bucket } => BucketFetchResult::Bucket(bucket),
            DequeueBucketResponse::QueueIsEmpty => BucketFetchResult::QueueIsEmpty,
            DequeueBucketResponse::CheckAgainLater { check_after } => {
                BucketFetchResult::CheckAgainLater(check_after)
            }
            DequeueBucketResponse::WorkerIsNotAlive => BucketFetchResult::WorkerIsNotAlive,
            DequeueBucketResponse::Error(error) => return Err(error.into()),
        })
    }

    #[instrument(level = "trace", skip_all, fields(bucket_id = %testing_result.bucket_id))]
    pub async fn send_bucket_result(
        &self,
        worker_id: WorkerId,
        request_id: RequestId,
        testing_result: TestingResult,
        payload_signature: PayloadSignature,
    ) -> Result<BucketId, QueueClientError> {
        let response = self
            .request(Message::BucketResult(BucketResultPayload {
                worker_id,
                request_id,
                testing_result,
                payload_signature,
            }))
            .await?;
        match response {
            BucketResultResponse::BucketResultAccepted { bucket_id } => Ok(bucket_id),
            BucketResultResponse::Error(error) => Err(error.into()),
        }
    }

    /// Returns how many buckets the tests were split into.
    #[instrument(level = "trace", skip(self, test_entry_configurations))]
    pub async fn schedule_tests(
        &self,
        request_id: RequestId,
        schedule_strategy: ScheduleStrategy,
        test_entry_configurations: Vec<TestEntryConfiguration>,
        prioritized_job: PrioritizedJob,
    ) -> Result<usize, QueueClientError> {
        let response = self
            .request(Message::ScheduleTests(ScheduleTestsPayload {
                request_id,
                schedule_strategy,
                test_entry_configurations,
                prioritized_job,
            }))
            .await?;
        match response {
            ScheduleTestsResponse::ScheduledTests { bucket_count, .. } => Ok(bucket_count),
            ScheduleTestsResponse::Error(error) => Err(error.into()),
        }
    }

    pub async fn job_state(&self, job_id: JobId) -> Result<JobState, QueueClientError> {
        match self.request(Message::JobState(job_id)).await? {
            JobStateResponse::JobState(state) => Ok(state),
            JobStateResponse::Error(error) => Err(error.into()),
        }
    }

    pub async fn job_results(&self, job_id: JobId) -> Result<JobResults, QueueClientError> {
        match self.request(Message::JobResults(job_id)).await? {
            JobResultsResponse::JobResults(results) => Ok(results),
            JobResultsResponse::Error(error) => Err(error.into()),
        }
    }

    pub async fn delete_job(&self, job_id: JobId) -> Result<(), QueueClientError> {
        match self.request(Message::JobDelete(job_id)).await? {
            JobDeleteResponse::JobDeleted { .. } => Ok(()),
            JobDeleteResponse::Error(error) => Err(error.into()),
        }
    }

    pub async fn queue_version(&self) -> Result<String, QueueClientError> {
        let QueueVersionResponse { version } = self.request(Message::QueueVersion).await?;
        Ok(version)
    }

    /// Polls the job's state, backing off along `decay`, until it is depleted. Then fetches its
    /// results.
    pub async fn wait_for_job_results(
        &self,
        job_id: JobId,
        mut decay: ExpDecay,
    ) -> Result<JobResults, QueueClientError> {
        let mut last_state = None;
        loop {
            let state = self.job_state(job_id.clone()).await?;
            if state.is_depleted() {
                return self.job_results(job_id).await;
            }
            // Back off only while the job makes no progress.
            if last_state.replace(state.queue_state) != Some(state.queue_state) {
                decay.reset();
            }
            let wait = decay.next_duration();
            tracing::debug!(%job_id, ?wait, queue_state = ?state.queue_state, "job still running");
            tokio::time::sleep(wait).await;
        }
    }
}
