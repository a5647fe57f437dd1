//! Requests served by the queue, and their responses.
//!
//! Every request travels as one [Request] frame on a fresh connection; the queue answers with
//! exactly one frame of the response type documented on each [Message] variant.

use std::{fmt, net::SocketAddr, ops::Add, time::Duration};

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    ids::{BucketId, JobGroupId, JobId, RequestId, WorkerId},
    models::{Bucket, TestEntryConfiguration, TestingResult},
};
use crate::payload_signature::PayloadSignature;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Message {
    /// Answered with [RegisterWorkerResponse].
    RegisterWorker(RegisterWorkerPayload),
    /// Answered with [DequeueBucketResponse].
    GetBucket(DequeueBucketPayload),
    /// Answered with [BucketResultResponse].
    BucketResult(BucketResultPayload),
    /// Answered with [ScheduleTestsResponse].
    ScheduleTests(ScheduleTestsPayload),
    /// Answered with [JobStateResponse].
    JobState(JobId),
    /// Answered with [JobResultsResponse].
    JobResults(JobId),
    /// Answered with [JobDeleteResponse].
    JobDelete(JobId),
    /// Answered with [QueueVersionResponse].
    QueueVersion,
}

impl Message {
    /// Short name of the operation, for logging.
    pub fn operation(&self) -> &'static str {
        match self {
            Message::RegisterWorker(_) => "register_worker",
            Message::GetBucket(_) => "get_bucket",
            Message::BucketResult(_) => "bucket_result",
            Message::ScheduleTests(_) => "schedule_tests",
            Message::JobState(_) => "job_state",
            Message::JobResults(_) => "job_results",
            Message::JobDelete(_) => "job_delete",
            Message::QueueVersion => "queue_version",
        }
    }
}

/// Why the queue refused a request. Refusals never change queue state, except that a worker
/// may be blocked under [RequestError::NoDequeuedBucket] depending on queue policy.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestError {
    #[error("payload signature does not match the queue's signature")]
    PayloadSignatureMismatch,
    #[error("worker {worker_id} is not part of the queue's worker configuration")]
    UnknownWorker { worker_id: WorkerId },
    #[error("worker {worker_id} is blocked")]
    WorkerIsBlocked { worker_id: WorkerId },
    #[error("job {job_id} is unknown to the queue")]
    UnknownJob { job_id: JobId },
    #[error("bucket {bucket_id} does not belong to any job known to the queue")]
    UnknownBucket { bucket_id: BucketId },
    #[error(
        "bucket {bucket_id} is not dequeued by worker {worker_id} under request {request_id}"
    )]
    NoDequeuedBucket {
        bucket_id: BucketId,
        worker_id: WorkerId,
        request_id: RequestId,
    },
    #[error("invalid schedule request: {reason}")]
    InvalidSchedule { reason: String },
}

impl RequestError {
    /// Whether the request referenced something the queue does not (or no longer) know about.
    /// Submitting the same request again will not succeed.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RequestError::UnknownJob { .. }
                | RequestError::UnknownBucket { .. }
                | RequestError::NoDequeuedBucket { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterWorkerPayload {
    pub worker_id: WorkerId,
    /// Where the worker serves its own status endpoint.
    pub worker_rest_address: SocketAddr,
}

/// Handed to a worker when it registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfiguration {
    pub number_of_parallel_buckets: u32,
    pub payload_signature: PayloadSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterWorkerResponse {
    WorkerRegisterSuccess {
        worker_configuration: WorkerConfiguration,
    },
    Error(RequestError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DequeueBucketPayload {
    pub request_id: RequestId,
    pub worker_id: WorkerId,
    pub payload_signature: PayloadSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DequeueBucketResponse {
    BucketDequeued { bucket: Bucket },
    QueueIsEmpty,
    CheckAgainLater { check_after: Duration },
    WorkerIsNotAlive,
    Error(RequestError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketResultPayload {
    pub worker_id: WorkerId,
    pub request_id: RequestId,
    pub testing_result: TestingResult,
    pub payload_signature: PayloadSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketResultResponse {
    BucketResultAccepted { bucket_id: BucketId },
    Error(RequestError),
}

/// How a flat list of tests is split into buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ScheduleStrategy {
    /// One test per bucket.
    Individual,
    /// One bucket per worker.
    EquallyDivided,
    /// Chunks of decreasing size, each divided among the workers.
    Progressive,
    /// Everything in a single bucket.
    Unsplit,
    /// Buckets of at most `size` tests.
    FixedBucketSize { size: usize },
}

/// Priorities range over `0..=999`; higher runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Priority(u16);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("priority {0} is out of range 0..=999")]
pub struct PriorityOutOfRange(pub u16);

impl Priority {
    pub const LOWEST: Priority = Priority(0);
    pub const MEDIUM: Priority = Priority(500);
    pub const HIGHEST: Priority = Priority(999);

    pub fn new(value: u16) -> Result<Self, PriorityOutOfRange> {
        if value > Self::HIGHEST.0 {
            Err(PriorityOutOfRange(value))
        } else {
            Ok(Self(value))
        }
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::MEDIUM
    }
}

impl TryFrom<u16> for Priority {
    type Error = PriorityOutOfRange;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u16 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrioritizedJob {
    pub job_group_id: JobGroupId,
    pub job_group_priority: Priority,
    pub job_id: JobId,
    pub job_priority: Priority,
}

impl PrioritizedJob {
    /// A job in its own group, at medium priority.
    pub fn standalone(job_id: JobId) -> Self {
        Self {
            job_group_id: JobGroupId::new(job_id.as_str()),
            job_group_priority: Priority::MEDIUM,
            job_id,
            job_priority: Priority::MEDIUM,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTestsPayload {
    pub request_id: RequestId,
    pub schedule_strategy: ScheduleStrategy,
    pub test_entry_configurations: Vec<TestEntryConfiguration>,
    pub prioritized_job: PrioritizedJob,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleTestsResponse {
    ScheduledTests {
        request_id: RequestId,
        bucket_count: usize,
    },
    Error(RequestError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunningQueueState {
    pub enqueued_bucket_count: usize,
    pub dequeued_bucket_count: usize,
}

impl RunningQueueState {
    pub fn is_depleted(&self) -> bool {
        self.enqueued_bucket_count == 0 && self.dequeued_bucket_count == 0
    }
}

impl Add for RunningQueueState {
    type Output = RunningQueueState;

    fn add(self, rhs: Self) -> Self::Output {
        RunningQueueState {
            enqueued_bucket_count: self.enqueued_bucket_count + rhs.enqueued_bucket_count,
            dequeued_bucket_count: self.dequeued_bucket_count + rhs.dequeued_bucket_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Running(RunningQueueState),
    Depleted,
}

impl From<RunningQueueState> for QueueState {
    fn from(state: RunningQueueState) -> Self {
        if state.is_depleted() {
            QueueState::Depleted
        } else {
            QueueState::Running(state)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: JobId,
    pub queue_state: QueueState,
}

impl JobState {
    pub fn is_depleted(&self) -> bool {
        self.queue_state == QueueState::Depleted
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResults {
    pub job_id: JobId,
    pub testing_results: Vec<TestingResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStateResponse {
    JobState(JobState),
    Error(RequestError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobResultsResponse {
    JobResults(JobResults),
    Error(RequestError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobDeleteResponse {
    JobDeleted { job_id: JobId },
    Error(RequestError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueVersionResponse {
    pub version: String,
}
