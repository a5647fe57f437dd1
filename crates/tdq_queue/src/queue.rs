//! The queue server: request dispatch over the wire, plus the background pollers.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use tdq_utils::{
    clock::{SharedClock, SystemClock},
    error::{ErrorWorker, ResultLocation},
    here,
    id_generator::{SharedIdGenerator, UuidGenerator},
    log_connection_error,
    net_async::{ServerListener, ServerStream},
    net_protocol::{
        self,
        ids::{JobId, WorkerId},
        queue::{
            BucketResultPayload, BucketResultResponse, DequeueBucketPayload,
            DequeueBucketResponse, JobDeleteResponse, JobResultsResponse, JobStateResponse,
            Message, QueueVersionResponse, RegisterWorkerPayload, RegisterWorkerResponse,
            Request, RequestError, ScheduleTestsPayload, ScheduleTestsResponse,
        },
    },
    payload_signature::PayloadSignature,
    server_shutdown::{ShutdownManager, ShutdownReceiver},
};
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tracing::instrument;

use crate::{
    balancing::{BalancingBucketQueue, NothingToDequeueBehavior},
    bucket_queue::{AcceptanceError, BucketQueueContext, DequeueResult},
    enqueuer::TestsEnqueuer,
    pollers::{run_stuck_bucket_sweep, AlivenessPoller},
    splitting::BucketSplitInfo,
    worker_aliveness::{AlivenessStatus, WorkerAlivenessTracker},
    worker_details::{WorkerConfigurations, WorkerDetailsHolder},
};

/// What happens to a worker whose result matches no bucket it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectedResultPolicy {
    /// Only refuse the result.
    Reject,
    /// Refuse the result and block the worker. Its remaining buckets are recovered by the
    /// stuck-bucket sweep.
    #[default]
    BlockWorker,
}

/// Configures initialization of the queue.
pub struct QueueConfig {
    /// Where the queue server listens. Binds to any port if the port is `0`.
    pub bind_addr: SocketAddr,
    /// The static fleet.
    pub worker_configurations: WorkerConfigurations,
    /// How long workers are told to wait when there is nothing to hand out yet.
    pub check_again_interval: Duration,
    /// Workers silent for longer than this are no longer alive.
    pub maximum_not_reporting_duration: Duration,
    pub stuck_bucket_sweep_interval: Duration,
    pub aliveness_poll_interval: Duration,
    /// How long to wait for a worker's status endpoint to answer.
    pub worker_status_timeout: Duration,
    pub nothing_to_dequeue_behavior: NothingToDequeueBehavior,
    pub rejected_result_policy: RejectedResultPolicy,
    /// Defaults to one worker per configured worker.
    pub bucket_split_info: Option<BucketSplitInfo>,
    pub payload_signature: PayloadSignature,
    pub clock: SharedClock,
    pub id_generator: SharedIdGenerator,
}

pub const DEFAULT_CHECK_AGAIN_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_ALIVENESS_POLL_INTERVAL: Duration = Duration::from_secs(20);
/// Two missed polls, plus slack.
pub const DEFAULT_MAXIMUM_NOT_REPORTING_DURATION: Duration = Duration::from_secs(2 * 20 + 10);
pub const DEFAULT_STUCK_BUCKET_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_WORKER_STATUS_TIMEOUT: Duration = Duration::from_secs(5);

impl QueueConfig {
    /// Creates a [`QueueConfig`] that binds on INADDR_ANY with an arbitrary port, a fresh
    /// payload signature, the wall clock, and random ids.
    pub fn new(worker_configurations: WorkerConfigurations) -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            worker_configurations,
            check_again_interval: DEFAULT_CHECK_AGAIN_INTERVAL,
            maximum_not_reporting_duration: DEFAULT_MAXIMUM_NOT_REPORTING_DURATION,
            stuck_bucket_sweep_interval: DEFAULT_STUCK_BUCKET_SWEEP_INTERVAL,
            aliveness_poll_interval: DEFAULT_ALIVENESS_POLL_INTERVAL,
            worker_status_timeout: DEFAULT_WORKER_STATUS_TIMEOUT,
            nothing_to_dequeue_behavior: NothingToDequeueBehavior::default(),
            rejected_result_policy: RejectedResultPolicy::default(),
            bucket_split_info: None,
            payload_signature: PayloadSignature::new_random(),
            clock: SystemClock::shared(),
            id_generator: UuidGenerator::shared(),
        }
    }

    /// The background pollers tick on these; neither may be zero.
    fn check_intervals(&self) -> Result<(), QueueError> {
        for (name, interval) in [
            ("stuck bucket sweep interval", self.stuck_bucket_sweep_interval),
            ("aliveness poll interval", self.aliveness_poll_interval),
        ] {
            if interval.is_zero() {
                return Err(QueueError::ZeroInterval { name });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("could not bind the queue server to {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("{name} must be greater than zero")]
    ZeroInterval { name: &'static str },

    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("a queue task failed: {0}")]
    Join(#[from] JoinError),
}

/// State shared by every request handler.
#[derive(Clone)]
pub(crate) struct QueueServerCtx {
    queues: Arc<BalancingBucketQueue>,
    enqueuer: Arc<TestsEnqueuer>,
    worker_aliveness: Arc<WorkerAlivenessTracker>,
    worker_details: Arc<WorkerDetailsHolder>,
    worker_configurations: Arc<WorkerConfigurations>,
    payload_signature: PayloadSignature,
    rejected_result_policy: RejectedResultPolicy,
}

impl QueueServerCtx {
    fn new(config: &QueueConfig) -> Self {
        let worker_aliveness = Arc::new(WorkerAlivenessTracker::new(
            config.clock.clone(),
            config.maximum_not_reporting_duration,
            config.worker_configurations.worker_ids().cloned(),
        ));
        let queues = Arc::new(BalancingBucketQueue::new(
            BucketQueueContext {
                clock: config.clock.clone(),
                id_generator: config.id_generator.clone(),
                worker_aliveness: worker_aliveness.clone(),
                check_again_interval: config.check_again_interval,
            },
            config.nothing_to_dequeue_behavior,
        ));
        let bucket_split_info = config
            .bucket_split_info
            .unwrap_or_else(|| BucketSplitInfo::new(config.worker_configurations.len()));
        let enqueuer = Arc::new(TestsEnqueuer::new(
            bucket_split_info,
            config.id_generator.clone(),
            queues.clone(),
        ));

        Self {
            queues,
            enqueuer,
            worker_aliveness,
            worker_details: Default::default(),
            worker_configurations: Arc::new(config.worker_configurations.clone()),
            payload_signature: config.payload_signature,
            rejected_result_policy: config.rejected_result_policy,
        }
    }

    fn check_worker(
        &self,
        worker_id: &WorkerId,
        payload_signature: &PayloadSignature,
    ) -> Result<(), RequestError> {
        if payload_signature != &self.payload_signature {
            tracing::warn!(%worker_id, "payload signature mismatch");
            return Err(RequestError::PayloadSignatureMismatch);
        }
        if !self.worker_configurations.contains(worker_id) {
            return Err(RequestError::UnknownWorker {
                worker_id: worker_id.clone(),
            });
        }
        Ok(())
    }

    #[instrument(level = "trace", skip(self))]
    pub(crate) fn register_worker(&self, payload: RegisterWorkerPayload) -> RegisterWorkerResponse {
        let RegisterWorkerPayload {
            worker_id,
            worker_rest_address,
        } = payload;

        let worker_configuration = match self
            .worker_configurations
            .worker_configuration(&worker_id, self.payload_signature)
        {
            Some(configuration) => configuration,
            None => {
                tracing::warn!(%worker_id, "unknown worker tried to register");
                return RegisterWorkerResponse::Error(RequestError::UnknownWorker { worker_id });
            }
        };

        if self.worker_aliveness.aliveness_for_worker(&worker_id).status == AlivenessStatus::Blocked
        {
            tracing::warn!(%worker_id, "blocked worker tried to register");
            return RegisterWorkerResponse::Error(RequestError::WorkerIsBlocked { worker_id });
        }

        self.worker_details
            .did_register(worker_id.clone(), worker_rest_address);
        self.worker_aliveness.did_register_worker(&worker_id);
        tracing::info!(%worker_id, %worker_rest_address, "worker registered");

        RegisterWorkerResponse::WorkerRegisterSuccess {
            worker_configuration,
        }
    }

    #[instrument(level = "trace", skip(self))]
    pub(crate) fn get_bucket(&self, payload: DequeueBucketPayload) -> DequeueBucketResponse {
        let DequeueBucketPayload {
            request_id,
            worker_id,
            payload_signature,
        } = payload;

        if let Err(error) = self.check_worker(&worker_id, &payload_signature) {
            return DequeueBucketResponse::Error(error);
        }

        match self.queues.dequeue_bucket(request_id, worker_id) {
            DequeueResult::DequeuedBucket(dequeued) => DequeueBucketResponse::BucketDequeued {
                bucket: dequeued.enqueued_bucket.bucket,
            },
            DequeueResult::QueueIsEmpty => DequeueBucketResponse::QueueIsEmpty,
            DequeueResult::CheckAgainLater { after } => {
                DequeueBucketResponse::CheckAgainLater { check_after: after }
            }
            DequeueResult::WorkerIsNotAlive => DequeueBucketResponse::WorkerIsNotAlive,
        }
    }

    #[instrument(level = "trace", skip(self, payload), fields(worker_id = %payload.worker_id, bucket_id = %payload.testing_result.bucket_id))]
    pub(crate) fn bucket_result(&self, payload: BucketResultPayload) -> BucketResultResponse {
        let BucketResultPayload {
            worker_id,
            request_id,
            testing_result,
            payload_signature,
        } = payload;

        if let Err(error) = self.check_worker(&worker_id, &payload_signature) {
            return BucketResultResponse::Error(error);
        }

        match self
            .queues
            .accept(testing_result, request_id, worker_id.clone())
        {
            Ok(bucket_id) => BucketResultResponse::BucketResultAccepted { bucket_id },
            Err(error) => {
                tracing::warn!(%worker_id, %error, "rejected bucket result");
                if matches!(error, AcceptanceError::NoDequeuedBucket { .. })
                    && self.rejected_result_policy == RejectedResultPolicy::BlockWorker
                {
                    self.worker_aliveness.block_worker(&worker_id);
                }
                BucketResultResponse::Error(error.into())
            }
        }
    }

    #[instrument(level = "trace", skip(self, payload), fields(job_id = %payload.prioritized_job.job_id))]
    pub(crate) fn schedule_tests(&self, payload: ScheduleTestsPayload) -> ScheduleTestsResponse {
        let ScheduleTestsPayload {
            request_id,
            schedule_strategy,
            test_entry_configurations,
            prioritized_job,
        } = payload;

        match self
            .enqueuer
            .enqueue(&schedule_strategy, test_entry_configurations, prioritized_job)
        {
            Ok(bucket_count) => ScheduleTestsResponse::ScheduledTests {
                request_id,
                bucket_count,
            },
            Err(error) => ScheduleTestsResponse::Error(RequestError::InvalidSchedule {
                reason: error.to_string(),
            }),
        }
    }

    pub(crate) fn job_state(&self, job_id: &JobId) -> JobStateResponse {
        match self.queues.state(job_id) {
            Ok(state) => JobStateResponse::JobState(state),
            Err(error) => JobStateResponse::Error(error.into()),
        }
    }

    pub(crate) fn job_results(&self, job_id: &JobId) -> JobResultsResponse {
        match self.queues.results(job_id) {
            Ok(results) => JobResultsResponse::JobResults(results),
            Err(error) => JobResultsResponse::Error(error.into()),
        }
    }

    pub(crate) fn job_delete(&self, job_id: &JobId) -> JobDeleteResponse {
        match self.queues.delete(job_id) {
            Ok(()) => JobDeleteResponse::JobDeleted {
                job_id: job_id.clone(),
            },
            Err(error) => JobDeleteResponse::Error(error.into()),
        }
    }

    pub(crate) fn queue_version(&self) -> QueueVersionResponse {
        QueueVersionResponse {
            version: tdq_utils::VERSION.to_owned(),
        }
    }
}

/// Accepts connections and answers one request per connection.
struct QueueServer {
    ctx: QueueServerCtx,
}

impl QueueServer {
    async fn start(self, listener: ServerListener, mut shutdown: ShutdownReceiver) {
        let Self { ctx } = self;

        loop {
            let conn = tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok((conn, _)) => conn,
                        Err(e) => {
                            tracing::error!("error accepting connection to queue: {:?}", e);
                            continue;
                        }
                    }
                }
                _ = shutdown.recv_shutdown_immediately() => {
                    break;
                }
            };

            let ctx = ctx.clone();
            tokio::spawn(async move {
                let result = Self::handle(ctx, conn).await;
                if let Err(error) = result {
                    log_connection_error!(error, "error handling connection to queue: {}")
                }
            });
        }

        tracing::debug!("queue server stopped");
    }

    async fn handle(
        ctx: QueueServerCtx,
        mut conn: ServerStream,
    ) -> Result<(), tdq_utils::error::ConnectionError> {
        let Request { message } = net_protocol::async_read(&mut conn)
            .await
            .located(here!())
            .no_worker()?;

        tracing::trace!(operation = message.operation(), "handling request");

        // Handlers are synchronous and release every queue lock before the response is written.
        match message {
            Message::RegisterWorker(payload) => {
                let worker_id = payload.worker_id.clone();
                let response = ctx.register_worker(payload);
                net_protocol::async_write(&mut conn, &response)
                    .await
                    .located(here!())
                    .worker(&worker_id)
            }
            Message::GetBucket(payload) => {
                let worker_id = payload.worker_id.clone();
                let response = ctx.get_bucket(payload);
                net_protocol::async_write(&mut conn, &response)
                    .await
                    .located(here!())
                    .worker(&worker_id)
            }
            Message::BucketResult(payload) => {
                let worker_id = payload.worker_id.clone();
                let response = ctx.bucket_result(payload);
                net_protocol::async_write(&mut conn, &response)
                    .await
                    .located(here!())
                    .worker(&worker_id)
            }
            Message::ScheduleTests(payload) => {
                let response = ctx.schedule_tests(payload);
                net_protocol::async_write(&mut conn, &response)
                    .await
                    .located(here!())
                    .no_worker()
            }
            Message::JobState(job_id) => {
                net_protocol::async_write(&mut conn, &ctx.job_state(&job_id))
                    .await
                    .located(here!())
                    .no_worker()
            }
            Message::JobResults(job_id) => {
                net_protocol::async_write(&mut conn, &ctx.job_results(&job_id))
                    .await
                    .located(here!())
                    .no_worker()
            }
            Message::JobDelete(job_id) => {
                net_protocol::async_write(&mut conn, &ctx.job_delete(&job_id))
                    .await
                    .located(here!())
                    .no_worker()
            }
            Message::QueueVersion => net_protocol::async_write(&mut conn, &ctx.queue_version())
                .await
                .located(here!())
                .no_worker(),
        }
    }
}

/// A running queue.
pub struct Queue {
    shutdown_manager: ShutdownManager,
    ctx: QueueServerCtx,

    server_addr: SocketAddr,
    server_handle: Option<JoinHandle<()>>,
    sweep_handle: Option<JoinHandle<()>>,
    poller_handle: Option<JoinHandle<()>>,

    active: bool,
}

impl Queue {
    /// Binds the queue server and starts the background pollers.
    pub async fn start(config: QueueConfig) -> Result<Self, QueueError> {
        config.check_intervals()?;

        let ctx = QueueServerCtx::new(&config);

        let listener = ServerListener::bind(config.bind_addr)
            .await
            .map_err(|source| QueueError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let server_addr = listener.local_addr()?;

        let mut shutdown_manager = ShutdownManager::default();

        let server_handle = tokio::spawn(
            QueueServer { ctx: ctx.clone() }.start(listener, shutdown_manager.add_receiver()),
        );

        let sweep_handle = tokio::spawn(run_stuck_bucket_sweep(
            ctx.queues.clone(),
            config.stuck_bucket_sweep_interval,
            shutdown_manager.add_receiver(),
        ));

        let poller = AlivenessPoller {
            worker_aliveness: ctx.worker_aliveness.clone(),
            worker_details: ctx.worker_details.clone(),
            clock: config.clock.clone(),
            request_timeout: config.worker_status_timeout,
            reconcile_grace: config.aliveness_poll_interval,
        };
        let poller_handle = tokio::spawn(
            poller.run(config.aliveness_poll_interval, shutdown_manager.add_receiver()),
        );

        tracing::info!(
            %server_addr,
            workers = config.worker_configurations.len(),
            "queue started"
        );

        Ok(Self {
            shutdown_manager,
            ctx,
            server_addr,
            server_handle: Some(server_handle),
            sweep_handle: Some(sweep_handle),
            poller_handle: Some(poller_handle),
            active: true,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn payload_signature(&self) -> PayloadSignature {
        self.ctx.payload_signature
    }

    pub fn queues(&self) -> &Arc<BalancingBucketQueue> {
        &self.ctx.queues
    }

    pub fn worker_aliveness(&self) -> &Arc<WorkerAlivenessTracker> {
        &self.ctx.worker_aliveness
    }

    pub fn is_depleted(&self) -> bool {
        self.ctx.queues.is_depleted()
    }

    pub fn has_any_alive_worker(&self) -> bool {
        self.ctx.worker_aliveness.has_any_alive_worker()
    }

    /// Stops the server and the pollers, and waits for them to exit.
    #[instrument(level = "trace", skip(self))]
    pub async fn shutdown(&mut self) -> Result<(), QueueError> {
        if !self.active {
            return Ok(());
        }
        self.active = false;

        self.shutdown_manager.shutdown_immediately()?;

        for handle in [
            self.server_handle.take(),
            self.sweep_handle.take(),
            self.poller_handle.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.await?;
        }

        tracing::info!(server_addr = %self.server_addr, "queue shut down");
        Ok(())
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if self.active {
            // Never shut down explicitly; at least tell the tasks to stop.
            let _ = self.shutdown_manager.shutdown_immediately();
        }
    }
}
