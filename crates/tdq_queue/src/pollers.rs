//! Background loops of the queue: the stuck-bucket sweep and the worker aliveness poll.
//!
//! Both run on their own timers and touch queue state only through short lock acquisitions;
//! worker status requests happen outside of any lock.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tdq_utils::{
    clock::{Clock, SharedClock},
    error::{ErrorLocation, OpaqueResult, ResultLocation},
    here,
    net_async,
    net_protocol::{
        self,
        ids::BucketId,
        workers::{CurrentlyProcessingBucketsResponse, WorkerStatusRequest},
    },
    server_shutdown::ShutdownReceiver,
    timeout_future::TimeoutFuture,
};
use tokio::time::MissedTickBehavior;

use crate::{
    balancing::BalancingBucketQueue,
    bucket_queue::StuckBucket,
    worker_aliveness::{AlivenessStatus, WorkerAlivenessTracker},
    worker_details::WorkerDetailsHolder,
};

/// Re-enqueues stuck buckets across all jobs. Returns how many were found.
pub fn sweep_stuck_buckets(queues: &BalancingBucketQueue) -> usize {
    let stuck = queues.reenqueue_stuck_buckets();
    for (job_id, stuck_bucket) in stuck.iter() {
        let StuckBucket {
            bucket,
            worker_id,
            request_id,
            reason,
        } = stuck_bucket;
        tracing::warn!(
            %job_id,
            bucket_id = %bucket.bucket_id,
            %worker_id,
            %request_id,
            ?reason,
            "re-enqueued stuck bucket"
        );
    }
    stuck.len()
}

pub async fn run_stuck_bucket_sweep(
    queues: Arc<BalancingBucketQueue>,
    interval: Duration,
    mut shutdown: ShutdownReceiver,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.recv_shutdown_immediately() => {
                break;
            }
        }
        sweep_stuck_buckets(&queues);
    }

    tracing::debug!("stuck bucket sweep stopped");
}

/// Asks a worker which buckets it is processing.
pub async fn fetch_currently_processing_buckets(
    worker_addr: SocketAddr,
    timeout: Duration,
) -> OpaqueResult<Vec<BucketId>> {
    let request = async {
        let mut stream = net_async::connect(worker_addr, timeout)
            .await
            .located(here!())?;
        net_protocol::async_write(&mut stream, &WorkerStatusRequest::CurrentlyProcessingBuckets)
            .await
            .located(here!())?;
        let response: CurrentlyProcessingBucketsResponse = net_protocol::async_read(&mut stream)
            .await
            .located(here!())?;
        OpaqueResult::Ok(response.bucket_ids)
    };

    match TimeoutFuture::new(request, timeout).wait().await {
        Some(result) => result,
        None => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("worker at {worker_addr} did not answer within {timeout:?}"),
        )
        .located(here!())),
    }
}

/// Cross-checks what the queue believes each worker is doing against what the worker says.
/// The worker's word wins.
pub struct AlivenessPoller {
    pub worker_aliveness: Arc<WorkerAlivenessTracker>,
    pub worker_details: Arc<WorkerDetailsHolder>,
    pub clock: SharedClock,
    pub request_timeout: Duration,
    /// Buckets handed out this long before a status request are kept even if the worker's
    /// answer omits them. The worker records a bucket only once its fetch response arrives.
    pub reconcile_grace: Duration,
}

impl AlivenessPoller {
    pub async fn poll_once(&self) {
        let polls = self
            .worker_details
            .known_addresses()
            .into_iter()
            .filter(|(worker_id, _)| {
                self.worker_aliveness.aliveness_for_worker(worker_id).status
                    != AlivenessStatus::Blocked
            })
            .map(|(worker_id, addr)| async move {
                let requested_at = self.clock.now();
                let result = fetch_currently_processing_buckets(addr, self.request_timeout).await;
                (worker_id, requested_at, result)
            });

        for (worker_id, requested_at, result) in futures::future::join_all(polls).await {
            match result {
                Ok(bucket_ids) => self.worker_aliveness.reconcile_bucket_ids_being_processed(
                    bucket_ids,
                    &worker_id,
                    requested_at.saturating_sub(self.reconcile_grace),
                ),
                Err(error) => {
                    tracing::debug!(%worker_id, %error, "worker did not report its buckets")
                }
            }
        }

        self.log_summary();
    }

    fn log_summary(&self) {
        let (mut alive, mut silent, mut blocked, mut not_registered) = (0, 0, 0, 0);
        for aliveness in self.worker_aliveness.worker_aliveness().values() {
            match aliveness.status {
                AlivenessStatus::Alive => alive += 1,
                AlivenessStatus::Silent { .. } => silent += 1,
                AlivenessStatus::Blocked => blocked += 1,
                AlivenessStatus::NotRegistered => not_registered += 1,
            }
        }
        tracing::debug!(alive, silent, blocked, not_registered, "worker aliveness");
    }

    pub async fn run(self, interval: Duration, mut shutdown: ShutdownReceiver) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv_shutdown_immediately() => {
                    break;
                }
            }
            tokio::select! {
                _ = self.poll_once() => {}
                _ = shutdown.recv_shutdown_immediately() => {
                    break;
                }
            }
        }

        tracing::debug!("aliveness poller stopped");
    }
}

#[cfg(test)]
mod test {
    use std::{collections::BTreeSet, net::SocketAddr, sync::Arc, time::Duration};

    use ntest::timeout;
    use tdq_utils::{
        clock::SystemClock,
        net_async::ServerListener,
        net_protocol::{
            self,
            ids::{BucketId, WorkerId},
            workers::{CurrentlyProcessingBucketsResponse, WorkerStatusRequest},
        },
        server_shutdown::ShutdownManager,
    };
    use tracing_test::traced_test;

    use super::{fetch_currently_processing_buckets, AlivenessPoller};
    use crate::{worker_aliveness::WorkerAlivenessTracker, worker_details::WorkerDetailsHolder};

    /// Answers status requests with `bucket_ids`, forever.
    async fn fake_worker_status(bucket_ids: Vec<&str>) -> SocketAddr {
        let bucket_ids: Vec<BucketId> = bucket_ids.into_iter().map(BucketId::from).collect();
        let listener = ServerListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut conn, _) = listener.accept().await.unwrap();
                let request: WorkerStatusRequest = net_protocol::async_read(&mut conn).await.unwrap();
                assert_eq!(request, WorkerStatusRequest::CurrentlyProcessingBuckets);
                let response = CurrentlyProcessingBucketsResponse {
                    bucket_ids: bucket_ids.clone(),
                };
                net_protocol::async_write(&mut conn, &response).await.unwrap();
            }
        });
        addr
    }

    fn poller(tracker: Arc<WorkerAlivenessTracker>, details: Arc<WorkerDetailsHolder>) -> AlivenessPoller {
        poller_with_grace(tracker, details, Duration::ZERO)
    }

    fn poller_with_grace(
        tracker: Arc<WorkerAlivenessTracker>,
        details: Arc<WorkerDetailsHolder>,
        reconcile_grace: Duration,
    ) -> AlivenessPoller {
        AlivenessPoller {
            worker_aliveness: tracker,
            worker_details: details,
            clock: SystemClock::shared(),
            request_timeout: Duration::from_secs(5),
            reconcile_grace,
        }
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn fetches_buckets_from_worker() {
        let addr = fake_worker_status(vec!["b1", "b2"]).await;
        let buckets = fetch_currently_processing_buckets(addr, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(buckets, vec![BucketId::from("b1"), BucketId::from("b2")]);
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn unreachable_worker_is_an_error() {
        let listener = ServerListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(fetch_currently_processing_buckets(addr, Duration::from_millis(500))
            .await
            .is_err());
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn poll_replaces_tracked_buckets_with_worker_report() {
        let w1 = WorkerId::from("w1");
        let tracker = Arc::new(WorkerAlivenessTracker::new(
            SystemClock::shared(),
            Duration::from_secs(60),
            [w1.clone()],
        ));
        tracker.did_register_worker(&w1);
        tracker.did_dequeue_bucket(&BucketId::from("finished"), &w1);
        // Make sure the dequeue happened strictly before the poll request.
        tokio::time::sleep(Duration::from_millis(5)).await;

        let details = Arc::new(WorkerDetailsHolder::default());
        details.did_register(w1.clone(), fake_worker_status(vec!["running"]).await);

        poller(tracker.clone(), details).poll_once().await;

        assert_eq!(
            tracker.aliveness_for_worker(&w1).bucket_ids_being_processed,
            BTreeSet::from([BucketId::from("running")])
        );
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn poll_keeps_buckets_dequeued_within_grace() {
        let w1 = WorkerId::from("w1");
        let tracker = Arc::new(WorkerAlivenessTracker::new(
            SystemClock::shared(),
            Duration::from_secs(60),
            [w1.clone()],
        ));
        tracker.did_register_worker(&w1);
        tracker.did_dequeue_bucket(&BucketId::from("in-flight"), &w1);
        tokio::time::sleep(Duration::from_millis(5)).await;

        // The worker has not yet received "in-flight" when it answers.
        let details = Arc::new(WorkerDetailsHolder::default());
        details.did_register(w1.clone(), fake_worker_status(vec!["running"]).await);

        poller_with_grace(tracker.clone(), details, Duration::from_secs(20))
            .poll_once()
            .await;

        assert_eq!(
            tracker.aliveness_for_worker(&w1).bucket_ids_being_processed,
            BTreeSet::from([BucketId::from("in-flight"), BucketId::from("running")])
        );
    }

    #[tokio::test]
    #[traced_test]
    #[timeout(10000)]
    async fn poller_stops_on_shutdown() {
        let tracker = Arc::new(WorkerAlivenessTracker::new(
            SystemClock::shared(),
            Duration::from_secs(60),
            Vec::<WorkerId>::new(),
        ));
        let details = Arc::new(WorkerDetailsHolder::default());
        let (mut shutdown_manager, shutdown_rx) = ShutdownManager::new_pair();

        let run = poller(tracker, details).run(Duration::from_millis(10), shutdown_rx);
        let stop = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown_manager.shutdown_immediately().unwrap();
        };
        tokio::join!(run, stop);

        assert!(logs_contain("aliveness poller stopped"));
    }
}
