//! Buckets of a single job: waiting, handed out, and done.
//!
//! Every mutation happens under the queue's one lock. Calls into the aliveness tracker are
//! made while holding it, never the other way around.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tdq_utils::{
    clock::{Clock, SharedClock},
    id_generator::{SharedIdGenerator, UniqueIdGenerator},
    log_assert,
    net_protocol::{
        ids::{BucketId, RequestId, WorkerId},
        models::{Bucket, TestEntry, TestEntryResult, TestingResult},
        queue::{RequestError, RunningQueueState},
    },
    time::EpochMillis,
};
use thiserror::Error;

use crate::{
    test_history::TestHistoryTracker,
    worker_aliveness::{AlivenessStatus, WorkerAliveness, WorkerAlivenessTracker},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueuedBucket {
    pub bucket: Bucket,
    pub enqueue_timestamp: EpochMillis,
    /// Distinguishes repeated enqueues of the same bucket.
    pub unique_identifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DequeuedBucket {
    pub enqueued_bucket: EnqueuedBucket,
    pub worker_id: WorkerId,
    pub request_id: RequestId,
}

impl DequeuedBucket {
    pub fn bucket(&self) -> &Bucket {
        &self.enqueued_bucket.bucket
    }

    fn is_claimed_by(&self, bucket_id: &BucketId, worker_id: &WorkerId, request_id: &RequestId) -> bool {
        &self.enqueued_bucket.bucket.bucket_id == bucket_id
            && &self.worker_id == worker_id
            && &self.request_id == request_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DequeueResult {
    DequeuedBucket(DequeuedBucket),
    /// Nothing is left to hand out, and nothing is in flight.
    QueueIsEmpty,
    /// Nothing to hand out right now, but in-flight buckets may yet produce retries.
    CheckAgainLater { after: Duration },
    WorkerIsNotAlive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckBucketReason {
    WorkerIsSilent,
    WorkerIsBlocked,
    WorkerNotRegistered,
    /// The worker is alive, but no longer reports the bucket as being processed.
    BucketLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckBucket {
    pub bucket: Bucket,
    pub worker_id: WorkerId,
    pub request_id: RequestId,
    pub reason: StuckBucketReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcceptanceError {
    #[error(
        "no bucket {bucket_id} is dequeued by worker {worker_id} under request {request_id}"
    )]
    NoDequeuedBucket {
        bucket_id: BucketId,
        worker_id: WorkerId,
        request_id: RequestId,
    },
    #[error("bucket {bucket_id} does not belong to any known job")]
    UnknownBucket { bucket_id: BucketId },
}

impl From<AcceptanceError> for RequestError {
    fn from(err: AcceptanceError) -> Self {
        match err {
            AcceptanceError::NoDequeuedBucket {
                bucket_id,
                worker_id,
                request_id,
            } => RequestError::NoDequeuedBucket {
                bucket_id,
                worker_id,
                request_id,
            },
            AcceptanceError::UnknownBucket { bucket_id } => {
                RequestError::UnknownBucket { bucket_id }
            }
        }
    }
}

/// Bucket bookkeeping, for checking that no bucket goes missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueCounters {
    pub enqueued: usize,
    pub dequeued: usize,
    pub accepted: usize,
    /// Includes retry buckets, but not stuck buckets put back.
    pub total_enqueued: usize,
}

/// What every bucket queue shares with its siblings.
#[derive(Debug, Clone)]
pub struct BucketQueueContext {
    pub clock: SharedClock,
    pub id_generator: SharedIdGenerator,
    pub worker_aliveness: Arc<WorkerAlivenessTracker>,
    pub check_again_interval: Duration,
}

#[derive(Debug, Default)]
struct BucketQueueState {
    /// Sorted by enqueue timestamp; equal timestamps keep insertion order.
    enqueued: Vec<EnqueuedBucket>,
    dequeued: Vec<DequeuedBucket>,
    history: TestHistoryTracker,
    results: Vec<TestingResult>,
    known_bucket_ids: HashSet<BucketId>,
    accepted: usize,
    total_enqueued: usize,
}

#[derive(Debug)]
pub struct BucketQueue {
    ctx: BucketQueueContext,
    state: Mutex<BucketQueueState>,
}

impl BucketQueue {
    pub fn new(ctx: BucketQueueContext) -> Self {
        Self {
            ctx,
            state: Default::default(),
        }
    }

    fn push_enqueued(&self, state: &mut BucketQueueState, bucket: Bucket) {
        let enqueued = EnqueuedBucket {
            bucket,
            enqueue_timestamp: self.ctx.clock.now(),
            unique_identifier: self.ctx.id_generator.generate(),
        };
        let at = state
            .enqueued
            .partition_point(|e| e.enqueue_timestamp <= enqueued.enqueue_timestamp);
        state.enqueued.insert(at, enqueued);
    }

    pub fn enqueue(&self, buckets: impl IntoIterator<Item = Bucket>) {
        let mut state = self.state.lock();
        for bucket in buckets {
            state.known_bucket_ids.insert(bucket.bucket_id.clone());
            state.total_enqueued += 1;
            self.push_enqueued(&mut state, bucket);
        }
    }

    /// A bucket already handed out for exactly this request, if any.
    pub fn previously_dequeued_bucket(
        &self,
        request_id: &RequestId,
        worker_id: &WorkerId,
    ) -> Option<DequeuedBucket> {
        let state = self.state.lock();
        state
            .dequeued
            .iter()
            .find(|d| &d.request_id == request_id && &d.worker_id == worker_id)
            .cloned()
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub fn dequeue_bucket(&self, request_id: RequestId, worker_id: WorkerId) -> DequeueResult {
        if !may_dequeue(&self.ctx.worker_aliveness.aliveness_for_worker(&worker_id)) {
            return DequeueResult::WorkerIsNotAlive;
        }

        let mut state = self.state.lock();

        // A worker retrying a fetch whose response it never saw gets the same bucket again.
        if let Some(previous) = state
            .dequeued
            .iter()
            .find(|d| d.request_id == request_id && d.worker_id == worker_id)
        {
            return DequeueResult::DequeuedBucket(previous.clone());
        }

        let alive_worker_ids = self.ctx.worker_aliveness.alive_worker_ids();
        let index = state
            .history
            .bucket_to_dequeue(&worker_id, &state.enqueued, &alive_worker_ids);

        match index {
            Some(index) => {
                let enqueued_bucket = state.enqueued.remove(index);
                let dequeued = DequeuedBucket {
                    enqueued_bucket,
                    worker_id,
                    request_id,
                };
                self.ctx
                    .worker_aliveness
                    .did_dequeue_bucket(&dequeued.bucket().bucket_id, &dequeued.worker_id);
                state.dequeued.push(dequeued.clone());
                DequeueResult::DequeuedBucket(dequeued)
            }
            None if state.enqueued.is_empty() && state.dequeued.is_empty() => {
                DequeueResult::QueueIsEmpty
            }
            None => DequeueResult::CheckAgainLater {
                after: self.ctx.check_again_interval,
            },
        }
    }

    /// Accepts a result for a bucket dequeued by `worker_id` under `request_id`.
    ///
    /// Failed tests with retries left are put back in a new bucket, atomically with the
    /// acceptance.
    #[tracing::instrument(level = "trace", skip(self, testing_result), fields(bucket_id = %testing_result.bucket_id))]
    pub fn accept(
        &self,
        testing_result: TestingResult,
        request_id: RequestId,
        worker_id: WorkerId,
    ) -> Result<BucketId, AcceptanceError> {
        let mut state = self.state.lock();

        let index = state
            .dequeued
            .iter()
            .position(|d| d.is_claimed_by(&testing_result.bucket_id, &worker_id, &request_id))
            .ok_or_else(|| AcceptanceError::NoDequeuedBucket {
                bucket_id: testing_result.bucket_id.clone(),
                worker_id: worker_id.clone(),
                request_id: request_id.clone(),
            })?;

        let dequeued = state.dequeued.remove(index);
        let bucket = dequeued.enqueued_bucket.bucket;
        let testing_result = match_results_to_bucket(testing_result, &bucket);

        let accepted = state.history.accept(testing_result, &bucket, &worker_id);
        if !accepted.entries_to_retry.is_empty() {
            let retry = bucket.with_test_entries(accepted.entries_to_retry);
            tracing::debug!(
                bucket_id = %retry.bucket_id,
                tests = retry.test_entries.len(),
                "enqueueing retry bucket"
            );
            state.total_enqueued += 1;
            self.push_enqueued(&mut state, retry);
        }
        if !accepted.testing_result.unfiltered_results.is_empty() {
            state.results.push(accepted.testing_result);
        }
        state.accepted += 1;

        self.ctx
            .worker_aliveness
            .did_accept_bucket_result(&bucket.bucket_id, &worker_id);

        Ok(bucket.bucket_id)
    }

    /// Puts back every dequeued bucket whose worker is no longer alive, or no longer claims
    /// to be processing it.
    pub fn reenqueue_stuck_buckets(&self) -> Vec<StuckBucket> {
        let mut state = self.state.lock();
        if state.dequeued.is_empty() {
            return vec![];
        }

        let mut aliveness: HashMap<WorkerId, WorkerAliveness> = HashMap::new();
        let mut stuck = Vec::new();

        for dequeued in std::mem::take(&mut state.dequeued) {
            let worker_aliveness = aliveness
                .entry(dequeued.worker_id.clone())
                .or_insert_with(|| {
                    self.ctx
                        .worker_aliveness
                        .aliveness_for_worker(&dequeued.worker_id)
                });

            let reason = match worker_aliveness.status {
                AlivenessStatus::Alive => {
                    if worker_aliveness
                        .bucket_ids_being_processed
                        .contains(&dequeued.bucket().bucket_id)
                    {
                        None
                    } else {
                        Some(StuckBucketReason::BucketLost)
                    }
                }
                AlivenessStatus::Silent { .. } => Some(StuckBucketReason::WorkerIsSilent),
                AlivenessStatus::Blocked => Some(StuckBucketReason::WorkerIsBlocked),
                AlivenessStatus::NotRegistered => Some(StuckBucketReason::WorkerNotRegistered),
            };

            match reason {
                None => state.dequeued.push(dequeued),
                Some(reason) => {
                    let DequeuedBucket {
                        enqueued_bucket,
                        worker_id,
                        request_id,
                    } = dequeued;
                    stuck.push(StuckBucket {
                        bucket: enqueued_bucket.bucket.clone(),
                        worker_id,
                        request_id,
                        reason,
                    });
                    self.push_enqueued(&mut state, enqueued_bucket.bucket);
                }
            }
        }

        stuck
    }

    pub fn running_queue_state(&self) -> RunningQueueState {
        let state = self.state.lock();
        RunningQueueState {
            enqueued_bucket_count: state.enqueued.len(),
            dequeued_bucket_count: state.dequeued.len(),
        }
    }

    /// Accepted results, without entries that were retried.
    pub fn results(&self) -> Vec<TestingResult> {
        self.state.lock().results.clone()
    }

    /// Whether the bucket was ever enqueued here.
    pub fn contains_bucket(&self, bucket_id: &BucketId) -> bool {
        self.state.lock().known_bucket_ids.contains(bucket_id)
    }

    pub fn enqueued_buckets(&self) -> Vec<EnqueuedBucket> {
        self.state.lock().enqueued.clone()
    }

    pub fn dequeued_buckets(&self) -> Vec<DequeuedBucket> {
        self.state.lock().dequeued.clone()
    }

    pub fn counters(&self) -> QueueCounters {
        let state = self.state.lock();
        QueueCounters {
            enqueued: state.enqueued.len(),
            dequeued: state.dequeued.len(),
            accepted: state.accepted,
            total_enqueued: state.total_enqueued,
        }
    }
}

/// Silent and blocked workers get nothing. Workers that never registered may still fetch.
pub(crate) fn may_dequeue(aliveness: &WorkerAliveness) -> bool {
    !matches!(
        aliveness.status,
        AlivenessStatus::Blocked | AlivenessStatus::Silent { .. }
    )
}

/// Lines up a worker's result with the bucket it was for: one entry result per bucket entry,
/// in bucket order. Missing entries become lost results; entries the bucket never had are
/// dropped.
fn match_results_to_bucket(testing_result: TestingResult, bucket: &Bucket) -> TestingResult {
    let TestingResult {
        bucket_id,
        test_destination,
        unfiltered_results,
    } = testing_result;

    let mut reported: HashMap<TestEntry, TestEntryResult> = HashMap::new();
    for entry_result in unfiltered_results {
        match reported.get_mut(&entry_result.test_entry) {
            Some(existing) => existing
                .test_run_results
                .extend(entry_result.test_run_results),
            None => {
                reported.insert(entry_result.test_entry.clone(), entry_result);
            }
        }
    }

    let matched: Vec<_> = bucket
        .test_entries
        .iter()
        .map(|entry| {
            reported.remove(entry).unwrap_or_else(|| {
                tracing::warn!(%bucket_id, test = %entry.test_name, "result is missing a test; treating it as lost");
                TestEntryResult::lost(entry.clone())
            })
        })
        .collect();

    for unexpected in reported.keys() {
        tracing::warn!(%bucket_id, test = %unexpected.test_name, "result has a test the bucket does not; dropping it");
    }

    log_assert!(
        matched.len() == bucket.test_entries.len(),
        %bucket_id,
        "matched results do not cover the bucket"
    );

    TestingResult {
        bucket_id,
        test_destination,
        unfiltered_results: matched,
    }
}
