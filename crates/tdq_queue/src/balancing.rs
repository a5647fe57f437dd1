//! Many jobs, one fleet.
//!
//! Jobs are ordered by job group priority, then job priority, then submission order. Dequeues
//! rotate through the jobs starting after the last one served; a job may be served up to its
//! weight in a row before the rotation moves on, where the weight grows with how much higher
//! its priority is than the lowest priority of any job present. Equal priorities alternate.

use std::{
    cmp::Ordering,
    collections::BTreeSet,
    sync::{atomic::AtomicU64, Arc},
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tdq_utils::{
    atomic::ORDERING,
    net_protocol::{
        ids::{BucketId, JobGroupId, JobId, RequestId, WorkerId},
        models::{Bucket, TestingResult},
        queue::{JobResults, JobState, PrioritizedJob, RequestError, RunningQueueState},
    },
};
use thiserror::Error;

use crate::bucket_queue::{
    may_dequeue, AcceptanceError, BucketQueue, BucketQueueContext, DequeueResult, StuckBucket,
};

/// What workers are told once there is nothing left to do in any job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NothingToDequeueBehavior {
    #[default]
    WorkersTerminateWhenQueueIsDepleted,
    WorkersStayAliveWhenQueueIsDepleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("job {job_id} is unknown to the queue")]
pub struct UnknownJobError {
    pub job_id: JobId,
}

impl From<UnknownJobError> for RequestError {
    fn from(err: UnknownJobError) -> Self {
        RequestError::UnknownJob { job_id: err.job_id }
    }
}

/// Where buckets produced by the enqueuer go.
pub trait EnqueueableBucketReceptor: Send + Sync {
    fn enqueue(&self, buckets: Vec<Bucket>, prioritized_job: PrioritizedJob);
}

/// Each job's priority above the lowest present buys one more consecutive dequeue per step.
const PRIORITY_STEP_PER_WEIGHT: u16 = 250;

struct JobEntry {
    prioritized_job: PrioritizedJob,
    submission: u64,
    queue: Arc<BucketQueue>,
}

impl JobEntry {
    fn job_id(&self) -> &JobId {
        &self.prioritized_job.job_id
    }

    /// Higher priorities, then earlier submissions, come first.
    fn cmp_order(&self, other: &JobEntry) -> Ordering {
        let (a, b) = (&self.prioritized_job, &other.prioritized_job);
        b.job_group_priority
            .cmp(&a.job_group_priority)
            .then(b.job_priority.cmp(&a.job_priority))
            .then(self.submission.cmp(&other.submission))
    }
}

#[derive(Debug, Default)]
struct Rotation {
    last_served: Option<JobId>,
    streak: usize,
}

/// A job's queue, captured outside the job map lock.
struct QueueSnapshot {
    job_id: JobId,
    weight: usize,
    queue: Arc<BucketQueue>,
}

pub struct BalancingBucketQueue {
    ctx: BucketQueueContext,
    nothing_to_dequeue_behavior: NothingToDequeueBehavior,
    /// Kept sorted by [JobEntry::cmp_order]. Bucket queues are only ever called after the
    /// snapshot is taken and this lock released, except for enqueues.
    jobs: RwLock<Vec<JobEntry>>,
    rotation: Mutex<Rotation>,
    next_submission: AtomicU64,
}

static_assertions::assert_impl_all!(BalancingBucketQueue: Send, Sync);

impl BalancingBucketQueue {
    pub fn new(ctx: BucketQueueContext, nothing_to_dequeue_behavior: NothingToDequeueBehavior) -> Self {
        Self {
            ctx,
            nothing_to_dequeue_behavior,
            jobs: Default::default(),
            rotation: Default::default(),
            next_submission: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> Vec<QueueSnapshot> {
        let jobs = self.jobs.read();
        let lowest = jobs
            .iter()
            .map(|job| job.prioritized_job.job_priority)
            .min()
            .map(|p| p.value())
            .unwrap_or_default();
        jobs.iter()
            .map(|job| QueueSnapshot {
                job_id: job.job_id().clone(),
                weight: 1
                    + ((job.prioritized_job.job_priority.value() - lowest) / PRIORITY_STEP_PER_WEIGHT)
                        as usize,
                queue: Arc::clone(&job.queue),
            })
            .collect()
    }

    fn queue_for_job(&self, job_id: &JobId) -> Result<Arc<BucketQueue>, UnknownJobError> {
        let jobs = self.jobs.read();
        jobs.iter()
            .find(|job| job.job_id() == job_id)
            .map(|job| Arc::clone(&job.queue))
            .ok_or_else(|| UnknownJobError {
                job_id: job_id.clone(),
            })
    }

    /// Index of the job the next dequeue should try first.
    fn rotation_start(&self, snapshot: &[QueueSnapshot]) -> usize {
        let rotation = self.rotation.lock();
        let last = rotation
            .last_served
            .as_ref()
            .and_then(|last| snapshot.iter().position(|job| &job.job_id == last));
        match last {
            Some(position) if rotation.streak < snapshot[position].weight => position,
            Some(position) => (position + 1) % snapshot.len(),
            None => 0,
        }
    }

    fn record_served(&self, job_id: &JobId) {
        let mut rotation = self.rotation.lock();
        if rotation.last_served.as_ref() == Some(job_id) {
            rotation.streak += 1;
        } else {
            rotation.last_served = Some(job_id.clone());
            rotation.streak = 1;
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub fn dequeue_bucket(&self, request_id: RequestId, worker_id: WorkerId) -> DequeueResult {
        if !may_dequeue(&self.ctx.worker_aliveness.aliveness_for_worker(&worker_id)) {
            return DequeueResult::WorkerIsNotAlive;
        }

        let snapshot = self.snapshot();

        for job in snapshot.iter() {
            if let Some(previous) = job.queue.previously_dequeued_bucket(&request_id, &worker_id) {
                return DequeueResult::DequeuedBucket(previous);
            }
        }

        let mut check_again_after: Option<Duration> = None;
        if !snapshot.is_empty() {
            let start = self.rotation_start(&snapshot);
            for offset in 0..snapshot.len() {
                let job = &snapshot[(start + offset) % snapshot.len()];
                match job.queue.dequeue_bucket(request_id.clone(), worker_id.clone()) {
                    DequeueResult::DequeuedBucket(dequeued) => {
                        self.record_served(&job.job_id);
                        tracing::debug!(
                            job_id = %job.job_id,
                            bucket_id = %dequeued.bucket().bucket_id,
                            %worker_id,
                            "dequeued bucket"
                        );
                        return DequeueResult::DequeuedBucket(dequeued);
                    }
                    DequeueResult::WorkerIsNotAlive => return DequeueResult::WorkerIsNotAlive,
                    DequeueResult::CheckAgainLater { after } => {
                        check_again_after =
                            Some(check_again_after.map_or(after, |current| current.min(after)));
                    }
                    DequeueResult::QueueIsEmpty => {}
                }
            }
        }

        match (check_again_after, self.nothing_to_dequeue_behavior) {
            (Some(after), _) => DequeueResult::CheckAgainLater { after },
            (None, NothingToDequeueBehavior::WorkersTerminateWhenQueueIsDepleted) => {
                DequeueResult::QueueIsEmpty
            }
            (None, NothingToDequeueBehavior::WorkersStayAliveWhenQueueIsDepleted) => {
                DequeueResult::CheckAgainLater {
                    after: self.ctx.check_again_interval,
                }
            }
        }
    }

    /// Accepts a result into whichever job the bucket belongs to. Buckets of deleted jobs are
    /// reported as [AcceptanceError::UnknownBucket].
    pub fn accept(
        &self,
        testing_result: TestingResult,
        request_id: RequestId,
        worker_id: WorkerId,
    ) -> Result<BucketId, AcceptanceError> {
        let bucket_id = testing_result.bucket_id.clone();
        let owner = self
            .snapshot()
            .into_iter()
            .find(|job| job.queue.contains_bucket(&bucket_id));

        match owner {
            Some(job) => job.queue.accept(testing_result, request_id, worker_id),
            None => Err(AcceptanceError::UnknownBucket { bucket_id }),
        }
    }

    /// Sweeps every job for stuck buckets.
    pub fn reenqueue_stuck_buckets(&self) -> Vec<(JobId, StuckBucket)> {
        self.snapshot()
            .into_iter()
            .flat_map(|job| {
                let job_id = job.job_id;
                job.queue
                    .reenqueue_stuck_buckets()
                    .into_iter()
                    .map(move |stuck| (job_id.clone(), stuck))
            })
            .collect()
    }

    pub fn results(&self, job_id: &JobId) -> Result<JobResults, UnknownJobError> {
        let queue = self.queue_for_job(job_id)?;
        Ok(JobResults {
            job_id: job_id.clone(),
            testing_results: queue.results(),
        })
    }

    pub fn state(&self, job_id: &JobId) -> Result<JobState, UnknownJobError> {
        let queue = self.queue_for_job(job_id)?;
        Ok(JobState {
            job_id: job_id.clone(),
            queue_state: queue.running_queue_state().into(),
        })
    }

    /// Forgets the job. Its in-flight buckets are discarded.
    pub fn delete(&self, job_id: &JobId) -> Result<(), UnknownJobError> {
        let mut jobs = self.jobs.write();
        let index = jobs
            .iter()
            .position(|job| job.job_id() == job_id)
            .ok_or_else(|| UnknownJobError {
                job_id: job_id.clone(),
            })?;
        jobs.remove(index);
        tracing::info!(%job_id, "job deleted");
        Ok(())
    }

    pub fn ongoing_job_ids(&self) -> Vec<JobId> {
        self.jobs.read().iter().map(|job| job.job_id().clone()).collect()
    }

    pub fn ongoing_job_group_ids(&self) -> BTreeSet<JobGroupId> {
        self.jobs
            .read()
            .iter()
            .map(|job| job.prioritized_job.job_group_id.clone())
            .collect()
    }

    pub fn all_job_states(&self) -> Vec<JobState> {
        self.snapshot()
            .into_iter()
            .map(|job| JobState {
                queue_state: job.queue.running_queue_state().into(),
                job_id: job.job_id,
            })
            .collect()
    }

    pub fn running_queue_state(&self) -> RunningQueueState {
        self.snapshot()
            .iter()
            .map(|job| job.queue.running_queue_state())
            .fold(RunningQueueState::default(), |acc, state| acc + state)
    }

    pub fn is_depleted(&self) -> bool {
        self.running_queue_state().is_depleted()
    }
}

impl EnqueueableBucketReceptor for BalancingBucketQueue {
    /// Adds buckets to the job, creating the job on first sight. A known job keeps its
    /// original priorities.
    fn enqueue(&self, buckets: Vec<Bucket>, prioritized_job: PrioritizedJob) {
        let mut jobs = self.jobs.write();
        if let Some(job) = jobs
            .iter()
            .find(|job| job.job_id() == &prioritized_job.job_id)
        {
            job.queue.enqueue(buckets);
            return;
        }

        let queue = Arc::new(BucketQueue::new(self.ctx.clone()));
        queue.enqueue(buckets);
        let entry = JobEntry {
            prioritized_job,
            submission: self.next_submission.fetch_add(1, ORDERING),
            queue,
        };
        let at = jobs.partition_point(|job| job.cmp_order(&entry) != Ordering::Greater);
        tracing::info!(job_id = %entry.job_id(), "job created");
        jobs.insert(at, entry);
    }
}
