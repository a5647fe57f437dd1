//! Who ran which test, and how it went.
//!
//! A test's identity is scoped to its bucket, destination and build: the same test scheduled in
//! two jobs has two unrelated histories. Histories are never cleared while their job lives.

use std::collections::{BTreeSet, HashMap};

use tdq_utils::net_protocol::{
    ids::{BucketId, WorkerId},
    models::{Bucket, BuildArtifacts, TestDestination, TestEntry, TestingResult},
};

use crate::bucket_queue::EnqueuedBucket;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestEntryHistoryId {
    pub test_entry: TestEntry,
    pub test_destination: TestDestination,
    pub build_artifacts: BuildArtifacts,
    pub bucket_id: BucketId,
}

impl TestEntryHistoryId {
    pub fn new(test_entry: &TestEntry, bucket: &Bucket) -> Self {
        Self {
            test_entry: test_entry.clone(),
            test_destination: bucket.test_destination().clone(),
            build_artifacts: bucket.build_artifacts().clone(),
            bucket_id: bucket.bucket_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestAttempt {
    pub worker_id: WorkerId,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestEntryHistory {
    attempts: Vec<TestAttempt>,
}

impl TestEntryHistory {
    pub fn attempts(&self) -> &[TestAttempt] {
        &self.attempts
    }

    pub fn number_of_attempts(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_failing_on_worker(&self, worker_id: &WorkerId) -> bool {
        self.attempts
            .iter()
            .any(|attempt| !attempt.succeeded && &attempt.worker_id == worker_id)
    }

    pub fn failing_worker_ids(&self) -> BTreeSet<&WorkerId> {
        self.attempts
            .iter()
            .filter(|attempt| !attempt.succeeded)
            .map(|attempt| &attempt.worker_id)
            .collect()
    }
}

/// Outcome of recording a bucket's result in the history.
#[derive(Debug)]
pub struct TestHistoryAcceptResult {
    /// The result restricted to entries whose outcome is final.
    pub testing_result: TestingResult,
    /// Entries that failed and have retries left.
    pub entries_to_retry: Vec<TestEntry>,
}

#[derive(Debug, Default)]
pub struct TestHistoryTracker {
    histories: HashMap<TestEntryHistoryId, TestEntryHistory>,
}

impl TestHistoryTracker {
    pub fn history(&self, id: &TestEntryHistoryId) -> Option<&TestEntryHistory> {
        self.histories.get(id)
    }

    fn bucket_failed_on_worker(&self, bucket: &Bucket, worker_id: &WorkerId) -> bool {
        bucket.test_entries.iter().any(|entry| {
            self.histories
                .get(&TestEntryHistoryId::new(entry, bucket))
                .map_or(false, |history| history.is_failing_on_worker(worker_id))
        })
    }

    /// Picks which of the `enqueued` buckets, in FIFO order, `worker_id` should get.
    ///
    /// A bucket that already failed on this worker is passed over as long as some alive worker
    /// has not failed it yet; once every alive worker has, the oldest such bucket is handed out
    /// anyway.
    pub fn bucket_to_dequeue<'a>(
        &self,
        worker_id: &WorkerId,
        enqueued: impl IntoIterator<Item = &'a EnqueuedBucket>,
        alive_worker_ids: &BTreeSet<WorkerId>,
    ) -> Option<usize> {
        enqueued.into_iter().position(|enqueued| {
            let bucket = &enqueued.bucket;
            !self.bucket_failed_on_worker(bucket, worker_id)
                || alive_worker_ids
                    .iter()
                    .all(|alive| self.bucket_failed_on_worker(bucket, alive))
        })
    }

    /// Records every entry of `testing_result` as an attempt by `worker_id`, and decides which
    /// entries get retried. `testing_result` must have exactly one result per bucket entry.
    pub fn accept(
        &mut self,
        testing_result: TestingResult,
        bucket: &Bucket,
        worker_id: &WorkerId,
    ) -> TestHistoryAcceptResult {
        let TestingResult {
            bucket_id,
            test_destination,
            unfiltered_results,
        } = testing_result;
        let allowed_attempts = bucket.number_of_retries() as usize + 1;

        let mut final_results = Vec::with_capacity(unfiltered_results.len());
        let mut entries_to_retry = Vec::new();

        for entry_result in unfiltered_results {
            let succeeded = entry_result.succeeded();
            let history = self
                .histories
                .entry(TestEntryHistoryId::new(&entry_result.test_entry, bucket))
                .or_default();
            history.attempts.push(TestAttempt {
                worker_id: worker_id.clone(),
                succeeded,
            });

            if succeeded || history.number_of_attempts() >= allowed_attempts {
                final_results.push(entry_result);
            } else {
                tracing::debug!(
                    test = %entry_result.test_entry.test_name,
                    %worker_id,
                    attempts = history.number_of_attempts(),
                    "test failed and will be retried"
                );
                entries_to_retry.push(entry_result.test_entry);
            }
        }

        TestHistoryAcceptResult {
            testing_result: TestingResult {
                bucket_id,
                test_destination,
                unfiltered_results: final_results,
            },
            entries_to_retry,
        }
    }
}
