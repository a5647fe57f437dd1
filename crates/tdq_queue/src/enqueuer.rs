use std::sync::Arc;

use tdq_utils::{
    id_generator::SharedIdGenerator,
    net_protocol::{models::TestEntryConfiguration, queue::PrioritizedJob},
};

use crate::{
    balancing::EnqueueableBucketReceptor,
    splitting::{split_into_buckets, BucketSplitInfo, BucketSplitter, SplitError},
};

/// Turns scheduled tests into buckets and hands them to the queue.
pub struct TestsEnqueuer {
    bucket_split_info: BucketSplitInfo,
    id_generator: SharedIdGenerator,
    receptor: Arc<dyn EnqueueableBucketReceptor>,
}

impl TestsEnqueuer {
    pub fn new(
        bucket_split_info: BucketSplitInfo,
        id_generator: SharedIdGenerator,
        receptor: Arc<dyn EnqueueableBucketReceptor>,
    ) -> Self {
        Self {
            bucket_split_info,
            id_generator,
            receptor,
        }
    }

    /// Returns how many buckets were enqueued. Nothing is enqueued if splitting fails.
    pub fn enqueue(
        &self,
        splitter: &dyn BucketSplitter,
        test_entry_configurations: Vec<TestEntryConfiguration>,
        prioritized_job: PrioritizedJob,
    ) -> Result<usize, SplitError> {
        let buckets = split_into_buckets(
            splitter,
            test_entry_configurations,
            &self.bucket_split_info,
            &self.id_generator,
        )?;
        let bucket_count = buckets.len();

        tracing::info!(
            job_id = %prioritized_job.job_id,
            bucket_count,
            "enqueueing tests"
        );
        self.receptor.enqueue(buckets, prioritized_job);

        Ok(bucket_count)
    }
}
