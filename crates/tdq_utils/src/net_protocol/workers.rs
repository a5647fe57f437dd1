//! The status endpoint every worker serves, polled by the queue.

use serde_derive::{Deserialize, Serialize};

use super::ids::BucketId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatusRequest {
    CurrentlyProcessingBuckets,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentlyProcessingBucketsResponse {
    pub bucket_ids: Vec<BucketId>,
}
