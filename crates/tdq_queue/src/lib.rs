//! The queue server core: buckets of tests, the workers that run them, and the jobs they
//! belong to.

pub mod balancing;
pub mod bucket_queue;
pub mod enqueuer;
pub mod pollers;
pub mod queue;
pub mod splitting;
pub mod test_history;
pub mod worker_aliveness;
pub mod worker_details;

pub use queue::{Queue, QueueConfig, QueueError, RejectedResultPolicy};
