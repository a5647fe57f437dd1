pub mod client;
pub mod status;
pub mod worker;

pub use client::{BucketFetchResult, QueueClient, QueueClientError};
pub use worker::{
    BucketExecutor, EnvironmentHandle, ExecutionEnvironmentProvider, NoopEnvironmentProvider,
    Worker, WorkerConfig, WorkerError, WorkerExit,
};
