//! The TOML run configuration of `tdq start`.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};

use anyhow::Context;
use serde_derive::Deserialize;
use tdq_queue::{
    balancing::NothingToDequeueBehavior,
    worker_details::{WorkerConfigurations, WorkerSettings},
    QueueConfig, RejectedResultPolicy,
};
use tdq_utils::net_protocol::ids::WorkerId;

const DEFAULT_PORT: u16 = 7070;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueRunConfiguration {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    #[serde(default = "default_check_again_secs")]
    pub check_again_secs: u64,
    /// Defaults to two missed aliveness polls, plus ten seconds.
    pub maximum_not_reporting_secs: Option<u64>,
    #[serde(default = "default_stuck_bucket_sweep_secs")]
    pub stuck_bucket_sweep_secs: u64,
    #[serde(default = "default_aliveness_poll_secs")]
    pub aliveness_poll_secs: u64,
    #[serde(default = "default_worker_status_timeout_secs")]
    pub worker_status_timeout_secs: u64,
    #[serde(default)]
    pub workers_stay_alive_when_depleted: bool,
    #[serde(default)]
    pub rejected_results: RejectedResults,
    /// Defaults to the number of workers.
    pub bucket_split_workers: Option<usize>,
    pub workers: Vec<WorkerEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerEntry {
    pub id: String,
    #[serde(default = "default_parallel_buckets")]
    pub parallel_buckets: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectedResults {
    Reject,
    #[default]
    BlockWorker,
}

fn default_bind() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT)
}

fn default_check_again_secs() -> u64 {
    tdq_queue::queue::DEFAULT_CHECK_AGAIN_INTERVAL.as_secs()
}

fn default_stuck_bucket_sweep_secs() -> u64 {
    tdq_queue::queue::DEFAULT_STUCK_BUCKET_SWEEP_INTERVAL.as_secs()
}

fn default_aliveness_poll_secs() -> u64 {
    tdq_queue::queue::DEFAULT_ALIVENESS_POLL_INTERVAL.as_secs()
}

fn default_worker_status_timeout_secs() -> u64 {
    tdq_queue::queue::DEFAULT_WORKER_STATUS_TIMEOUT.as_secs()
}

fn default_parallel_buckets() -> u32 {
    1
}

impl QueueRunConfiguration {
    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(contents)?;
        anyhow::ensure!(
            !config.workers.is_empty(),
            "the run configuration names no workers"
        );
        anyhow::ensure!(
            config.stuck_bucket_sweep_secs > 0,
            "stuck_bucket_sweep_secs must be greater than zero"
        );
        anyhow::ensure!(
            config.aliveness_poll_secs > 0,
            "aliveness_poll_secs must be greater than zero"
        );
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("could not read run configuration {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("invalid run configuration {}", path.display()))
    }

    pub fn maximum_not_reporting_duration(&self) -> Duration {
        match self.maximum_not_reporting_secs {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_secs(2 * self.aliveness_poll_secs + 10),
        }
    }

    pub fn into_queue_config(self) -> anyhow::Result<QueueConfig> {
        let workers = WorkerConfigurations::new(self.workers.iter().map(|worker| {
            (
                WorkerId::new(worker.id.as_str()),
                WorkerSettings {
                    number_of_parallel_buckets: worker.parallel_buckets,
                },
            )
        }))?;

        let mut config = QueueConfig::new(workers);
        config.bind_addr = self.bind;
        config.check_again_interval = Duration::from_secs(self.check_again_secs);
        config.maximum_not_reporting_duration = self.maximum_not_reporting_duration();
        config.stuck_bucket_sweep_interval = Duration::from_secs(self.stuck_bucket_sweep_secs);
        config.aliveness_poll_interval = Duration::from_secs(self.aliveness_poll_secs);
        config.worker_status_timeout = Duration::from_secs(self.worker_status_timeout_secs);
        config.nothing_to_dequeue_behavior = if self.workers_stay_alive_when_depleted {
            NothingToDequeueBehavior::WorkersStayAliveWhenQueueIsDepleted
        } else {
            NothingToDequeueBehavior::WorkersTerminateWhenQueueIsDepleted
        };
        config.rejected_result_policy = match self.rejected_results {
            RejectedResults::Reject => RejectedResultPolicy::Reject,
            RejectedResults::BlockWorker => RejectedResultPolicy::BlockWorker,
        };
        config.bucket_split_info = self
            .bucket_split_workers
            .map(tdq_queue::splitting::BucketSplitInfo::new);

        Ok(config)
    }
}
