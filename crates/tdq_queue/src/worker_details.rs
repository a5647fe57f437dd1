//! The fleet: which workers may join, how they are configured, and where they can be reached.

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
};

use parking_lot::RwLock;
use tdq_utils::{
    net_protocol::{ids::WorkerId, queue::WorkerConfiguration},
    payload_signature::PayloadSignature,
};
use thiserror::Error;

/// Static per-worker settings, fixed at queue startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub number_of_parallel_buckets: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            number_of_parallel_buckets: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerConfigurationError {
    #[error("worker {0} is configured more than once")]
    DuplicateWorker(WorkerId),
    #[error("worker {0} must process at least one bucket at a time")]
    NoParallelBuckets(WorkerId),
}

/// Read-only after startup.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfigurations {
    workers: BTreeMap<WorkerId, WorkerSettings>,
}

impl WorkerConfigurations {
    pub fn new(
        workers: impl IntoIterator<Item = (WorkerId, WorkerSettings)>,
    ) -> Result<Self, WorkerConfigurationError> {
        let mut configured = BTreeMap::new();
        for (worker_id, settings) in workers {
            if settings.number_of_parallel_buckets == 0 {
                return Err(WorkerConfigurationError::NoParallelBuckets(worker_id));
            }
            if configured.contains_key(&worker_id) {
                return Err(WorkerConfigurationError::DuplicateWorker(worker_id));
            }
            configured.insert(worker_id, settings);
        }
        Ok(Self {
            workers: configured,
        })
    }

    pub fn worker_ids(&self) -> impl Iterator<Item = &WorkerId> {
        self.workers.keys()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn contains(&self, worker_id: &WorkerId) -> bool {
        self.workers.contains_key(worker_id)
    }

    /// What a registering worker is told.
    pub fn worker_configuration(
        &self,
        worker_id: &WorkerId,
        payload_signature: PayloadSignature,
    ) -> Option<WorkerConfiguration> {
        self.workers
            .get(worker_id)
            .map(|settings| WorkerConfiguration {
                number_of_parallel_buckets: settings.number_of_parallel_buckets,
                payload_signature,
            })
    }
}

/// Status endpoints of registered workers.
#[derive(Debug, Default)]
pub struct WorkerDetailsHolder {
    addresses: RwLock<HashMap<WorkerId, SocketAddr>>,
}

impl WorkerDetailsHolder {
    /// A worker registering again replaces its old address.
    pub fn did_register(&self, worker_id: WorkerId, worker_rest_address: SocketAddr) {
        self.addresses.write().insert(worker_id, worker_rest_address);
    }

    pub fn address(&self, worker_id: &WorkerId) -> Option<SocketAddr> {
        self.addresses.read().get(worker_id).copied()
    }

    pub fn known_addresses(&self) -> Vec<(WorkerId, SocketAddr)> {
        let mut addresses: Vec<_> = self
            .addresses
            .read()
            .iter()
            .map(|(id, addr)| (id.clone(), *addr))
            .collect();
        addresses.sort();
        addresses
    }
}

#[cfg(test)]
mod test {
    use tdq_utils::{net_protocol::ids::WorkerId, payload_signature::PayloadSignature};

    use super::{
        WorkerConfigurationError, WorkerConfigurations, WorkerDetailsHolder, WorkerSettings,
    };

    #[test]
    fn duplicate_workers_are_rejected() {
        let result = WorkerConfigurations::new([
            (WorkerId::from("w1"), WorkerSettings::default()),
            (WorkerId::from("w1"), WorkerSettings::default()),
        ]);
        assert_eq!(
            result.unwrap_err(),
            WorkerConfigurationError::DuplicateWorker(WorkerId::from("w1"))
        );
    }

    #[test]
    fn zero_parallel_buckets_is_rejected() {
        let result = WorkerConfigurations::new([(
            WorkerId::from("w1"),
            WorkerSettings {
                number_of_parallel_buckets: 0,
            },
        )]);
        assert!(matches!(
            result,
            Err(WorkerConfigurationError::NoParallelBuckets(_))
        ));
    }

    #[test]
    fn configuration_for_known_worker_only() {
        let configs = WorkerConfigurations::new([(
            WorkerId::from("w1"),
            WorkerSettings {
                number_of_parallel_buckets: 3,
            },
        )])
        .unwrap();
        let signature = PayloadSignature::new_random();

        let config = configs
            .worker_configuration(&WorkerId::from("w1"), signature)
            .unwrap();
        assert_eq!(config.number_of_parallel_buckets, 3);
        assert_eq!(config.payload_signature, signature);
        assert!(configs
            .worker_configuration(&WorkerId::from("w2"), signature)
            .is_none());
    }

    #[test]
    fn reregistration_replaces_address() {
        let holder = WorkerDetailsHolder::default();
        holder.did_register(WorkerId::from("w1"), "127.0.0.1:1000".parse().unwrap());
        holder.did_register(WorkerId::from("w1"), "127.0.0.1:2000".parse().unwrap());

        assert_eq!(
            holder.known_addresses(),
            vec![(WorkerId::from("w1"), "127.0.0.1:2000".parse().unwrap())]
        );
    }
}
