//! Per-worker health, and the buckets each worker is believed to be processing.
//!
//! Silence is computed lazily: a worker is silent if, at the moment anyone asks, its last
//! report is older than the maximum not-reporting duration. No timers run per worker.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tdq_utils::{
    clock::{Clock, SharedClock},
    net_protocol::ids::{BucketId, WorkerId},
    time::EpochMillis,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlivenessStatus {
    NotRegistered,
    Alive,
    /// Has not reported since the given time.
    Silent { since: EpochMillis },
    /// Terminal.
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAliveness {
    pub status: AlivenessStatus,
    /// Always empty for blocked and unregistered workers.
    pub bucket_ids_being_processed: BTreeSet<BucketId>,
}

impl WorkerAliveness {
    pub fn is_alive(&self) -> bool {
        self.status == AlivenessStatus::Alive
    }
}

#[derive(Debug, Clone, Copy)]
struct Processing {
    /// When the bucket was last handed to, or reported by, the worker.
    since: EpochMillis,
    /// Retry buckets keep their bucket id, so one worker may hold the same id more than once.
    holds: usize,
}

#[derive(Debug, Default)]
struct WorkerRecord {
    last_report: Option<EpochMillis>,
    blocked: bool,
    processing: HashMap<BucketId, Processing>,
}

pub struct WorkerAlivenessTracker {
    clock: SharedClock,
    maximum_not_reporting_duration: Duration,
    /// Two layers, so that different workers can be updated concurrently:
    ///
    /// RwLock => Map<WorkerId, // layer 1, written only when a worker is first seen
    ///     Mutex => WorkerRecord> // layer 2
    workers: RwLock<HashMap<WorkerId, Mutex<WorkerRecord>>>,
}

impl std::fmt::Debug for WorkerAlivenessTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerAlivenessTracker")
            .field(
                "maximum_not_reporting_duration",
                &self.maximum_not_reporting_duration,
            )
            .finish_non_exhaustive()
    }
}

impl WorkerAlivenessTracker {
    /// `known_worker_ids` are reported as not registered until they register.
    pub fn new(
        clock: SharedClock,
        maximum_not_reporting_duration: Duration,
        known_worker_ids: impl IntoIterator<Item = WorkerId>,
    ) -> Self {
        let workers = known_worker_ids
            .into_iter()
            .map(|id| (id, Mutex::new(WorkerRecord::default())))
            .collect();
        Self {
            clock,
            maximum_not_reporting_duration,
            workers: RwLock::new(workers),
        }
    }

    pub fn maximum_not_reporting_duration(&self) -> Duration {
        self.maximum_not_reporting_duration
    }

    fn with_worker<R>(&self, worker_id: &WorkerId, f: impl FnOnce(&mut WorkerRecord) -> R) -> R {
        {
            let workers = self.workers.read();
            if let Some(record) = workers.get(worker_id) {
                return f(&mut record.lock());
            }
        }
        let mut workers = self.workers.write();
        let record = workers.entry(worker_id.clone()).or_default();
        f(record.get_mut())
    }

    pub fn did_register_worker(&self, worker_id: &WorkerId) {
        let now = self.clock.now();
        self.with_worker(worker_id, |record| record.last_report = Some(now));
        tracing::debug!(%worker_id, "worker registered");
    }

    /// A worker's report of what it is processing. Replaces the tracked set.
    pub fn set_bucket_ids_being_processed(
        &self,
        bucket_ids: impl IntoIterator<Item = BucketId>,
        worker_id: &WorkerId,
    ) {
        let now = self.clock.now();
        self.reconcile_bucket_ids_being_processed(bucket_ids, worker_id, now)
    }

    /// Like [Self::set_bucket_ids_being_processed], for a report that was requested at
    /// `requested_at`. Buckets dequeued at or after that time are kept, since the worker
    /// could not have known about them when it answered.
    pub fn reconcile_bucket_ids_being_processed(
        &self,
        bucket_ids: impl IntoIterator<Item = BucketId>,
        worker_id: &WorkerId,
        requested_at: EpochMillis,
    ) {
        let now = self.clock.now();
        let reported: HashSet<BucketId> = bucket_ids.into_iter().collect();
        self.with_worker(worker_id, |record| {
            if record.blocked {
                return;
            }
            record.last_report = Some(now);
            record.processing.retain(|id, processing| {
                reported.contains(id) || processing.since >= requested_at
            });
            for id in reported {
                record
                    .processing
                    .entry(id)
                    .or_insert(Processing {
                        since: now,
                        holds: 1,
                    });
            }
        });
    }

    pub fn did_dequeue_bucket(&self, bucket_id: &BucketId, worker_id: &WorkerId) {
        let now = self.clock.now();
        self.with_worker(worker_id, |record| {
            record.last_report = Some(now);
            let processing = record
                .processing
                .entry(bucket_id.clone())
                .or_insert(Processing {
                    since: now,
                    holds: 0,
                });
            processing.since = now;
            processing.holds += 1;
        });
    }

    pub fn did_accept_bucket_result(&self, bucket_id: &BucketId, worker_id: &WorkerId) {
        let now = self.clock.now();
        self.with_worker(worker_id, |record| {
            record.last_report = Some(now);
            if let Some(processing) = record.processing.get_mut(bucket_id) {
                processing.holds = processing.holds.saturating_sub(1);
                if processing.holds == 0 {
                    record.processing.remove(bucket_id);
                }
            }
        });
    }

    /// Blocks the worker for good. Its buckets will be found stuck by the next sweep.
    pub fn block_worker(&self, worker_id: &WorkerId) {
        self.with_worker(worker_id, |record| {
            record.blocked = true;
            record.processing.clear();
        });
        tracing::warn!(%worker_id, "worker blocked");
    }

    fn aliveness_of(&self, record: &WorkerRecord, now: EpochMillis) -> WorkerAliveness {
        let status = if record.blocked {
            AlivenessStatus::Blocked
        } else {
            match record.last_report {
                None => AlivenessStatus::NotRegistered,
                Some(last) => {
                    if now.saturating_duration_since(last) > self.maximum_not_reporting_duration {
                        AlivenessStatus::Silent { since: last }
                    } else {
                        AlivenessStatus::Alive
                    }
                }
            }
        };
        let bucket_ids_being_processed = match status {
            AlivenessStatus::Blocked | AlivenessStatus::NotRegistered => BTreeSet::new(),
            AlivenessStatus::Alive | AlivenessStatus::Silent { .. } => {
                record.processing.keys().cloned().collect()
            }
        };
        WorkerAliveness {
            status,
            bucket_ids_being_processed,
        }
    }

    pub fn aliveness_for_worker(&self, worker_id: &WorkerId) -> WorkerAliveness {
        let now = self.clock.now();
        let workers = self.workers.read();
        match workers.get(worker_id) {
            Some(record) => self.aliveness_of(&record.lock(), now),
            None => WorkerAliveness {
                status: AlivenessStatus::NotRegistered,
                bucket_ids_being_processed: BTreeSet::new(),
            },
        }
    }

    pub fn worker_aliveness(&self) -> BTreeMap<WorkerId, WorkerAliveness> {
        let now = self.clock.now();
        let workers = self.workers.read();
        workers
            .iter()
            .map(|(id, record)| (id.clone(), self.aliveness_of(&record.lock(), now)))
            .collect()
    }

    pub fn alive_worker_ids(&self) -> BTreeSet<WorkerId> {
        self.worker_aliveness()
            .into_iter()
            .filter(|(_, aliveness)| aliveness.is_alive())
            .map(|(id, _)| id)
            .collect()
    }

    pub fn has_any_alive_worker(&self) -> bool {
        let now = self.clock.now();
        let workers = self.workers.read();
        workers
            .values()
            .any(|record| self.aliveness_of(&record.lock(), now).is_alive())
    }
}

#[cfg(test)]
mod test {
    use std::{collections::BTreeSet, sync::Arc, time::Duration};

    use tdq_utils::{
        clock::{Clock, FakeClock},
        net_protocol::ids::{BucketId, WorkerId},
        time::EpochMillis,
    };

    use super::{AlivenessStatus, WorkerAlivenessTracker};

    const MAX_SILENCE: Duration = Duration::from_secs(50);

    fn tracker(known: &[&str]) -> (WorkerAlivenessTracker, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::new(EpochMillis::from_millis(100_000)));
        let tracker = WorkerAlivenessTracker::new(
            clock.clone(),
            MAX_SILENCE,
            known.iter().map(|id| WorkerId::from(*id)),
        );
        (tracker, clock)
    }

    fn ids(ids: &[&str]) -> BTreeSet<BucketId> {
        ids.iter().map(|id| BucketId::from(*id)).collect()
    }

    #[test]
    fn known_workers_start_not_registered() {
        let (tracker, _) = tracker(&["w1", "w2"]);
        let snapshot = tracker.worker_aliveness();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot
            .values()
            .all(|a| a.status == AlivenessStatus::NotRegistered));
        assert!(!tracker.has_any_alive_worker());
    }

    #[test]
    fn unknown_worker_is_not_registered() {
        let (tracker, _) = tracker(&[]);
        assert_eq!(
            tracker.aliveness_for_worker(&WorkerId::from("ghost")).status,
            AlivenessStatus::NotRegistered
        );
    }

    #[test]
    fn registered_worker_is_alive_until_silent() {
        let (tracker, clock) = tracker(&["w1"]);
        let w1 = WorkerId::from("w1");
        tracker.did_register_worker(&w1);
        let registered_at = clock.now();

        clock.advance(MAX_SILENCE);
        assert_eq!(tracker.aliveness_for_worker(&w1).status, AlivenessStatus::Alive);

        clock.advance(Duration::from_millis(1));
        assert_eq!(
            tracker.aliveness_for_worker(&w1).status,
            AlivenessStatus::Silent {
                since: registered_at
            }
        );
        assert!(tracker.alive_worker_ids().is_empty());
    }

    #[test]
    fn dequeue_refreshes_and_tracks_bucket() {
        let (tracker, clock) = tracker(&["w1"]);
        let w1 = WorkerId::from("w1");
        tracker.did_register_worker(&w1);

        clock.advance(Duration::from_secs(40));
        tracker.did_dequeue_bucket(&BucketId::from("b1"), &w1);
        clock.advance(Duration::from_secs(40));

        let aliveness = tracker.aliveness_for_worker(&w1);
        assert!(aliveness.is_alive());
        assert_eq!(aliveness.bucket_ids_being_processed, ids(&["b1"]));
    }

    #[test]
    fn silent_worker_comes_back_on_report() {
        let (tracker, clock) = tracker(&["w1"]);
        let w1 = WorkerId::from("w1");
        tracker.did_register_worker(&w1);
        clock.advance(MAX_SILENCE * 2);
        assert!(!tracker.aliveness_for_worker(&w1).is_alive());

        tracker.set_bucket_ids_being_processed(vec![], &w1);
        assert!(tracker.aliveness_for_worker(&w1).is_alive());
    }

    #[test]
    fn report_replaces_processing_set() {
        let (tracker, clock) = tracker(&["w1"]);
        let w1 = WorkerId::from("w1");
        tracker.did_register_worker(&w1);
        tracker.did_dequeue_bucket(&BucketId::from("b1"), &w1);
        tracker.did_dequeue_bucket(&BucketId::from("b2"), &w1);
        clock.advance(Duration::from_millis(1));

        tracker.set_bucket_ids_being_processed(vec![BucketId::from("b2"), BucketId::from("b3")], &w1);

        assert_eq!(
            tracker.aliveness_for_worker(&w1).bucket_ids_being_processed,
            ids(&["b2", "b3"])
        );
    }

    #[test]
    fn reconcile_keeps_buckets_dequeued_after_request() {
        let (tracker, clock) = tracker(&["w1"]);
        let w1 = WorkerId::from("w1");
        tracker.did_register_worker(&w1);
        tracker.did_dequeue_bucket(&BucketId::from("old"), &w1);

        clock.advance(Duration::from_secs(1));
        let requested_at = clock.now();
        clock.advance(Duration::from_secs(1));
        tracker.did_dequeue_bucket(&BucketId::from("new"), &w1);

        // The worker answered before it got "new", and has since finished "old".
        tracker.reconcile_bucket_ids_being_processed(vec![], &w1, requested_at);

        assert_eq!(
            tracker.aliveness_for_worker(&w1).bucket_ids_being_processed,
            ids(&["new"])
        );
    }

    #[test]
    fn reconcile_keeps_bucket_dequeued_at_request_time() {
        let (tracker, clock) = tracker(&["w1"]);
        let w1 = WorkerId::from("w1");
        tracker.did_register_worker(&w1);

        let requested_at = clock.now();
        tracker.did_dequeue_bucket(&BucketId::from("b1"), &w1);
        tracker.reconcile_bucket_ids_being_processed(vec![], &w1, requested_at);

        assert_eq!(
            tracker.aliveness_for_worker(&w1).bucket_ids_being_processed,
            ids(&["b1"])
        );
    }

    #[test]
    fn blocking_is_terminal_and_clears_buckets() {
        let (tracker, _) = tracker(&["w1"]);
        let w1 = WorkerId::from("w1");
        tracker.did_register_worker(&w1);
        tracker.did_dequeue_bucket(&BucketId::from("b1"), &w1);

        tracker.block_worker(&w1);
        let aliveness = tracker.aliveness_for_worker(&w1);
        assert_eq!(aliveness.status, AlivenessStatus::Blocked);
        assert!(aliveness.bucket_ids_being_processed.is_empty());

        // Reports and registrations do not unblock.
        tracker.set_bucket_ids_being_processed(vec![BucketId::from("b1")], &w1);
        tracker.did_register_worker(&w1);
        let aliveness = tracker.aliveness_for_worker(&w1);
        assert_eq!(aliveness.status, AlivenessStatus::Blocked);
        assert!(aliveness.bucket_ids_being_processed.is_empty());
    }

    #[test]
    fn blocking_unregistered_worker() {
        let (tracker, _) = tracker(&["w1"]);
        tracker.block_worker(&WorkerId::from("w1"));
        assert_eq!(
            tracker.aliveness_for_worker(&WorkerId::from("w1")).status,
            AlivenessStatus::Blocked
        );
    }

    #[test]
    fn accepting_releases_one_hold() {
        let (tracker, _) = tracker(&["w1"]);
        let w1 = WorkerId::from("w1");
        let b1 = BucketId::from("b1");
        tracker.did_register_worker(&w1);
        tracker.did_dequeue_bucket(&b1, &w1);
        tracker.did_dequeue_bucket(&b1, &w1);

        tracker.did_accept_bucket_result(&b1, &w1);
        assert_eq!(
            tracker.aliveness_for_worker(&w1).bucket_ids_being_processed,
            ids(&["b1"])
        );

        tracker.did_accept_bucket_result(&b1, &w1);
        assert!(tracker
            .aliveness_for_worker(&w1)
            .bucket_ids_being_processed
            .is_empty());
    }

    #[test]
    fn alive_worker_ids_only_lists_alive() {
        let (tracker, _) = tracker(&["w1", "w2", "w3"]);
        tracker.did_register_worker(&WorkerId::from("w1"));
        tracker.did_register_worker(&WorkerId::from("w2"));
        tracker.block_worker(&WorkerId::from("w2"));

        let alive: Vec<_> = tracker.alive_worker_ids().into_iter().collect();
        assert_eq!(alive, vec![WorkerId::from("w1")]);
        assert!(tracker.has_any_alive_worker());
    }

    #[test]
    fn concurrent_updates_to_different_workers() {
        let (tracker, _) = tracker(&[]);
        let tracker = Arc::new(tracker);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    let worker = WorkerId::new(format!("w{i}"));
                    tracker.did_register_worker(&worker);
                    for b in 0..50 {
                        tracker.did_dequeue_bucket(&BucketId::new(format!("b{i}-{b}")), &worker);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = tracker.worker_aliveness();
        assert_eq!(snapshot.len(), 8);
        assert!(snapshot
            .values()
            .all(|a| a.is_alive() && a.bucket_ids_being_processed.len() == 50));
    }
}
