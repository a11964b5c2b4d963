//! Worker aliveness tracking.
//!
//! Workers move through `not_registered -> alive -> silent -> lost` driven by
//! registration, heartbeats and a periodic sweep. Blocking is an orthogonal
//! flag set by operators.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use testfleet_config::AlivenessPolicy;
use testfleet_core::{AlivenessStatus, BucketId, WorkerAliveness, WorkerConfiguration, WorkerId};
use tracing::{info, warn};

use crate::QueueError;

/// Whether a worker may be handed a bucket right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    NotRegistered,
    Silent,
    Lost,
    Blocked,
}

/// A state change made by [`WorkerAlivenessTracker::sweep`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlivenessTransition {
    pub worker_id: WorkerId,
    pub status: AlivenessStatus,
    /// Buckets the worker held when it went silent. They must be reclaimed.
    pub reclaimed: Vec<BucketId>,
}

/// Heartbeat state machine for every worker the queue has heard of.
#[derive(Debug)]
pub struct WorkerAlivenessTracker {
    policy: AlivenessPolicy,
    workers: BTreeMap<WorkerId, WorkerAliveness>,
}

impl WorkerAlivenessTracker {
    pub fn new(policy: AlivenessPolicy) -> Self {
        Self {
            policy,
            workers: BTreeMap::new(),
        }
    }

    /// Register a worker, or refresh the configuration of a known one.
    ///
    /// Buckets the worker is processing are kept. A lost worker registering
    /// again is a new instance and becomes alive.
    pub fn register(
        &mut self,
        worker_id: &WorkerId,
        configuration: WorkerConfiguration,
        now: DateTime<Utc>,
    ) -> &WorkerAliveness {
        let worker = self
            .workers
            .entry(worker_id.clone())
            .or_insert_with(|| WorkerAliveness::not_registered(worker_id.clone()));

        if worker.status != AlivenessStatus::Alive {
            info!(worker_id = %worker_id, previous = ?worker.status, "Worker registered");
        }
        worker.status = AlivenessStatus::Alive;
        worker.last_heartbeat = Some(now);
        worker.silent_since = None;
        worker.configuration = Some(configuration);
        worker
    }

    /// Record a heartbeat.
    pub fn report_alive(
        &mut self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<AlivenessStatus, QueueError> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| QueueError::UnknownWorker(worker_id.clone()))?;

        match worker.status {
            AlivenessStatus::NotRegistered => Err(QueueError::UnknownWorker(worker_id.clone())),
            AlivenessStatus::Lost => Err(QueueError::WorkerLost(worker_id.clone())),
            AlivenessStatus::Silent => {
                // Reclaimed buckets stay reclaimed; they may already run elsewhere.
                info!(worker_id = %worker_id, "Silent worker is alive again");
                worker.status = AlivenessStatus::Alive;
                worker.silent_since = None;
                worker.last_heartbeat = Some(now);
                Ok(worker.status)
            }
            AlivenessStatus::Alive => {
                worker.last_heartbeat = Some(now);
                Ok(worker.status)
            }
        }
    }

    pub fn set_blocked(
        &mut self,
        worker_id: &WorkerId,
        blocked: bool,
    ) -> Result<&WorkerAliveness, QueueError> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| QueueError::UnknownWorker(worker_id.clone()))?;
        if worker.blocked != blocked {
            info!(worker_id = %worker_id, blocked, "Worker blocking changed");
        }
        worker.blocked = blocked;
        Ok(worker)
    }

    pub fn eligibility(&self, worker_id: &WorkerId) -> Eligibility {
        match self.workers.get(worker_id) {
            None => Eligibility::NotRegistered,
            Some(w) => match w.status {
                AlivenessStatus::NotRegistered => Eligibility::NotRegistered,
                AlivenessStatus::Lost => Eligibility::Lost,
                AlivenessStatus::Silent => Eligibility::Silent,
                AlivenessStatus::Alive if w.blocked => Eligibility::Blocked,
                AlivenessStatus::Alive => Eligibility::Eligible,
            },
        }
    }

    /// Whether the worker ever registered.
    pub fn is_known(&self, worker_id: &WorkerId) -> bool {
        self.workers
            .get(worker_id)
            .is_some_and(|w| w.status != AlivenessStatus::NotRegistered)
    }

    pub fn did_dequeue(&mut self, worker_id: &WorkerId, bucket_id: &BucketId) {
        match self.workers.get_mut(worker_id) {
            Some(worker) => {
                worker.bucket_ids_being_processed.insert(bucket_id.clone());
            }
            None => warn!(worker_id = %worker_id, bucket_id = %bucket_id, "Dequeue recorded for unknown worker"),
        }
    }

    pub fn did_finish(&mut self, worker_id: &WorkerId, bucket_id: &BucketId) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.bucket_ids_being_processed.remove(bucket_id);
        }
    }

    /// Move workers that stopped reporting to `silent` or `lost`.
    ///
    /// Buckets of workers that just went silent are returned in the
    /// transitions and removed from the worker's processing set.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<AlivenessTransition> {
        let mut transitions = Vec::new();
        let default_interval = self.policy.default_report_alive_interval_secs;

        for worker in self.workers.values_mut() {
            let Some(last_heartbeat) = worker.last_heartbeat else {
                continue;
            };
            let since_heartbeat = elapsed(last_heartbeat, now);

            if worker.status == AlivenessStatus::Alive {
                let interval = worker
                    .configuration
                    .as_ref()
                    .map(|c| c.report_alive_interval_secs)
                    .unwrap_or(default_interval);
                if since_heartbeat > self.policy.tolerance_window(interval) {
                    let reclaimed: Vec<BucketId> =
                        std::mem::take(&mut worker.bucket_ids_being_processed)
                            .into_iter()
                            .collect();
                    warn!(
                        worker_id = %worker.worker_id,
                        silent_for = ?since_heartbeat,
                        reclaimed = reclaimed.len(),
                        "Worker went silent"
                    );
                    worker.status = AlivenessStatus::Silent;
                    worker.silent_since = Some(now);
                    transitions.push(AlivenessTransition {
                        worker_id: worker.worker_id.clone(),
                        status: AlivenessStatus::Silent,
                        reclaimed,
                    });
                }
            }

            if worker.status == AlivenessStatus::Silent
                && since_heartbeat > self.policy.give_up_after()
            {
                warn!(worker_id = %worker.worker_id, "Worker is lost");
                worker.status = AlivenessStatus::Lost;
                worker.bucket_ids_being_processed.clear();
                transitions.push(AlivenessTransition {
                    worker_id: worker.worker_id.clone(),
                    status: AlivenessStatus::Lost,
                    reclaimed: Vec::new(),
                });
            }
        }

        transitions
    }

    /// Aliveness of a worker; unknown workers are reported as not registered.
    pub fn aliveness(&self, worker_id: &WorkerId) -> WorkerAliveness {
        self.workers
            .get(worker_id)
            .cloned()
            .unwrap_or_else(|| WorkerAliveness::not_registered(worker_id.clone()))
    }

    pub fn workers(&self) -> Vec<WorkerAliveness> {
        self.workers.values().cloned().collect()
    }

    pub fn workers_by_status(&self) -> BTreeMap<AlivenessStatus, Vec<WorkerId>> {
        let mut result: BTreeMap<AlivenessStatus, Vec<WorkerId>> = BTreeMap::new();
        for worker in self.workers.values() {
            result
                .entry(worker.status)
                .or_default()
                .push(worker.worker_id.clone());
        }
        result
    }

    /// Buckets each worker is currently processing. Workers without any are omitted.
    pub fn currently_processing(&self) -> BTreeMap<WorkerId, BTreeSet<BucketId>> {
        self.workers
            .values()
            .filter(|w| !w.bucket_ids_being_processed.is_empty())
            .map(|w| (w.worker_id.clone(), w.bucket_ids_being_processed.clone()))
            .collect()
    }

    /// Number of workers that are alive, blocked or not.
    pub fn alive_count(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.status == AlivenessStatus::Alive)
            .count()
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AlivenessPolicy {
        AlivenessPolicy {
            default_report_alive_interval_secs: 10,
            tolerance_factor: 3.0,
            give_up_after_secs: 120,
            sweep_interval_secs: 1,
        }
    }

    fn config() -> WorkerConfiguration {
        WorkerConfiguration {
            report_alive_interval_secs: 10,
            ..WorkerConfiguration::default()
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + chrono::TimeDelta::seconds(secs)
    }

    #[test]
    fn test_registration_makes_worker_alive() {
        let mut tracker = WorkerAlivenessTracker::new(policy());
        let worker = WorkerId::new("w1");
        assert_eq!(tracker.eligibility(&worker), Eligibility::NotRegistered);
        assert_eq!(tracker.aliveness(&worker).status, AlivenessStatus::NotRegistered);

        tracker.register(&worker, config(), t0());
        assert_eq!(tracker.eligibility(&worker), Eligibility::Eligible);
        assert!(tracker.is_known(&worker));
    }

    #[test]
    fn test_reregistration_keeps_dequeued_buckets() {
        let mut tracker = WorkerAlivenessTracker::new(policy());
        let worker = WorkerId::new("w1");
        tracker.register(&worker, config(), t0());
        tracker.did_dequeue(&worker, &BucketId::new("b1"));

        tracker.register(&worker, config(), at(5));
        let aliveness = tracker.aliveness(&worker);
        assert_eq!(aliveness.status, AlivenessStatus::Alive);
        assert_eq!(
            aliveness.bucket_ids_being_processed,
            BTreeSet::from([BucketId::new("b1")])
        );
    }

    #[test]
    fn test_heartbeat_from_unknown_worker() {
        let mut tracker = WorkerAlivenessTracker::new(policy());
        assert!(matches!(
            tracker.report_alive(&WorkerId::new("ghost"), t0()),
            Err(QueueError::UnknownWorker(_))
        ));
    }

    #[test]
    fn test_heartbeats_within_window_keep_worker_alive() {
        let mut tracker = WorkerAlivenessTracker::new(policy());
        let worker = WorkerId::new("w1");
        tracker.register(&worker, config(), t0());

        for secs in [10, 20, 30, 40] {
            tracker.report_alive(&worker, at(secs)).unwrap();
            assert!(tracker.sweep(at(secs + 5)).is_empty());
        }
        assert_eq!(tracker.eligibility(&worker), Eligibility::Eligible);
    }

    #[test]
    fn test_missed_heartbeats_make_worker_silent_and_release_buckets() {
        let mut tracker = WorkerAlivenessTracker::new(policy());
        let worker = WorkerId::new("w1");
        tracker.register(&worker, config(), t0());
        tracker.did_dequeue(&worker, &BucketId::new("b1"));

        // Window is 10s * 3.0.
        assert!(tracker.sweep(at(30)).is_empty());
        let transitions = tracker.sweep(at(31));
        assert_eq!(
            transitions,
            vec![AlivenessTransition {
                worker_id: worker.clone(),
                status: AlivenessStatus::Silent,
                reclaimed: vec![BucketId::new("b1")],
            }]
        );
        assert_eq!(tracker.eligibility(&worker), Eligibility::Silent);
        assert!(tracker.currently_processing().is_empty());
    }

    #[test]
    fn test_late_heartbeat_revives_silent_worker_without_buckets() {
        let mut tracker = WorkerAlivenessTracker::new(policy());
        let worker = WorkerId::new("w1");
        tracker.register(&worker, config(), t0());
        tracker.did_dequeue(&worker, &BucketId::new("b1"));
        tracker.sweep(at(31));

        assert_eq!(
            tracker.report_alive(&worker, at(40)).unwrap(),
            AlivenessStatus::Alive
        );
        let aliveness = tracker.aliveness(&worker);
        assert!(aliveness.bucket_ids_being_processed.is_empty());
        assert_eq!(aliveness.silent_since, None);
    }

    #[test]
    fn test_silent_worker_is_lost_after_give_up_deadline() {
        let mut tracker = WorkerAlivenessTracker::new(policy());
        let worker = WorkerId::new("w1");
        tracker.register(&worker, config(), t0());
        tracker.sweep(at(31));

        assert!(tracker.sweep(at(120)).is_empty());
        let transitions = tracker.sweep(at(121));
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].status, AlivenessStatus::Lost);
        assert_eq!(tracker.eligibility(&worker), Eligibility::Lost);
        assert!(matches!(
            tracker.report_alive(&worker, at(130)),
            Err(QueueError::WorkerLost(_))
        ));

        // Registering again starts a new instance.
        tracker.register(&worker, config(), at(140));
        assert_eq!(tracker.eligibility(&worker), Eligibility::Eligible);
    }

    #[test]
    fn test_blocking_does_not_release_buckets() {
        let mut tracker = WorkerAlivenessTracker::new(policy());
        let worker = WorkerId::new("w1");
        tracker.register(&worker, config(), t0());
        tracker.did_dequeue(&worker, &BucketId::new("b1"));

        tracker.set_blocked(&worker, true).unwrap();
        assert_eq!(tracker.eligibility(&worker), Eligibility::Blocked);
        assert_eq!(tracker.currently_processing().len(), 1);

        tracker.set_blocked(&worker, false).unwrap();
        assert_eq!(tracker.eligibility(&worker), Eligibility::Eligible);
    }

    #[test]
    fn test_workers_by_status() {
        let mut tracker = WorkerAlivenessTracker::new(policy());
        tracker.register(&WorkerId::new("w1"), config(), t0());
        tracker.register(&WorkerId::new("w2"), config(), at(20));
        tracker.sweep(at(35));

        let by_status = tracker.workers_by_status();
        assert_eq!(by_status[&AlivenessStatus::Silent], vec![WorkerId::new("w1")]);
        assert_eq!(by_status[&AlivenessStatus::Alive], vec![WorkerId::new("w2")]);
        assert_eq!(tracker.alive_count(), 1);
    }
}
