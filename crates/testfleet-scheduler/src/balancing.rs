//! Balancing bucket queue: many per-job queues served by priority.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use testfleet_core::{
    Bucket, BucketId, IdGenerator, JobId, JobResults, JobState, PrioritizedJob, Priority,
    RequestId, TestingResult, WorkerId,
};
use tracing::{debug, info};

use crate::QueueError;
use crate::bucket_queue::{Acceptance, DequeueResult, JobQueue};

/// Operations the protocol layer needs from a bucket queue.
pub trait BucketQueue: Send {
    /// Add buckets to a job, creating the job if it does not exist yet.
    fn enqueue(
        &mut self,
        job_id: JobId,
        priority: Priority,
        buckets: Vec<Bucket>,
    ) -> Result<PrioritizedJob, QueueError>;

    fn dequeue_bucket(
        &mut self,
        worker_id: &WorkerId,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> DequeueResult;

    fn accept(
        &mut self,
        result: TestingResult,
        worker_id: &WorkerId,
        request_id: &RequestId,
    ) -> Result<Acceptance, QueueError>;

    /// Return every bucket held by `worker_id` to its job's pending queue.
    fn reclaim(&mut self, worker_id: &WorkerId) -> Vec<BucketId>;

    fn results(&self, job_id: &JobId) -> Result<JobResults, QueueError>;

    fn state(&self, job_id: &JobId) -> Result<JobState, QueueError>;

    /// Soft-delete a job. It is removed once nothing of it is out for execution.
    fn delete(&mut self, job_id: &JobId) -> Result<JobState, QueueError>;

    /// Nothing pending and nothing out for execution, in any job.
    fn is_depleted(&self) -> bool;
}

/// Per-job queues plus the index needed to route results back to them.
pub struct BalancingBucketQueue {
    jobs: HashMap<JobId, JobQueue>,
    bucket_jobs: HashMap<BucketId, JobId>,
    next_sequence: u64,
    ids: Arc<dyn IdGenerator>,
}

impl BalancingBucketQueue {
    pub fn new(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            jobs: HashMap::new(),
            bucket_jobs: HashMap::new(),
            next_sequence: 0,
            ids,
        }
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        let mut jobs: Vec<&JobQueue> = self.jobs.values().collect();
        jobs.sort_by(|a, b| a.job().service_order(b.job()));
        jobs.into_iter().map(|j| j.job().job_id.clone()).collect()
    }

    fn job(&self, job_id: &JobId) -> Result<&JobQueue, QueueError> {
        self.jobs
            .get(job_id)
            .ok_or_else(|| QueueError::UnknownJob(job_id.clone()))
    }

    /// Remove a deleted job once it has nothing out for execution.
    fn finalize_if_drained(&mut self, job_id: &JobId) {
        let drained = self
            .jobs
            .get(job_id)
            .is_some_and(|j| j.is_deleted() && j.is_drained());
        if drained {
            self.jobs.remove(job_id);
            self.bucket_jobs.retain(|_, j| j != job_id);
            info!(job_id = %job_id, "Deleted job removed from queue");
        }
    }
}

impl BucketQueue for BalancingBucketQueue {
    fn enqueue(
        &mut self,
        job_id: JobId,
        priority: Priority,
        buckets: Vec<Bucket>,
    ) -> Result<PrioritizedJob, QueueError> {
        if !self.jobs.contains_key(&job_id) {
            let job = PrioritizedJob::new(job_id.clone(), priority, self.next_sequence);
            self.next_sequence += 1;
            self.jobs.insert(job_id.clone(), JobQueue::new(job));
        }
        let Some(queue) = self.jobs.get_mut(&job_id) else {
            return Err(QueueError::UnknownJob(job_id));
        };
        if queue.is_deleted() {
            return Err(QueueError::JobDeleted(job_id));
        }

        for bucket in &buckets {
            self.bucket_jobs
                .insert(bucket.bucket_id.clone(), job_id.clone());
        }
        debug!(job_id = %job_id, buckets = buckets.len(), "Enqueued buckets");
        queue.enqueue(buckets);
        Ok(queue.job().clone())
    }

    fn dequeue_bucket(
        &mut self,
        worker_id: &WorkerId,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> DequeueResult {
        if let Some(previous) = self
            .jobs
            .values()
            .find_map(|j| j.previously_dequeued(worker_id, request_id))
        {
            return DequeueResult::Dequeued(previous.clone());
        }

        let next_job = self
            .jobs
            .values()
            .filter(|j| j.has_pending())
            .min_by(|a, b| a.job().service_order(b.job()))
            .map(|j| j.job().job_id.clone());

        if let Some(queue) = next_job.and_then(|id| self.jobs.get_mut(&id)) {
            return queue.dequeue(worker_id, request_id, now);
        }
        if self.jobs.values().any(JobQueue::has_outstanding) {
            DequeueResult::CheckAgainLater
        } else {
            DequeueResult::Exhausted
        }
    }

    fn accept(
        &mut self,
        result: TestingResult,
        worker_id: &WorkerId,
        request_id: &RequestId,
    ) -> Result<Acceptance, QueueError> {
        let bucket_id = result.bucket_id.clone();
        let job_id = self
            .bucket_jobs
            .get(&bucket_id)
            .cloned()
            .ok_or_else(|| QueueError::UnknownBucket(bucket_id.clone()))?;
        let queue = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| QueueError::UnknownBucket(bucket_id.clone()))?;

        let acceptance = queue.accept(result, worker_id, request_id, self.ids.as_ref())?;
        if let Acceptance::Accepted {
            retry_bucket_id: Some(retry_id),
            ..
        } = &acceptance
        {
            self.bucket_jobs.insert(retry_id.clone(), job_id.clone());
        }
        self.finalize_if_drained(&job_id);
        Ok(acceptance)
    }

    fn reclaim(&mut self, worker_id: &WorkerId) -> Vec<BucketId> {
        let mut reclaimed = Vec::new();
        let mut touched = Vec::new();
        for (job_id, queue) in self.jobs.iter_mut() {
            let ids = queue.reclaim(worker_id);
            if !ids.is_empty() {
                touched.push(job_id.clone());
                reclaimed.extend(ids);
            }
        }
        for job_id in touched {
            self.finalize_if_drained(&job_id);
        }
        reclaimed
    }

    fn results(&self, job_id: &JobId) -> Result<JobResults, QueueError> {
        Ok(self.job(job_id)?.results())
    }

    fn state(&self, job_id: &JobId) -> Result<JobState, QueueError> {
        Ok(self.job(job_id)?.state())
    }

    fn delete(&mut self, job_id: &JobId) -> Result<JobState, QueueError> {
        let queue = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::UnknownJob(job_id.clone()))?;
        let dropped = queue.mark_deleted();
        let state = queue.state();
        info!(
            job_id = %job_id,
            dropped_buckets = dropped,
            outstanding = state.dispatched_buckets,
            "Job marked for deletion"
        );
        self.finalize_if_drained(job_id);
        Ok(state)
    }

    fn is_depleted(&self) -> bool {
        self.jobs.values().all(JobQueue::is_drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket_queue::DequeuedBucket;
    use crate::split::{BucketTemplate, split_into_buckets};
    use testfleet_core::{
        ScheduleStrategy, SequentialIdGenerator, TestEntry, TestEntryResult, TestRunResult,
    };

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn buckets(job: &str, priority: u32, tests: usize, ids: &dyn IdGenerator) -> Vec<Bucket> {
        let entries: Vec<TestEntry> = (0..tests)
            .map(|i| TestEntry::new(job, format!("test{}", i)))
            .collect();
        let template = BucketTemplate {
            job_id: JobId::new(job),
            priority: Priority(priority),
            build_artifacts: Default::default(),
            execution_behavior: Default::default(),
            timeout_configuration: Default::default(),
            destination: Default::default(),
        };
        split_into_buckets(&entries, tests as u32, ScheduleStrategy::Individual, &template, ids)
            .unwrap()
    }

    fn queue() -> (BalancingBucketQueue, Arc<SequentialIdGenerator>) {
        let ids = Arc::new(SequentialIdGenerator::new("bucket"));
        (BalancingBucketQueue::new(ids.clone()), ids)
    }

    fn take(queue: &mut BalancingBucketQueue, worker: &str, request: &str) -> DequeuedBucket {
        match queue.dequeue_bucket(&WorkerId::new(worker), &RequestId::new(request), now()) {
            DequeueResult::Dequeued(d) => d,
            other => panic!("expected a bucket, got {:?}", other),
        }
    }

    fn passing(bucket: &Bucket) -> TestingResult {
        TestingResult {
            bucket_id: bucket.bucket_id.clone(),
            unfiltered_results: bucket
                .test_entries
                .iter()
                .map(|t| TestEntryResult {
                    test_entry: t.clone(),
                    run_results: vec![TestRunResult {
                        succeeded: true,
                        duration_secs: 1.0,
                        exceptions: vec![],
                        host_name: "agent".to_string(),
                        started_at: now(),
                    }],
                })
                .collect(),
        }
    }

    #[test]
    fn test_empty_queue_is_exhausted() {
        let (mut queue, _) = queue();
        assert_eq!(
            queue.dequeue_bucket(&WorkerId::new("w"), &RequestId::new("r"), now()),
            DequeueResult::Exhausted
        );
        assert!(queue.is_depleted());
    }

    #[test]
    fn test_higher_priority_job_served_first() {
        let (mut queue, ids) = queue();
        queue
            .enqueue(JobId::new("low"), Priority(1), buckets("low", 1, 2, ids.as_ref()))
            .unwrap();
        queue
            .enqueue(JobId::new("high"), Priority(9), buckets("high", 9, 1, ids.as_ref()))
            .unwrap();

        assert_eq!(take(&mut queue, "w", "r1").bucket.job_id, JobId::new("high"));
        assert_eq!(take(&mut queue, "w", "r2").bucket.job_id, JobId::new("low"));
        assert_eq!(take(&mut queue, "w", "r3").bucket.job_id, JobId::new("low"));
    }

    #[test]
    fn test_equal_priority_earlier_job_first() {
        let (mut queue, ids) = queue();
        queue
            .enqueue(JobId::new("first"), Priority(5), buckets("first", 5, 1, ids.as_ref()))
            .unwrap();
        queue
            .enqueue(JobId::new("second"), Priority(5), buckets("second", 5, 1, ids.as_ref()))
            .unwrap();
        // Appending to an existing job keeps its place.
        queue
            .enqueue(JobId::new("first"), Priority(5), buckets("first", 5, 1, ids.as_ref()))
            .unwrap();

        assert_eq!(take(&mut queue, "w", "r1").bucket.job_id, JobId::new("first"));
        assert_eq!(take(&mut queue, "w", "r2").bucket.job_id, JobId::new("first"));
        assert_eq!(take(&mut queue, "w", "r3").bucket.job_id, JobId::new("second"));
        assert_eq!(queue.job_ids(), vec![JobId::new("first"), JobId::new("second")]);
    }

    #[test]
    fn test_outstanding_bucket_means_check_again_later() {
        let (mut queue, ids) = queue();
        queue
            .enqueue(JobId::new("job"), Priority(0), buckets("job", 0, 1, ids.as_ref()))
            .unwrap();
        let d = take(&mut queue, "w1", "r1");

        assert_eq!(
            queue.dequeue_bucket(&WorkerId::new("w2"), &RequestId::new("r2"), now()),
            DequeueResult::CheckAgainLater
        );
        assert!(!queue.is_depleted());

        queue
            .accept(passing(&d.bucket), &WorkerId::new("w1"), &RequestId::new("r1"))
            .unwrap();
        assert_eq!(
            queue.dequeue_bucket(&WorkerId::new("w2"), &RequestId::new("r3"), now()),
            DequeueResult::Exhausted
        );
        assert!(queue.is_depleted());
    }

    #[test]
    fn test_bucket_never_dequeued_twice_at_once() {
        let (mut queue, ids) = queue();
        queue
            .enqueue(JobId::new("a"), Priority(0), buckets("a", 0, 5, ids.as_ref()))
            .unwrap();
        queue
            .enqueue(JobId::new("b"), Priority(2), buckets("b", 2, 5, ids.as_ref()))
            .unwrap();

        let mut out = std::collections::HashSet::new();
        for i in 0..10 {
            let d = take(&mut queue, &format!("w{}", i % 3), &format!("r{}", i));
            assert!(out.insert(d.bucket.bucket_id.clone()), "dequeued twice");
            if i % 4 == 0 {
                for id in queue.reclaim(&d.worker_id) {
                    out.remove(&id);
                }
            }
        }
    }

    #[test]
    fn test_results_for_unknown_job_is_an_error() {
        let (queue, _) = queue();
        assert!(matches!(
            queue.results(&JobId::new("missing")),
            Err(QueueError::UnknownJob(_))
        ));
    }

    #[test]
    fn test_result_for_unknown_bucket_is_an_error() {
        let (mut queue, _) = queue();
        let result = TestingResult {
            bucket_id: BucketId::new("nope"),
            unfiltered_results: vec![],
        };
        assert!(matches!(
            queue.accept(result, &WorkerId::new("w"), &RequestId::new("r")),
            Err(QueueError::UnknownBucket(_))
        ));
    }

    #[test]
    fn test_results_aggregate_per_job() {
        let (mut queue, ids) = queue();
        queue
            .enqueue(JobId::new("a"), Priority(1), buckets("a", 1, 1, ids.as_ref()))
            .unwrap();
        queue
            .enqueue(JobId::new("b"), Priority(0), buckets("b", 0, 1, ids.as_ref()))
            .unwrap();
        let da = take(&mut queue, "w", "r1");
        let db = take(&mut queue, "w", "r2");
        queue
            .accept(passing(&da.bucket), &WorkerId::new("w"), &RequestId::new("r1"))
            .unwrap();
        queue
            .accept(passing(&db.bucket), &WorkerId::new("w"), &RequestId::new("r2"))
            .unwrap();

        let a = queue.results(&JobId::new("a")).unwrap();
        assert_eq!(a.testing_results, vec![passing(&da.bucket)]);
        assert_eq!(a.tests.len(), 1);
    }

    #[test]
    fn test_delete_is_deferred_until_outstanding_drains() {
        let (mut queue, ids) = queue();
        queue
            .enqueue(JobId::new("job"), Priority(0), buckets("job", 0, 3, ids.as_ref()))
            .unwrap();
        let d = take(&mut queue, "w", "r1");

        let state = queue.delete(&JobId::new("job")).unwrap();
        assert!(state.is_deleted);
        assert_eq!(state.pending_buckets, 0);
        assert_eq!(state.dispatched_buckets, 1);
        assert!(queue.state(&JobId::new("job")).is_ok());
        assert!(matches!(
            queue.enqueue(JobId::new("job"), Priority(0), vec![]),
            Err(QueueError::JobDeleted(_))
        ));

        queue
            .accept(passing(&d.bucket), &WorkerId::new("w"), &RequestId::new("r1"))
            .unwrap();
        assert!(matches!(
            queue.state(&JobId::new("job")),
            Err(QueueError::UnknownJob(_))
        ));
        assert!(queue.is_depleted());
    }

    #[test]
    fn test_delete_of_idle_job_is_immediate() {
        let (mut queue, ids) = queue();
        queue
            .enqueue(JobId::new("job"), Priority(0), buckets("job", 0, 2, ids.as_ref()))
            .unwrap();
        queue.delete(&JobId::new("job")).unwrap();
        assert!(queue.job_ids().is_empty());
        assert!(matches!(
            queue.delete(&JobId::new("job")),
            Err(QueueError::UnknownJob(_))
        ));
    }

    #[test]
    fn test_reclaim_spans_jobs() {
        let (mut queue, ids) = queue();
        queue
            .enqueue(JobId::new("a"), Priority(1), buckets("a", 1, 1, ids.as_ref()))
            .unwrap();
        queue
            .enqueue(JobId::new("b"), Priority(0), buckets("b", 0, 1, ids.as_ref()))
            .unwrap();
        take(&mut queue, "w1", "r1");
        take(&mut queue, "w1", "r2");

        let mut reclaimed = queue.reclaim(&WorkerId::new("w1"));
        reclaimed.sort();
        assert_eq!(reclaimed.len(), 2);
        assert_eq!(take(&mut queue, "w2", "r3").bucket.job_id, JobId::new("a"));
        assert_eq!(take(&mut queue, "w2", "r4").bucket.job_id, JobId::new("b"));
    }
}
