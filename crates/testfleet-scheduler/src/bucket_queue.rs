//! Per-job bucket queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use testfleet_core::{
    Bucket, BucketId, IdGenerator, JobResults, JobState, PrioritizedJob, RequestId, TestEntry,
    TestEntryResult, TestStatus, TestSummary, TestingResult, WorkerId,
};

use crate::QueueError;

/// A bucket handed to a worker that has not reported back yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DequeuedBucket {
    pub bucket: Bucket,
    pub worker_id: WorkerId,
    pub request_id: RequestId,
    pub dequeued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DequeueResult {
    Dequeued(DequeuedBucket),
    /// Nothing pending, but some buckets are still out and may come back.
    CheckAgainLater,
    /// Nothing pending and nothing out.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acceptance {
    Accepted {
        bucket_id: BucketId,
        retry_bucket_id: Option<BucketId>,
    },
    /// Submitted by someone other than the bucket's current owner. Nothing was recorded.
    Stale { reason: String },
}

#[derive(Debug)]
struct Outstanding {
    order: u64,
    dequeued: DequeuedBucket,
}

/// Pending buckets, buckets out for execution and recorded results of one job.
#[derive(Debug)]
pub struct JobQueue {
    job: PrioritizedJob,
    pending: VecDeque<Bucket>,
    outstanding: HashMap<BucketId, Outstanding>,
    finished: Vec<TestingResult>,
    finished_ids: HashSet<BucketId>,
    next_order: u64,
    deleted: bool,
}

impl JobQueue {
    pub fn new(job: PrioritizedJob) -> Self {
        Self {
            job,
            pending: VecDeque::new(),
            outstanding: HashMap::new(),
            finished: Vec::new(),
            finished_ids: HashSet::new(),
            next_order: 0,
            deleted: false,
        }
    }

    pub fn job(&self) -> &PrioritizedJob {
        &self.job
    }

    pub fn enqueue(&mut self, buckets: impl IntoIterator<Item = Bucket>) {
        self.pending.extend(buckets);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn has_outstanding(&self) -> bool {
        !self.outstanding.is_empty()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Nothing pending and nothing out for execution.
    pub fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.outstanding.is_empty()
    }

    /// The bucket already handed out for this exact fetch, if any.
    pub fn previously_dequeued(
        &self,
        worker_id: &WorkerId,
        request_id: &RequestId,
    ) -> Option<&DequeuedBucket> {
        self.outstanding
            .values()
            .map(|o| &o.dequeued)
            .find(|d| &d.worker_id == worker_id && &d.request_id == request_id)
    }

    pub fn dequeue(
        &mut self,
        worker_id: &WorkerId,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> DequeueResult {
        if let Some(existing) = self.previously_dequeued(worker_id, request_id) {
            return DequeueResult::Dequeued(existing.clone());
        }

        let Some(bucket) = self.pending.pop_front() else {
            return if self.outstanding.is_empty() {
                DequeueResult::Exhausted
            } else {
                DequeueResult::CheckAgainLater
            };
        };

        let dequeued = DequeuedBucket {
            bucket,
            worker_id: worker_id.clone(),
            request_id: request_id.clone(),
            dequeued_at: now,
        };
        self.outstanding.insert(
            dequeued.bucket.bucket_id.clone(),
            Outstanding {
                order: self.next_order,
                dequeued: dequeued.clone(),
            },
        );
        self.next_order += 1;
        DequeueResult::Dequeued(dequeued)
    }

    /// Record a result if it comes from the bucket's current owner.
    ///
    /// Failing tests are re-enqueued as a residual bucket while retries
    /// remain, unless the job is being deleted.
    pub fn accept(
        &mut self,
        result: TestingResult,
        worker_id: &WorkerId,
        request_id: &RequestId,
        ids: &dyn IdGenerator,
    ) -> Result<Acceptance, QueueError> {
        let bucket_id = result.bucket_id.clone();

        let Some(current) = self.outstanding.get(&bucket_id) else {
            let reason = if self.finished_ids.contains(&bucket_id) {
                format!("bucket {} already has a result", bucket_id)
            } else {
                format!("bucket {} is not out for execution", bucket_id)
            };
            return Ok(Acceptance::Stale { reason });
        };
        let current = &current.dequeued;
        if &current.worker_id != worker_id || &current.request_id != request_id {
            return Ok(Acceptance::Stale {
                reason: format!(
                    "bucket {} is owned by worker {} under request {}",
                    bucket_id, current.worker_id, current.request_id
                ),
            });
        }

        let expected = &current.bucket.test_entries;
        if let Some(unexpected) = result
            .unfiltered_results
            .iter()
            .find(|r| !expected.contains(&r.test_entry))
        {
            return Err(QueueError::UnexpectedTest {
                bucket_id,
                test_entry: unexpected.test_entry.clone(),
            });
        }

        let Some(Outstanding { dequeued, .. }) = self.outstanding.remove(&bucket_id) else {
            return Err(QueueError::UnknownBucket(bucket_id));
        };
        let result = with_lost_entries(result, &dequeued.bucket.test_entries);

        let failing: Vec<TestEntry> = result.failing_entries().cloned().collect();
        let retry = if failing.is_empty() || self.deleted {
            None
        } else {
            dequeued
                .bucket
                .residual(BucketId::new(ids.generate()), failing)
        };
        let retry_bucket_id = retry.as_ref().map(|b| b.bucket_id.clone());
        if let Some(residual) = retry {
            self.pending.push_back(residual);
        }

        self.finished_ids.insert(bucket_id.clone());
        self.finished.push(result);

        Ok(Acceptance::Accepted {
            bucket_id,
            retry_bucket_id,
        })
    }

    /// Return every bucket held by `worker_id` to the head of the queue,
    /// in the order they were handed out.
    pub fn reclaim(&mut self, worker_id: &WorkerId) -> Vec<BucketId> {
        let mut owned: Vec<BucketId> = self
            .outstanding
            .iter()
            .filter(|(_, o)| &o.dequeued.worker_id == worker_id)
            .map(|(id, _)| id.clone())
            .collect();
        owned.sort_by_key(|id| self.outstanding.get(id).map(|o| o.order));

        let mut reclaimed = Vec::with_capacity(owned.len());
        for bucket_id in owned.iter().rev() {
            if let Some(o) = self.outstanding.remove(bucket_id) {
                if !self.deleted {
                    self.pending.push_front(o.dequeued.bucket);
                }
                reclaimed.push(bucket_id.clone());
            }
        }
        reclaimed.reverse();
        reclaimed
    }

    /// Drop pending work and refuse retries. Outstanding buckets may still
    /// report back.
    pub fn mark_deleted(&mut self) -> usize {
        self.deleted = true;
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn results(&self) -> JobResults {
        let retrying: HashSet<&TestEntry> = self
            .pending
            .iter()
            .chain(self.outstanding.values().map(|o| &o.dequeued.bucket))
            .flat_map(|b| b.test_entries.iter())
            .collect();

        let mut tests: Vec<TestSummary> = Vec::new();
        let mut index: HashMap<&TestEntry, usize> = HashMap::new();
        for entry in self.finished.iter().flat_map(|r| r.unfiltered_results.iter()) {
            let position = *index.entry(&entry.test_entry).or_insert_with(|| {
                tests.push(TestSummary {
                    test_entry: entry.test_entry.clone(),
                    status: TestStatus::PermanentlyFailed,
                    attempts: 0,
                });
                tests.len() - 1
            });
            let summary = &mut tests[position];
            summary.attempts += 1;
            if entry.succeeded() {
                summary.status = TestStatus::Passed;
            }
        }
        for summary in &mut tests {
            if summary.status != TestStatus::Passed && retrying.contains(&summary.test_entry) {
                summary.status = TestStatus::Retrying;
            }
        }

        JobResults {
            job_id: self.job.job_id.clone(),
            testing_results: self.finished.clone(),
            tests,
        }
    }

    pub fn state(&self) -> JobState {
        JobState {
            job_id: self.job.job_id.clone(),
            priority: self.job.priority,
            pending_buckets: self.pending.len(),
            dispatched_buckets: self.outstanding.len(),
            finished_buckets: self.finished.len(),
            is_deleted: self.deleted,
            is_completed: self.is_drained(),
        }
    }
}

/// Add a lost entry for every bucket test the worker did not report on.
fn with_lost_entries(mut result: TestingResult, expected: &[TestEntry]) -> TestingResult {
    let reported: HashSet<TestEntry> = result
        .unfiltered_results
        .iter()
        .map(|r| r.test_entry.clone())
        .collect();
    result.unfiltered_results.extend(
        expected
            .iter()
            .filter(|t| !reported.contains(*t))
            .cloned()
            .map(TestEntryResult::lost),
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split::{BucketTemplate, split_into_buckets};
    use testfleet_core::{
        JobId, Priority, ScheduleStrategy, SequentialIdGenerator, TestExecutionBehavior,
        TestRunResult,
    };

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn queue_with(tests: usize, buckets: u32, retries: u32) -> (JobQueue, Vec<Bucket>) {
        let entries: Vec<TestEntry> = (0..tests)
            .map(|i| TestEntry::new("Suite", format!("test{}", i)))
            .collect();
        let template = BucketTemplate {
            job_id: JobId::new("job"),
            priority: Priority(0),
            build_artifacts: Default::default(),
            execution_behavior: TestExecutionBehavior {
                number_of_retries: retries,
                ..Default::default()
            },
            timeout_configuration: Default::default(),
            destination: Default::default(),
        };
        let ids = SequentialIdGenerator::new("b");
        let buckets =
            split_into_buckets(&entries, buckets, ScheduleStrategy::Uniform, &template, &ids)
                .unwrap();
        let mut queue = JobQueue::new(PrioritizedJob::new(JobId::new("job"), Priority(0), 0));
        queue.enqueue(buckets.clone());
        (queue, buckets)
    }

    fn result_for(bucket: &Bucket, succeeded: bool) -> TestingResult {
        TestingResult {
            bucket_id: bucket.bucket_id.clone(),
            unfiltered_results: bucket
                .test_entries
                .iter()
                .map(|t| TestEntryResult {
                    test_entry: t.clone(),
                    run_results: vec![TestRunResult {
                        succeeded,
                        duration_secs: 0.5,
                        exceptions: vec![],
                        host_name: "agent".to_string(),
                        started_at: now(),
                    }],
                })
                .collect(),
        }
    }

    fn dequeued(result: DequeueResult) -> DequeuedBucket {
        match result {
            DequeueResult::Dequeued(d) => d,
            other => panic!("expected a bucket, got {:?}", other),
        }
    }

    fn ids() -> SequentialIdGenerator {
        SequentialIdGenerator::new("retry")
    }

    #[test]
    fn test_dequeue_in_fifo_order() {
        let (mut queue, buckets) = queue_with(4, 2, 0);
        let w = WorkerId::new("w1");
        let first = dequeued(queue.dequeue(&w, &RequestId::new("r1"), now()));
        let second = dequeued(queue.dequeue(&w, &RequestId::new("r2"), now()));
        assert_eq!(first.bucket, buckets[0]);
        assert_eq!(second.bucket, buckets[1]);
    }

    #[test]
    fn test_same_request_gets_same_bucket() {
        let (mut queue, _) = queue_with(4, 2, 0);
        let w = WorkerId::new("w1");
        let r = RequestId::new("r1");
        let first = dequeued(queue.dequeue(&w, &r, now()));
        let again = dequeued(queue.dequeue(&w, &r, now()));
        assert_eq!(first, again);
        assert_eq!(queue.state().pending_buckets, 1);
    }

    #[test]
    fn test_check_again_later_until_last_result_arrives() {
        let (mut queue, _) = queue_with(1, 1, 0);
        let w1 = WorkerId::new("w1");
        let r1 = RequestId::new("r1");
        let d = dequeued(queue.dequeue(&w1, &r1, now()));

        assert_eq!(
            queue.dequeue(&WorkerId::new("w2"), &RequestId::new("r2"), now()),
            DequeueResult::CheckAgainLater
        );

        queue
            .accept(result_for(&d.bucket, true), &w1, &r1, &ids())
            .unwrap();
        assert_eq!(
            queue.dequeue(&WorkerId::new("w2"), &RequestId::new("r3"), now()),
            DequeueResult::Exhausted
        );
        assert!(queue.state().is_completed);
    }

    #[test]
    fn test_result_from_other_request_is_stale() {
        let (mut queue, _) = queue_with(2, 1, 0);
        let w1 = WorkerId::new("w1");
        let d = dequeued(queue.dequeue(&w1, &RequestId::new("r1"), now()));

        let outcome = queue
            .accept(result_for(&d.bucket, true), &w1, &RequestId::new("other"), &ids())
            .unwrap();
        assert!(matches!(outcome, Acceptance::Stale { .. }));
        assert_eq!(queue.state().dispatched_buckets, 1);
        assert!(queue.results().testing_results.is_empty());
    }

    #[test]
    fn test_reclaim_returns_buckets_to_head_in_dequeue_order() {
        let (mut queue, buckets) = queue_with(6, 3, 0);
        let w1 = WorkerId::new("w1");
        let w2 = WorkerId::new("w2");
        dequeued(queue.dequeue(&w1, &RequestId::new("r1"), now()));
        dequeued(queue.dequeue(&w2, &RequestId::new("r2"), now()));

        let reclaimed = queue.reclaim(&w1);
        assert_eq!(reclaimed, vec![buckets[0].bucket_id.clone()]);

        // The straggler comes before never-dispatched work.
        let next = dequeued(queue.dequeue(&w2, &RequestId::new("r3"), now()));
        assert_eq!(next.bucket, buckets[0]);
        let after = dequeued(queue.dequeue(&w2, &RequestId::new("r4"), now()));
        assert_eq!(after.bucket, buckets[2]);
    }

    #[test]
    fn test_reclaimed_bucket_goes_to_new_owner_and_old_result_is_ignored() {
        let (mut queue, _) = queue_with(2, 1, 0);
        let w1 = WorkerId::new("w1");
        let w2 = WorkerId::new("w2");
        let r1 = RequestId::new("r1");
        let r2 = RequestId::new("r2");

        let first = dequeued(queue.dequeue(&w1, &r1, now()));
        queue.reclaim(&w1);
        let second = dequeued(queue.dequeue(&w2, &r2, now()));
        assert_eq!(first.bucket.bucket_id, second.bucket.bucket_id);

        let winner = result_for(&second.bucket, true);
        assert!(matches!(
            queue.accept(winner.clone(), &w2, &r2, &ids()).unwrap(),
            Acceptance::Accepted { .. }
        ));
        let late = queue
            .accept(result_for(&first.bucket, false), &w1, &r1, &ids())
            .unwrap();
        assert!(matches!(late, Acceptance::Stale { .. }));
        assert_eq!(queue.results().testing_results, vec![winner]);
    }

    #[test]
    fn test_failed_tests_are_retried_then_permanently_failed() {
        let (mut queue, _) = queue_with(2, 1, 1);
        let w = WorkerId::new("w1");
        let ids = ids();

        let first = dequeued(queue.dequeue(&w, &RequestId::new("r1"), now()));
        let mut result = result_for(&first.bucket, true);
        result.unfiltered_results[1].run_results[0].succeeded = false;
        let outcome = queue.accept(result, &w, &RequestId::new("r1"), &ids).unwrap();
        let Acceptance::Accepted {
            retry_bucket_id: Some(retry_id),
            ..
        } = outcome
        else {
            panic!("expected a retry, got {:?}", outcome);
        };

        let summary = queue.results().tests;
        assert_eq!(summary[0].status, TestStatus::Passed);
        assert_eq!(summary[1].status, TestStatus::Retrying);

        let retry = dequeued(queue.dequeue(&w, &RequestId::new("r2"), now()));
        assert_eq!(retry.bucket.bucket_id, retry_id);
        assert_eq!(retry.bucket.test_entries, vec![first.bucket.test_entries[1].clone()]);
        assert_eq!(retry.bucket.remaining_retries, 0);

        let outcome = queue
            .accept(result_for(&retry.bucket, false), &w, &RequestId::new("r2"), &ids)
            .unwrap();
        assert!(matches!(
            outcome,
            Acceptance::Accepted {
                retry_bucket_id: None,
                ..
            }
        ));

        let results = queue.results();
        assert_eq!(results.tests[1].status, TestStatus::PermanentlyFailed);
        assert_eq!(results.tests[1].attempts, 2);
        assert!(queue.state().is_completed);
    }

    #[test]
    fn test_missing_entries_are_recorded_as_lost() {
        let (mut queue, _) = queue_with(2, 1, 0);
        let w = WorkerId::new("w1");
        let r = RequestId::new("r1");
        let d = dequeued(queue.dequeue(&w, &r, now()));
        let mut partial = result_for(&d.bucket, true);
        partial.unfiltered_results.truncate(1);

        queue.accept(partial, &w, &r, &ids()).unwrap();
        let results = queue.results();
        assert!(results.testing_results[0].unfiltered_results[1].is_lost());
        assert_eq!(results.tests[1].status, TestStatus::PermanentlyFailed);
    }

    #[test]
    fn test_unexpected_test_in_result_is_rejected() {
        let (mut queue, _) = queue_with(2, 1, 0);
        let w = WorkerId::new("w1");
        let r = RequestId::new("r1");
        let d = dequeued(queue.dequeue(&w, &r, now()));
        let mut result = result_for(&d.bucket, true);
        result.unfiltered_results[0].test_entry = TestEntry::new("Other", "test");

        assert!(matches!(
            queue.accept(result, &w, &r, &ids()),
            Err(QueueError::UnexpectedTest { .. })
        ));
        assert_eq!(queue.state().dispatched_buckets, 1);
    }

    #[test]
    fn test_deleted_job_drops_pending_and_skips_retries() {
        let (mut queue, _) = queue_with(4, 2, 3);
        let w = WorkerId::new("w1");
        let r = RequestId::new("r1");
        let d = dequeued(queue.dequeue(&w, &r, now()));

        assert_eq!(queue.mark_deleted(), 1);
        assert!(!queue.is_drained());

        let outcome = queue
            .accept(result_for(&d.bucket, false), &w, &r, &ids())
            .unwrap();
        assert!(matches!(
            outcome,
            Acceptance::Accepted {
                retry_bucket_id: None,
                ..
            }
        ));
        assert!(queue.is_drained());
    }
}
