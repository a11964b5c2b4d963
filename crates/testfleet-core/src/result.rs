//! Testing results reported by workers and aggregated per job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BucketId, JobId, Priority, TestEntry};

/// A single attempt at running a test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRunResult {
    pub succeeded: bool,
    pub duration_secs: f64,
    #[serde(default)]
    pub exceptions: Vec<String>,
    pub host_name: String,
    pub started_at: DateTime<Utc>,
}

/// Outcome of one test entry of a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestEntryResult {
    pub test_entry: TestEntry,
    /// Empty when the test never ran (lost).
    #[serde(default)]
    pub run_results: Vec<TestRunResult>,
}

impl TestEntryResult {
    /// A test that was expected to run but produced no result.
    pub fn lost(test_entry: TestEntry) -> Self {
        Self {
            test_entry,
            run_results: Vec::new(),
        }
    }

    pub fn is_lost(&self) -> bool {
        self.run_results.is_empty()
    }

    pub fn succeeded(&self) -> bool {
        self.run_results.iter().any(|r| r.succeeded)
    }
}

/// Result of executing a bucket, submitted by the worker that ran it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestingResult {
    pub bucket_id: BucketId,
    pub unfiltered_results: Vec<TestEntryResult>,
}

impl TestingResult {
    pub fn failing_entries(&self) -> impl Iterator<Item = &TestEntry> {
        self.unfiltered_results
            .iter()
            .filter(|r| !r.succeeded())
            .map(|r| &r.test_entry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    /// Failed so far, a retry is queued or running.
    Retrying,
    /// Failed on every allowed attempt.
    PermanentlyFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSummary {
    pub test_entry: TestEntry,
    pub status: TestStatus,
    pub attempts: usize,
}

/// Everything recorded for a job so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResults {
    pub job_id: JobId,
    pub testing_results: Vec<TestingResult>,
    pub tests: Vec<TestSummary>,
}

/// Progress counters of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: JobId,
    pub priority: Priority,
    pub pending_buckets: usize,
    pub dispatched_buckets: usize,
    pub finished_buckets: usize,
    pub is_deleted: bool,
    pub is_completed: bool,
}
