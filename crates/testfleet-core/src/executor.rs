//! Test executor trait.
//!
//! Executors actually run the tests of a bucket on a device, simulator or
//! host. The queue server never calls them; workers do.

use async_trait::async_trait;

use crate::{Bucket, Result, TestEntryResult, TestingResult, WorkerConfiguration};

/// Trait for test executors.
#[async_trait]
pub trait TestExecutor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Run every test of the bucket and report the outcome.
    async fn execute(
        &self,
        bucket: &Bucket,
        configuration: &WorkerConfiguration,
    ) -> Result<TestingResult>;
}

/// Result reporting every test of the bucket as lost. Submitted when the
/// executor itself failed, so the queue can retry the bucket.
pub fn lost_result(bucket: &Bucket) -> TestingResult {
    TestingResult {
        bucket_id: bucket.bucket_id.clone(),
        unfiltered_results: bucket
            .test_entries
            .iter()
            .cloned()
            .map(TestEntryResult::lost)
            .collect(),
    }
}
