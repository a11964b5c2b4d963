//! Request and response bodies of the queue HTTP protocol.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    Bucket, BucketId, BuildArtifacts, JobId, PayloadSignature, Priority, RequestId,
    TestDestination, TestEntry, TestExecutionBehavior, TestTimeoutConfiguration, TestingResult,
    WorkerConfiguration, WorkerId,
};

/// How a flat list of tests is split into buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStrategy {
    /// One test per bucket.
    Individual,
    /// Equal buckets, one per worker.
    #[default]
    Uniform,
    /// Large buckets first, shrinking towards single tests.
    Progressive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueVersionResponse {
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterWorkerRequest {
    /// Settings the worker would like to run with. Ignored for workers the
    /// server has its own configuration for.
    #[serde(default)]
    pub configuration: Option<WorkerConfiguration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchBucketRequest {
    pub worker_id: WorkerId,
    pub request_id: RequestId,
    pub payload_signature: PayloadSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FetchBucketResponse {
    Bucket { bucket: Bucket },
    /// Nothing to hand out right now; poll again after the given delay.
    CheckAgainLater { after_secs: u64 },
    /// No work left and workers are expected to exit.
    QueueDepleted,
    /// This worker may not receive work (unknown, lost or blocked).
    WorkerSpecificError { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResultRequest {
    pub worker_id: WorkerId,
    pub request_id: RequestId,
    pub payload_signature: PayloadSignature,
    pub testing_result: TestingResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitResultResponse {
    Accepted {
        bucket_id: BucketId,
        /// Bucket re-enqueued for the tests that failed, if any.
        retry_bucket_id: Option<BucketId>,
    },
    /// The submission did not come from the bucket's current owner.
    Ignored { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTestsRequest {
    pub job_id: JobId,
    #[serde(default)]
    pub priority: Priority,
    pub tests: Vec<TestEntry>,
    #[serde(default)]
    pub strategy: ScheduleStrategy,
    /// Defaults to the number of workers the server knows about.
    #[serde(default)]
    pub worker_count: Option<u32>,
    #[serde(default)]
    pub build_artifacts: BuildArtifacts,
    #[serde(default)]
    pub execution_behavior: TestExecutionBehavior,
    #[serde(default)]
    pub timeout_configuration: TestTimeoutConfiguration,
    #[serde(default)]
    pub destination: TestDestination,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTestsResponse {
    pub job_id: JobId,
    pub bucket_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    pub ok: bool,
}

impl AckResponse {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingBucketsResponse {
    pub workers: BTreeMap<WorkerId, Vec<BucketId>>,
}
