//! Core domain types and traits for the testfleet queue.
//!
//! This crate contains:
//! - Identifiers and the id generator seam
//! - Bucket, job and worker models
//! - Testing results and job result aggregates
//! - Request/response bodies of the queue protocol
//! - Clock abstraction used for heartbeat bookkeeping
//! - Test executor trait consumed by workers

pub mod bucket;
pub mod clock;
pub mod error;
pub mod executor;
pub mod id;
pub mod job;
pub mod protocol;
pub mod result;
pub mod worker;

pub use bucket::{
    Bucket, BuildArtifacts, TestDestination, TestEntry, TestExecutionBehavior,
    TestTimeoutConfiguration,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use id::{
    BucketId, IdGenerator, JobId, RequestId, SequentialIdGenerator, UuidIdGenerator, WorkerId,
};
pub use job::{Priority, PrioritizedJob};
pub use protocol::ScheduleStrategy;
pub use result::{
    JobResults, JobState, TestEntryResult, TestRunResult, TestStatus, TestSummary, TestingResult,
};
pub use worker::{AlivenessStatus, PayloadSignature, WorkerAliveness, WorkerConfiguration};
