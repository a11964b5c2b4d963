//! Queue error types.

use testfleet_core::{BucketId, JobId, TestEntry, WorkerId};
use thiserror::Error;

use crate::SplitError;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unknown job: {0}")]
    UnknownJob(JobId),

    #[error("job {0} is being deleted")]
    JobDeleted(JobId),

    #[error("unknown bucket: {0}")]
    UnknownBucket(BucketId),

    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error("worker {0} is not in the list of known workers")]
    WorkerNotAllowed(WorkerId),

    #[error("worker {0} was declared lost and must register again")]
    WorkerLost(WorkerId),

    #[error("worker {worker_id} declared an invalid configuration: {message}")]
    InvalidWorkerConfiguration { worker_id: WorkerId, message: String },

    #[error("payload signature does not match this queue server")]
    SignatureMismatch,

    #[error("result for bucket {bucket_id} contains test {test_entry} which is not part of it")]
    UnexpectedTest {
        bucket_id: BucketId,
        test_entry: TestEntry,
    },

    #[error(transparent)]
    Split(#[from] SplitError),
}
