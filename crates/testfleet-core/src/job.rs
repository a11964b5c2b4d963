//! Jobs and their priorities.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::JobId;

/// Job priority. Higher values are served first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    Display,
)]
#[serde(transparent)]
#[display("{_0}")]
pub struct Priority(pub u32);

/// A job id with its priority and submission order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrioritizedJob {
    pub job_id: JobId,
    pub priority: Priority,
    /// Submission order, assigned by the queue. Lower was submitted earlier.
    pub sequence: u64,
}

impl PrioritizedJob {
    pub fn new(job_id: JobId, priority: Priority, sequence: u64) -> Self {
        Self {
            job_id,
            priority,
            sequence,
        }
    }

    /// Service order: higher priority first, then earlier submission.
    pub fn service_order(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.sequence.cmp(&other.sequence))
    }
}
