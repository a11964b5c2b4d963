//! Work distribution for the testfleet queue server.
//!
//! Splits jobs into buckets, balances them across jobs by priority, tracks
//! worker heartbeats and reclaims buckets from workers that went silent.
//! All mutable state lives in a [`Dispatcher`], which serializes access
//! behind one lock for the queue and one for the aliveness tracker.

pub mod aliveness;
pub mod balancing;
pub mod bucket_queue;
pub mod dispatcher;
pub mod error;
pub mod split;
pub mod tasks;
pub mod termination;

pub use aliveness::{AlivenessTransition, Eligibility, WorkerAlivenessTracker};
pub use balancing::{BalancingBucketQueue, BucketQueue};
pub use bucket_queue::{Acceptance, DequeueResult, DequeuedBucket, JobQueue};
pub use dispatcher::{Dispatcher, DispatcherSettings};
pub use error::QueueError;
pub use split::{BucketTemplate, SplitError, split, split_into_buckets};
pub use tasks::{spawn_aliveness_sweep, spawn_termination_watcher};
pub use termination::{TerminationController, TerminationLock};
