//! Worker configuration handed out at registration.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{BucketId, TestExecutionBehavior, TestTimeoutConfiguration, WorkerId};

/// Shared secret minted by a queue server instance. Workers echo it on every
/// fetch and result submission so that stale workers of a previous server
/// instance are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(transparent)]
#[display("{_0}")]
pub struct PayloadSignature(String);

impl PayloadSignature {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Settings a worker runs with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfiguration {
    pub execution_behavior: TestExecutionBehavior,
    pub timeout_configuration: TestTimeoutConfiguration,
    /// How often the worker must report that it is alive.
    pub report_alive_interval_secs: u64,
    /// Filled in by the server on registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_signature: Option<PayloadSignature>,
}

impl Default for WorkerConfiguration {
    fn default() -> Self {
        Self {
            execution_behavior: TestExecutionBehavior::default(),
            timeout_configuration: TestTimeoutConfiguration::default(),
            report_alive_interval_secs: 30,
            payload_signature: None,
        }
    }
}

/// Heartbeat-derived liveness of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlivenessStatus {
    NotRegistered,
    Alive,
    /// Missed heartbeats; its buckets were reclaimed.
    Silent,
    /// Gave up on the worker; it no longer receives work until it registers again.
    Lost,
}

/// Snapshot of what the queue knows about a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerAliveness {
    pub worker_id: WorkerId,
    pub status: AlivenessStatus,
    /// Set by an operator; blocked workers get no new buckets.
    pub blocked: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub silent_since: Option<DateTime<Utc>>,
    pub bucket_ids_being_processed: BTreeSet<BucketId>,
    pub configuration: Option<WorkerConfiguration>,
}

impl WorkerAliveness {
    pub fn not_registered(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            status: AlivenessStatus::NotRegistered,
            blocked: false,
            last_heartbeat: None,
            silent_since: None,
            bucket_ids_being_processed: BTreeSet::new(),
            configuration: None,
        }
    }
}
