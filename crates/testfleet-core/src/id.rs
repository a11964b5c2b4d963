//! Identifiers and id generation.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
        )]
        #[serde(transparent)]
        #[display("{_0}")]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifies a worker machine. Usually the host name it was deployed to.
    WorkerId
);
string_id!(
    /// Identifies a bucket. Retry residuals get a fresh id.
    BucketId
);
string_id!(
    /// Identifies a job submitted to the queue.
    JobId
);
string_id!(
    /// Correlates a bucket fetch with the result submitted for it.
    RequestId
);

/// Source of unique identifiers for buckets, requests and signatures.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Generates time-ordered UUIDv7 strings.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn generate(&self) -> String {
        Uuid::now_v7().to_string()
    }
}

/// Generates `prefix-1`, `prefix-2`, ... Deterministic, for tests and fixtures.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn generate(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let id = WorkerId::new("agent-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"agent-1\"");
        let back: WorkerId = serde_json::from_str("\"agent-1\"").unwrap();
        assert_eq!(back, id);
        assert_eq!(id.to_string(), "agent-1");
    }

    #[test]
    fn test_sequential_generator() {
        let ids = SequentialIdGenerator::new("bucket");
        assert_eq!(ids.generate(), "bucket-1");
        assert_eq!(ids.generate(), "bucket-2");
    }

    #[test]
    fn test_uuid_generator_is_unique() {
        let ids = UuidIdGenerator;
        assert_ne!(ids.generate(), ids.generate());
    }
}
