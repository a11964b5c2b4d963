//! Buckets: the immutable unit of work handed to workers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::{BucketId, JobId, Priority};

/// A single test to run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestEntry {
    pub class_name: String,
    pub method_name: String,
    /// Identifier of the test case in an external test management system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<u64>,
}

impl TestEntry {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            case_id: None,
        }
    }
}

impl fmt::Display for TestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.class_name, self.method_name)
    }
}

/// References to the build products needed to run a bucket.
/// The queue never interprets these.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifacts {
    /// Location of the test bundle.
    pub test_bundle: String,
    /// Location of the application under test.
    #[serde(default)]
    pub app_bundle: Option<String>,
    /// Location of the UI test runner.
    #[serde(default)]
    pub runner: Option<String>,
    /// Additional applications installed before the run.
    #[serde(default)]
    pub additional_apps: Vec<String>,
}

/// How the tests of a bucket should be executed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestExecutionBehavior {
    /// Number of times failing tests are re-enqueued before giving up.
    pub number_of_retries: u32,
    /// Environment passed to the test process.
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestTimeoutConfiguration {
    /// Maximum duration of a single test, in seconds.
    pub single_test_maximum_duration_secs: u64,
}

impl Default for TestTimeoutConfiguration {
    fn default() -> Self {
        Self {
            single_test_maximum_duration_secs: 180,
        }
    }
}

/// Device or runtime the tests should run on. Opaque to the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDestination {
    pub device_type: String,
    pub runtime: String,
}

/// An ordered group of tests plus everything needed to run them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub bucket_id: BucketId,
    pub job_id: JobId,
    pub priority: Priority,
    pub test_entries: Vec<TestEntry>,
    pub build_artifacts: BuildArtifacts,
    pub execution_behavior: TestExecutionBehavior,
    pub timeout_configuration: TestTimeoutConfiguration,
    pub destination: TestDestination,
    /// How many more times failing tests of this bucket may be re-enqueued.
    pub remaining_retries: u32,
}

impl Bucket {
    /// Build a bucket covering only `test_entries` that consumes one retry.
    ///
    /// Returns `None` when no retries remain.
    pub fn residual(&self, bucket_id: BucketId, test_entries: Vec<TestEntry>) -> Option<Bucket> {
        let remaining_retries = self.remaining_retries.checked_sub(1)?;
        Some(Bucket {
            bucket_id,
            job_id: self.job_id.clone(),
            priority: self.priority,
            test_entries,
            build_artifacts: self.build_artifacts.clone(),
            execution_behavior: self.execution_behavior.clone(),
            timeout_configuration: self.timeout_configuration,
            destination: self.destination.clone(),
            remaining_retries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(retries: u32) -> Bucket {
        Bucket {
            bucket_id: BucketId::new("b1"),
            job_id: JobId::new("job"),
            priority: Priority::default(),
            test_entries: vec![TestEntry::new("A", "a"), TestEntry::new("A", "b")],
            build_artifacts: BuildArtifacts::default(),
            execution_behavior: TestExecutionBehavior {
                number_of_retries: retries,
                environment: HashMap::new(),
            },
            timeout_configuration: TestTimeoutConfiguration::default(),
            destination: TestDestination::default(),
            remaining_retries: retries,
        }
    }

    #[test]
    fn test_residual_consumes_one_retry() {
        let original = bucket(2);
        let residual = original
            .residual(BucketId::new("b2"), vec![TestEntry::new("A", "b")])
            .unwrap();
        assert_eq!(residual.remaining_retries, 1);
        assert_eq!(residual.job_id, original.job_id);
        assert_eq!(residual.test_entries, vec![TestEntry::new("A", "b")]);
    }

    #[test]
    fn test_no_residual_without_retries() {
        assert!(bucket(0).residual(BucketId::new("b2"), vec![]).is_none());
    }

    #[test]
    fn test_entry_display() {
        assert_eq!(TestEntry::new("LoginTests", "testLogin").to_string(), "LoginTests/testLogin");
    }
}
