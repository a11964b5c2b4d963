//! Splitting tests into buckets.

use testfleet_core::{
    Bucket, BucketId, BuildArtifacts, IdGenerator, JobId, Priority, ScheduleStrategy,
    TestDestination, TestEntry, TestExecutionBehavior, TestTimeoutConfiguration,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SplitError {
    #[error("cannot split tests across zero workers")]
    ZeroWorkers,
}

/// Group `tests` into ordered buckets for `worker_count` workers.
///
/// Deterministic: the same input always produces the same groups. The groups
/// partition the input and keep its order.
pub fn split(
    tests: &[TestEntry],
    worker_count: u32,
    strategy: ScheduleStrategy,
) -> Result<Vec<Vec<TestEntry>>, SplitError> {
    if worker_count == 0 {
        return Err(SplitError::ZeroWorkers);
    }
    if tests.is_empty() {
        return Ok(Vec::new());
    }
    let workers = worker_count as usize;

    let groups = match strategy {
        ScheduleStrategy::Individual => tests.iter().map(|t| vec![t.clone()]).collect(),
        ScheduleStrategy::Uniform => tests
            .chunks(tests.len().div_ceil(workers))
            .map(<[TestEntry]>::to_vec)
            .collect(),
        ScheduleStrategy::Progressive => progressive(tests, workers),
    };
    Ok(groups)
}

/// Rounds of up to `workers` buckets, each round sized to cover half of what
/// is left, so bucket sizes never grow and end at a single test.
fn progressive(tests: &[TestEntry], workers: usize) -> Vec<Vec<TestEntry>> {
    let mut groups = Vec::new();
    let mut rest = tests;

    while !rest.is_empty() {
        let size = rest.len().div_ceil(2 * workers).max(1);
        for _ in 0..workers {
            if rest.is_empty() {
                break;
            }
            let (head, tail) = rest.split_at(size.min(rest.len()));
            groups.push(head.to_vec());
            rest = tail;
        }
    }

    groups
}

/// Everything a bucket carries besides its tests and id.
#[derive(Debug, Clone)]
pub struct BucketTemplate {
    pub job_id: JobId,
    pub priority: Priority,
    pub build_artifacts: BuildArtifacts,
    pub execution_behavior: TestExecutionBehavior,
    pub timeout_configuration: TestTimeoutConfiguration,
    pub destination: TestDestination,
}

/// Split `tests` and wrap every group in a bucket with a freshly minted id.
pub fn split_into_buckets(
    tests: &[TestEntry],
    worker_count: u32,
    strategy: ScheduleStrategy,
    template: &BucketTemplate,
    ids: &dyn IdGenerator,
) -> Result<Vec<Bucket>, SplitError> {
    let groups = split(tests, worker_count, strategy)?;
    Ok(groups
        .into_iter()
        .map(|test_entries| Bucket {
            bucket_id: BucketId::new(ids.generate()),
            job_id: template.job_id.clone(),
            priority: template.priority,
            test_entries,
            build_artifacts: template.build_artifacts.clone(),
            execution_behavior: template.execution_behavior.clone(),
            timeout_configuration: template.timeout_configuration,
            destination: template.destination.clone(),
            remaining_retries: template.execution_behavior.number_of_retries,
        })
        .collect())
}
