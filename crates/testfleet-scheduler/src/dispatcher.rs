//! Lock-guarded aggregate behind every queue protocol operation.
//!
//! Locks are always taken queue first, tracker second. Fetch, submit and the
//! aliveness sweep all hold both, so a bucket can never be handed to a worker
//! the sweep has just declared silent.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use testfleet_config::{
    AlivenessPolicy, QueueServerConfig, TerminationPolicy, WorkerAlivenessPolicy,
    validate_report_alive_interval,
};
use testfleet_core::protocol::{
    FetchBucketRequest, FetchBucketResponse, ProcessingBucketsResponse, ScheduleTestsRequest,
    ScheduleTestsResponse, SubmitResultRequest, SubmitResultResponse,
};
use testfleet_core::{
    AlivenessStatus, Clock, IdGenerator, JobId, JobResults, JobState, PayloadSignature,
    WorkerAliveness, WorkerConfiguration, WorkerId,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::aliveness::{AlivenessTransition, Eligibility, WorkerAlivenessTracker};
use crate::balancing::{BalancingBucketQueue, BucketQueue};
use crate::bucket_queue::{Acceptance, DequeueResult};
use crate::split::{BucketTemplate, split_into_buckets};
use crate::termination::TerminationController;
use crate::QueueError;

/// Server-wide settings the dispatcher works with.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub version: String,
    pub check_again_after: Duration,
    pub worker_policy: WorkerAlivenessPolicy,
    pub aliveness: AlivenessPolicy,
    pub termination: TerminationPolicy,
    /// Workers allowed to register, with the configuration they get.
    /// Empty means anyone may register.
    pub known_workers: HashMap<WorkerId, WorkerConfiguration>,
}

impl From<&QueueServerConfig> for DispatcherSettings {
    fn from(config: &QueueServerConfig) -> Self {
        Self {
            version: config.version.clone(),
            check_again_after: config.check_again_after(),
            worker_policy: config.worker_policy,
            aliveness: config.aliveness.clone(),
            termination: config.termination,
            known_workers: config
                .workers
                .iter()
                .map(|w| (w.worker_id.clone(), w.configuration.clone()))
                .collect(),
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from(&QueueServerConfig::default())
    }
}

pub struct Dispatcher {
    queue: Mutex<Box<dyn BucketQueue>>,
    tracker: RwLock<WorkerAlivenessTracker>,
    termination: TerminationController,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    signature: PayloadSignature,
    settings: DispatcherSettings,
}

impl Dispatcher {
    pub fn new(settings: DispatcherSettings, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        let queue = Box::new(BalancingBucketQueue::new(ids.clone()));
        Self::with_queue(settings, queue, clock, ids)
    }

    /// Build a dispatcher around any [`BucketQueue`] implementation.
    pub fn with_queue(
        settings: DispatcherSettings,
        queue: Box<dyn BucketQueue>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let signature = PayloadSignature::new(ids.generate());
        let termination = TerminationController::new(settings.termination, clock.now());
        Self {
            queue: Mutex::new(queue),
            tracker: RwLock::new(WorkerAlivenessTracker::new(settings.aliveness.clone())),
            termination,
            clock,
            ids,
            signature,
            settings,
        }
    }

    pub fn version(&self) -> &str {
        &self.settings.version
    }

    pub fn payload_signature(&self) -> &PayloadSignature {
        &self.signature
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    /// Time since the last register, fetch, submit or schedule call.
    pub fn idle_for(&self) -> Duration {
        self.termination.idle_for(self.clock.now())
    }

    fn verify_signature(&self, signature: &PayloadSignature) -> Result<(), QueueError> {
        if signature == &self.signature {
            Ok(())
        } else {
            Err(QueueError::SignatureMismatch)
        }
    }

    /// Register a worker and hand it the configuration to run with.
    ///
    /// Workers listed in the server configuration get their configured
    /// settings; others keep what they declared.
    pub async fn register_worker(
        &self,
        worker_id: WorkerId,
        declared: Option<WorkerConfiguration>,
    ) -> Result<WorkerConfiguration, QueueError> {
        let known = &self.settings.known_workers;
        let mut configuration = match known.get(&worker_id) {
            Some(configured) => configured.clone(),
            None if !known.is_empty() => {
                warn!(worker_id = %worker_id, "Refusing registration of unknown worker");
                return Err(QueueError::WorkerNotAllowed(worker_id));
            }
            None => declared.unwrap_or_else(|| WorkerConfiguration {
                report_alive_interval_secs: self.settings.aliveness.default_report_alive_interval_secs,
                ..Default::default()
            }),
        };
        if let Err(message) = validate_report_alive_interval(configuration.report_alive_interval_secs) {
            warn!(worker_id = %worker_id, reason = %message, "Refusing worker configuration");
            return Err(QueueError::InvalidWorkerConfiguration { worker_id, message });
        }
        configuration.payload_signature = Some(self.signature.clone());

        let now = self.clock.now();
        self.termination.indicate_activity(now);
        self.tracker
            .write()
            .await
            .register(&worker_id, configuration.clone(), now);
        Ok(configuration)
    }

    pub async fn report_alive(&self, worker_id: &WorkerId) -> Result<AlivenessStatus, QueueError> {
        let now = self.clock.now();
        self.tracker.write().await.report_alive(worker_id, now)
    }

    pub async fn fetch_bucket(
        &self,
        request: FetchBucketRequest,
    ) -> Result<FetchBucketResponse, QueueError> {
        self.verify_signature(&request.payload_signature)?;
        let now = self.clock.now();
        self.termination.indicate_activity(now);

        let mut queue = self.queue.lock().await;
        let mut tracker = self.tracker.write().await;
        let worker_id = &request.worker_id;

        let reason = match tracker.eligibility(worker_id) {
            Eligibility::Eligible => None,
            Eligibility::Silent => return Ok(self.check_again_later()),
            Eligibility::NotRegistered => Some(format!("worker {} is not registered", worker_id)),
            Eligibility::Lost => Some(format!(
                "worker {} was declared lost and must register again",
                worker_id
            )),
            Eligibility::Blocked => Some(format!("worker {} is blocked", worker_id)),
        };
        if let Some(reason) = reason {
            debug!(worker_id = %worker_id, reason = %reason, "Worker may not receive buckets");
            return Ok(FetchBucketResponse::WorkerSpecificError { reason });
        }

        let response = match queue.dequeue_bucket(worker_id, &request.request_id, now) {
            DequeueResult::Dequeued(dequeued) => {
                tracker.did_dequeue(worker_id, &dequeued.bucket.bucket_id);
                info!(
                    worker_id = %worker_id,
                    request_id = %request.request_id,
                    bucket_id = %dequeued.bucket.bucket_id,
                    job_id = %dequeued.bucket.job_id,
                    tests = dequeued.bucket.test_entries.len(),
                    "Bucket dequeued"
                );
                FetchBucketResponse::Bucket {
                    bucket: dequeued.bucket,
                }
            }
            DequeueResult::CheckAgainLater => self.check_again_later(),
            DequeueResult::Exhausted => match self.settings.worker_policy {
                WorkerAlivenessPolicy::StayAlive => self.check_again_later(),
                WorkerAlivenessPolicy::TerminateWhenDepleted => {
                    debug!(worker_id = %worker_id, "Queue depleted");
                    FetchBucketResponse::QueueDepleted
                }
            },
        };
        Ok(response)
    }

    fn check_again_later(&self) -> FetchBucketResponse {
        FetchBucketResponse::CheckAgainLater {
            after_secs: self.settings.check_again_after.as_secs(),
        }
    }

    pub async fn submit_result(
        &self,
        request: SubmitResultRequest,
    ) -> Result<SubmitResultResponse, QueueError> {
        self.verify_signature(&request.payload_signature)?;
        let now = self.clock.now();
        self.termination.indicate_activity(now);

        let mut queue = self.queue.lock().await;
        let mut tracker = self.tracker.write().await;
        let worker_id = &request.worker_id;
        if !tracker.is_known(worker_id) {
            return Err(QueueError::UnknownWorker(worker_id.clone()));
        }

        let bucket_id = request.testing_result.bucket_id.clone();
        match queue.accept(request.testing_result, worker_id, &request.request_id)? {
            Acceptance::Accepted {
                bucket_id,
                retry_bucket_id,
            } => {
                tracker.did_finish(worker_id, &bucket_id);
                info!(
                    worker_id = %worker_id,
                    bucket_id = %bucket_id,
                    retry_bucket_id = ?retry_bucket_id,
                    "Result accepted"
                );
                Ok(SubmitResultResponse::Accepted {
                    bucket_id,
                    retry_bucket_id,
                })
            }
            Acceptance::Stale { reason } => {
                info!(
                    worker_id = %worker_id,
                    request_id = %request.request_id,
                    bucket_id = %bucket_id,
                    reason = %reason,
                    "Ignoring stale result"
                );
                Ok(SubmitResultResponse::Ignored { reason })
            }
        }
    }

    /// Split tests into buckets and add them to a job.
    pub async fn schedule_tests(
        &self,
        request: ScheduleTestsRequest,
    ) -> Result<ScheduleTestsResponse, QueueError> {
        let _lock = self.termination.lock();
        self.termination.indicate_activity(self.clock.now());

        let worker_count = match request.worker_count {
            Some(count) => count,
            None => self.default_worker_count().await,
        };
        let template = BucketTemplate {
            job_id: request.job_id.clone(),
            priority: request.priority,
            build_artifacts: request.build_artifacts,
            execution_behavior: request.execution_behavior,
            timeout_configuration: request.timeout_configuration,
            destination: request.destination,
        };
        let buckets = split_into_buckets(
            &request.tests,
            worker_count,
            request.strategy,
            &template,
            self.ids.as_ref(),
        )?;
        let bucket_count = buckets.len();

        let job = self
            .queue
            .lock()
            .await
            .enqueue(request.job_id.clone(), request.priority, buckets)?;
        info!(
            job_id = %job.job_id,
            priority = %job.priority,
            tests = request.tests.len(),
            buckets = bucket_count,
            worker_count,
            strategy = ?request.strategy,
            "Tests scheduled"
        );
        Ok(ScheduleTestsResponse {
            job_id: job.job_id,
            bucket_count,
        })
    }

    /// Configured workers, else the workers alive right now, at least one.
    async fn default_worker_count(&self) -> u32 {
        let count = match self.settings.known_workers.len() {
            0 => self.tracker.read().await.alive_count(),
            n => n,
        };
        u32::try_from(count).unwrap_or(u32::MAX).max(1)
    }

    pub async fn job_results(&self, job_id: &JobId) -> Result<JobResults, QueueError> {
        self.queue.lock().await.results(job_id)
    }

    pub async fn job_state(&self, job_id: &JobId) -> Result<JobState, QueueError> {
        self.queue.lock().await.state(job_id)
    }

    pub async fn delete_job(&self, job_id: &JobId) -> Result<JobState, QueueError> {
        self.queue.lock().await.delete(job_id)
    }

    pub async fn set_worker_blocked(
        &self,
        worker_id: &WorkerId,
        blocked: bool,
    ) -> Result<WorkerAliveness, QueueError> {
        self.tracker
            .write()
            .await
            .set_blocked(worker_id, blocked)
            .cloned()
    }

    pub async fn workers(&self) -> Vec<WorkerAliveness> {
        self.tracker.read().await.workers()
    }

    pub async fn workers_by_status(&self) -> BTreeMap<AlivenessStatus, Vec<WorkerId>> {
        self.tracker.read().await.workers_by_status()
    }

    pub async fn worker(&self, worker_id: &WorkerId) -> WorkerAliveness {
        self.tracker.read().await.aliveness(worker_id)
    }

    pub async fn currently_processing(&self) -> ProcessingBucketsResponse {
        let processing = self.tracker.read().await.currently_processing();
        ProcessingBucketsResponse {
            workers: processing
                .into_iter()
                .map(|(worker, buckets)| (worker, buckets.into_iter().collect()))
                .collect(),
        }
    }

    /// Detect silent and lost workers and reclaim the buckets of silent ones.
    pub async fn sweep(&self) -> Vec<AlivenessTransition> {
        let now = self.clock.now();
        let mut queue = self.queue.lock().await;
        let mut tracker = self.tracker.write().await;

        let transitions = tracker.sweep(now);
        for transition in &transitions {
            if transition.status != AlivenessStatus::Silent {
                continue;
            }
            let reclaimed = queue.reclaim(&transition.worker_id);
            if !reclaimed.is_empty() {
                info!(
                    worker_id = %transition.worker_id,
                    buckets = ?reclaimed,
                    "Reclaimed buckets of silent worker"
                );
            }
        }
        transitions
    }

    pub async fn is_depleted(&self) -> bool {
        self.queue.lock().await.is_depleted()
    }

    /// Whether the termination policy allows the server to exit now.
    pub async fn may_terminate(&self) -> bool {
        let depleted = self.is_depleted().await;
        self.termination.may_terminate(depleted, self.clock.now())
    }
}
