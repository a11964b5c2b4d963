//! Worker that executes buckets fetched from the queue.

use std::sync::Arc;
use std::time::Duration;

use testfleet_core::executor::{TestExecutor, lost_result};
use testfleet_core::protocol::{
    FetchBucketRequest, FetchBucketResponse, SubmitResultRequest, SubmitResultResponse,
};
use testfleet_core::{
    Bucket, IdGenerator, PayloadSignature, RequestId, UuidIdGenerator, WorkerConfiguration,
    WorkerId,
};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ClientError, ClientResult, QueueClient};

/// Tuning knobs of the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Refuse to work for a server reporting a different version.
    pub expected_version: Option<String>,
    /// Configuration declared at registration.
    pub configuration: Option<WorkerConfiguration>,
    /// Delay before retrying after a failed request.
    pub retry_delay: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            expected_version: None,
            configuration: None,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// What a worker did before it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub buckets_executed: usize,
    pub results_ignored: usize,
}

/// A worker that fetches and executes buckets.
pub struct Worker {
    id: WorkerId,
    client: QueueClient,
    executor: Arc<dyn TestExecutor>,
    ids: Arc<dyn IdGenerator>,
    options: WorkerOptions,
}

/// Registration the worker currently runs under.
struct Session {
    configuration: WorkerConfiguration,
    signature: PayloadSignature,
}

impl Worker {
    pub fn new(id: impl Into<WorkerId>, client: QueueClient, executor: Arc<dyn TestExecutor>) -> Self {
        Self {
            id: id.into(),
            client,
            executor,
            ids: Arc::new(UuidIdGenerator),
            options: WorkerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Run until the queue is depleted, the server rejects this worker or
    /// `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> ClientResult<WorkerSummary> {
        info!(worker_id = %self.id, executor = self.executor.name(), "Starting worker");

        if let Some(expected) = &self.options.expected_version {
            let actual = self.client.version().await?;
            if &actual != expected {
                return Err(ClientError::VersionMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let mut session = self.register().await?;
        let heartbeat_cancel = cancel.child_token();
        let heartbeat = self.spawn_heartbeat(&session.configuration, heartbeat_cancel.clone());

        let outcome = self.work(&mut session, &cancel).await;

        heartbeat_cancel.cancel();
        if let Err(e) = heartbeat.await {
            warn!(worker_id = %self.id, error = %e, "Heartbeat task failed");
        }
        info!(worker_id = %self.id, outcome = ?outcome, "Worker stopped");
        outcome
    }

    async fn register(&self) -> ClientResult<Session> {
        let configuration = self
            .client
            .register(&self.id, self.options.configuration.clone())
            .await?;
        let signature = configuration
            .payload_signature
            .clone()
            .ok_or_else(|| ClientError::Rejected("registration returned no payload signature".to_string()))?;
        info!(worker_id = %self.id, "Registered with queue");
        Ok(Session {
            configuration,
            signature,
        })
    }

    fn spawn_heartbeat(
        &self,
        configuration: &WorkerConfiguration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let client = self.client.clone();
        let worker_id = self.id.clone();
        let period = Duration::from_secs(configuration.report_alive_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = client.report_alive(&worker_id).await {
                            warn!(worker_id = %worker_id, error = %e, "Failed to report alive");
                        }
                    }
                }
            }
        })
    }

    async fn work(
        &self,
        session: &mut Session,
        cancel: &CancellationToken,
    ) -> ClientResult<WorkerSummary> {
        let mut summary = WorkerSummary::default();
        // Set when a fetch got no answer; the server may have dequeued a
        // bucket under that id, and asking again returns the same bucket.
        let mut unanswered: Option<RequestId> = None;

        loop {
            if cancel.is_cancelled() {
                return Ok(summary);
            }

            let request_id = unanswered
                .take()
                .unwrap_or_else(|| RequestId::new(self.ids.generate()));
            let fetch = FetchBucketRequest {
                worker_id: self.id.clone(),
                request_id: request_id.clone(),
                payload_signature: session.signature.clone(),
            };

            match self.client.fetch_bucket(&fetch).await {
                Ok(FetchBucketResponse::Bucket { bucket }) => {
                    info!(
                        worker_id = %self.id,
                        bucket_id = %bucket.bucket_id,
                        tests = bucket.test_entries.len(),
                        "Fetched bucket"
                    );
                    let ignored = self
                        .execute_and_submit(session, request_id, bucket)
                        .await?;
                    summary.buckets_executed += 1;
                    if ignored {
                        summary.results_ignored += 1;
                    }
                }
                Ok(FetchBucketResponse::CheckAgainLater { after_secs }) => {
                    debug!(worker_id = %self.id, after_secs, "No bucket available");
                    self.pause(Duration::from_secs(after_secs), cancel).await;
                }
                Ok(FetchBucketResponse::QueueDepleted) => {
                    info!(worker_id = %self.id, "Queue depleted");
                    return Ok(summary);
                }
                Ok(FetchBucketResponse::WorkerSpecificError { reason }) => {
                    warn!(worker_id = %self.id, reason = %reason, "Queue refused this worker");
                    return Err(ClientError::Rejected(reason));
                }
                Err(e) if e.status() == Some(401) => {
                    warn!(worker_id = %self.id, "Payload signature rejected, registering again");
                    *session = self.register().await?;
                }
                Err(e) => {
                    warn!(
                        worker_id = %self.id,
                        request_id = %request_id,
                        error = %e,
                        "Failed to fetch bucket, retrying with the same request id"
                    );
                    unanswered = Some(request_id);
                    self.pause(self.options.retry_delay, cancel).await;
                }
            }
        }
    }

    /// Execute a bucket and submit its result under the fetch's request id.
    /// Returns whether the queue ignored the result.
    async fn execute_and_submit(
        &self,
        session: &Session,
        request_id: RequestId,
        bucket: Bucket,
    ) -> ClientResult<bool> {
        let testing_result = match self.executor.execute(&bucket, &session.configuration).await {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    worker_id = %self.id,
                    bucket_id = %bucket.bucket_id,
                    error = %e,
                    "Executor failed, reporting tests as lost"
                );
                lost_result(&bucket)
            }
        };

        let submit = SubmitResultRequest {
            worker_id: self.id.clone(),
            request_id,
            payload_signature: session.signature.clone(),
            testing_result,
        };
        match self.client.submit_result(&submit).await? {
            SubmitResultResponse::Accepted {
                bucket_id,
                retry_bucket_id,
            } => {
                debug!(
                    worker_id = %self.id,
                    bucket_id = %bucket_id,
                    retry_bucket_id = ?retry_bucket_id,
                    "Result accepted"
                );
                Ok(false)
            }
            SubmitResultResponse::Ignored { reason } => {
                info!(worker_id = %self.id, reason = %reason, "Result ignored by queue");
                Ok(true)
            }
        }
    }

    async fn pause(&self, delay: Duration, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = sleep(delay) => {}
        }
    }
}
