//! HTTP client for the queue server.

use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde_json::Value;
use testfleet_core::protocol::{
    AckResponse, FetchBucketRequest, FetchBucketResponse, ProcessingBucketsResponse,
    QueueVersionResponse, RegisterWorkerRequest, ScheduleTestsRequest, ScheduleTestsResponse,
    SubmitResultRequest, SubmitResultResponse,
};
use testfleet_core::{JobId, JobResults, JobState, WorkerAliveness, WorkerConfiguration, WorkerId};
use url::Url;

use crate::{ClientError, ClientResult};

/// Queue server API client.
#[derive(Debug, Clone)]
pub struct QueueClient {
    client: reqwest::Client,
    base_url: Url,
}

impl QueueClient {
    /// Client for the server at `base_url`, e.g. `http://queue:41000`.
    pub fn new(base_url: &str) -> ClientResult<Self> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> ClientResult<Url> {
        Ok(self.base_url.join("api/v1/")?.join(path)?)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> ClientResult<T> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
                .unwrap_or(text);
            return Err(ClientError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }

    pub async fn version(&self) -> ClientResult<String> {
        let response: QueueVersionResponse =
            self.send(self.client.get(self.url("version")?)).await?;
        Ok(response.version)
    }

    pub async fn register(
        &self,
        worker_id: &WorkerId,
        configuration: Option<WorkerConfiguration>,
    ) -> ClientResult<WorkerConfiguration> {
        let url = self.url(&format!("workers/{}/register", worker_id))?;
        self.send(
            self.client
                .post(url)
                .json(&RegisterWorkerRequest { configuration }),
        )
        .await
    }

    pub async fn report_alive(&self, worker_id: &WorkerId) -> ClientResult<()> {
        let url = self.url(&format!("workers/{}/alive", worker_id))?;
        let _: AckResponse = self.send(self.client.post(url)).await?;
        Ok(())
    }

    pub async fn set_blocked(
        &self,
        worker_id: &WorkerId,
        blocked: bool,
    ) -> ClientResult<WorkerAliveness> {
        let action = if blocked { "block" } else { "unblock" };
        let url = self.url(&format!("workers/{}/{}", worker_id, action))?;
        self.send(self.client.post(url)).await
    }

    pub async fn workers(&self) -> ClientResult<Vec<WorkerAliveness>> {
        self.send(self.client.get(self.url("workers")?)).await
    }

    pub async fn fetch_bucket(
        &self,
        request: &FetchBucketRequest,
    ) -> ClientResult<FetchBucketResponse> {
        self.send(self.client.post(self.url("buckets/fetch")?).json(request))
            .await
    }

    pub async fn submit_result(
        &self,
        request: &SubmitResultRequest,
    ) -> ClientResult<SubmitResultResponse> {
        self.send(self.client.post(self.url("buckets/results")?).json(request))
            .await
    }

    pub async fn processing_buckets(&self) -> ClientResult<ProcessingBucketsResponse> {
        self.send(self.client.get(self.url("buckets/processing")?))
            .await
    }

    pub async fn schedule_tests(
        &self,
        request: &ScheduleTestsRequest,
    ) -> ClientResult<ScheduleTestsResponse> {
        self.send(self.client.post(self.url("jobs")?).json(request))
            .await
    }

    pub async fn job_state(&self, job_id: &JobId) -> ClientResult<JobState> {
        let url = self.url(&format!("jobs/{}", job_id))?;
        self.send(self.client.get(url)).await
    }

    pub async fn job_results(&self, job_id: &JobId) -> ClientResult<JobResults> {
        let url = self.url(&format!("jobs/{}/results", job_id))?;
        self.send(self.client.get(url)).await
    }

    pub async fn delete_job(&self, job_id: &JobId) -> ClientResult<JobState> {
        let url = self.url(&format!("jobs/{}", job_id))?;
        self.send(self.client.delete(url)).await
    }
}
