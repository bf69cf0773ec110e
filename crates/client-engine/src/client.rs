//! Authenticated HTTP client for the coordinator, with bearer-token renewal and bounded
//! retry-with-backoff around transport failures only.

use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio::time::sleep;
use uworker_core::job::{JobApi, JobDescriptor, JobStatus};
use uworker_core::{validate_project_name, Credentials, WorkerError};

/// Default retry ceiling for a single logical API call.
pub const DEFAULT_RETRIES: u32 = 200;

/// Backoff schedule between retry attempts of a single API call.
#[derive(Debug, Clone)]
pub enum BackoffSchedule {
    /// A fixed delay, used by callers (and tests) that want a constant inter-retry wait.
    Fixed(Duration),
    /// `min(3^n, 300)` seconds for attempt `n`, the coordinator's default.
    Exponential,
}

impl BackoffSchedule {
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffSchedule::Fixed(d) => *d,
            BackoffSchedule::Exponential => {
                let secs = 3f64.powi(attempt.min(i32::MAX as u32) as i32).min(300.0);
                Duration::from_secs_f64(secs)
            }
        }
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        BackoffSchedule::Exponential
    }
}

/// Authenticated, retrying HTTP client talking to the coordinator's job API.
pub struct JobApiClient {
    http: reqwest::Client,
    api_root: String,
    credentials: Option<Credentials>,
    token: RwLock<Option<String>>,
    retries: u32,
    backoff: BackoffSchedule,
}

impl JobApiClient {
    pub fn new(api_root: impl Into<String>, credentials: Option<Credentials>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_root: api_root.into().trim_end_matches('/').to_string(),
            credentials,
            token: RwLock::new(None),
            retries: DEFAULT_RETRIES,
            backoff: BackoffSchedule::default(),
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffSchedule) -> Self {
        self.backoff = backoff;
        self
    }

    fn project_uri(&self, project: &str) -> Result<String, WorkerError> {
        if !validate_project_name(project) {
            return Err(WorkerError::InvalidArgument(format!(
                "unsupported project name: {project:?}"
            )));
        }
        Ok(format!("{}/v4/{}", self.api_root, project))
    }

    /// Retry only transport-level failures, up to `self.retries` additional attempts.
    async fn transport_retry<F, Fut>(&self, mut make_request: F) -> Result<reqwest::Response, WorkerError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        let mut last_err = None;
        for attempt in 0..=self.retries {
            match make_request().await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    last_err = Some(err);
                    if attempt < self.retries {
                        sleep(self.backoff.delay(attempt)).await;
                    }
                }
            }
        }
        let err = last_err.expect("loop runs at least once since retries >= 0");
        Err(WorkerError::Transport(err.to_string()))
    }

    /// Acquire (or re-acquire) a bearer token via basic auth against `credentials`.
    async fn renew_token(&self) -> Result<(), WorkerError> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or(WorkerError::Unauthenticated)?;
        let url = format!("{}/token", self.api_root);

        let response = self
            .transport_retry(|| {
                self.http
                    .get(&url)
                    .basic_auth(&creds.username, Some(&creds.password))
                    .send()
            })
            .await?;

        if response.status().as_u16() >= 300 {
            return Err(WorkerError::Api {
                status: response.status().as_u16(),
                reason: reason_phrase(&response),
            });
        }

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            token: String,
        }
        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|err| WorkerError::Transport(err.to_string()))?;
        *self.token.write().await = Some(parsed.token);
        Ok(())
    }

    /// Send one request using the currently-held token, retrying transport failures.
    async fn send_authenticated(
        &self,
        method: &reqwest::Method,
        url: &str,
        body: &Option<Value>,
    ) -> Result<reqwest::Response, WorkerError> {
        let token = self.token.read().await.clone();
        self.transport_retry(|| {
            let mut req = self.http.request(method.clone(), url);
            if let Some(token) = &token {
                req = req.basic_auth(token, Some(""));
            }
            if let Some(body) = body {
                req = req.json(body);
            }
            req.send()
        })
        .await
    }

    /// Issue one logical call: resolves auth, retries transport failures, renews the token
    /// exactly once on a 401, and maps a final status >= 300 to an API error.
    async fn call(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<Value>,
    ) -> Result<reqwest::Response, WorkerError> {
        if self.token.read().await.is_none() {
            self.renew_token().await?;
        }

        let response = self.send_authenticated(&method, url, &body).await?;

        let response = if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            *self.token.write().await = None;
            self.renew_token().await?;
            self.send_authenticated(&method, url, &body).await?
        } else {
            response
        };

        if response.status().as_u16() >= 300 {
            return Err(WorkerError::Api {
                status: response.status().as_u16(),
                reason: reason_phrase(&response),
            });
        }

        Ok(response)
    }
}

fn reason_phrase(response: &reqwest::Response) -> String {
    response
        .status()
        .canonical_reason()
        .unwrap_or("unknown")
        .to_string()
}

impl JobApi for JobApiClient {
    async fn fetch_job(
        &self,
        job_type: Option<&str>,
        project: Option<&str>,
    ) -> Result<Option<JobDescriptor>, WorkerError> {
        let mut url = match project {
            Some(project) => format!("{}/jobs/fetch", self.project_uri(project)?),
            None => format!("{}/v4/projects/jobs/fetch", self.api_root),
        };
        if let Some(job_type) = job_type {
            url.push_str(&format!("?type={job_type}"));
        }

        match self.call(reqwest::Method::GET, &url, None).await {
            Ok(response) => {
                let descriptor = response
                    .json()
                    .await
                    .map_err(|err| WorkerError::Transport(err.to_string()))?;
                Ok(Some(descriptor))
            }
            Err(WorkerError::Api { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn claim(&self, url: &str, worker_name: &str) -> Result<(), WorkerError> {
        let body = json!({ "Worker": worker_name });
        self.call(reqwest::Method::PUT, url, Some(body)).await?;
        Ok(())
    }

    async fn send_status(
        &self,
        url: &str,
        status: JobStatus,
        processing_time: Option<f64>,
    ) -> Result<(), WorkerError> {
        #[derive(Serialize)]
        struct StatusBody {
            #[serde(rename = "Status")]
            status: JobStatus,
            #[serde(rename = "ProcessingTime")]
            processing_time: Option<f64>,
        }
        let body = serde_json::to_value(StatusBody {
            status,
            processing_time,
        })
        .expect("StatusBody always serializes");
        self.call(reqwest::Method::PUT, url, Some(body)).await?;
        Ok(())
    }

    async fn send_output(&self, url: &str, text: &str) -> Result<(), WorkerError> {
        let body = json!({ "Output": text });
        self.call(reqwest::Method::PUT, url, Some(body)).await?;
        Ok(())
    }

    async fn get_job_list(&self, project: &str) -> Result<Value, WorkerError> {
        let url = format!("{}/jobs", self.project_uri(project)?);
        let response = self.call(reqwest::Method::GET, &url, None).await?;
        response
            .json()
            .await
            .map_err(|err| WorkerError::Transport(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_matches_min_3_pow_n_300() {
        let schedule = BackoffSchedule::Exponential;
        for n in 0..8u32 {
            let expected = (3f64.powi(n as i32)).min(300.0);
            assert_eq!(schedule.delay(n), Duration::from_secs_f64(expected));
        }
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let schedule = BackoffSchedule::Fixed(Duration::from_secs(5));
        assert_eq!(schedule.delay(0), Duration::from_secs(5));
        assert_eq!(schedule.delay(10), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn fetch_job_rejects_invalid_project_name() {
        let client = JobApiClient::new("http://example.invalid", None);
        let err = client.fetch_job(None, Some("1bad")).await.unwrap_err();
        assert!(matches!(err, WorkerError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn fetch_job_maps_404_to_none() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/token"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(json!({"token": "t"})))
            .mount(&server)
            .await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/v4/proj/jobs/fetch"))
            .respond_with(wiremock::ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = JobApiClient::new(
            server.uri(),
            Some(Credentials {
                username: "w".into(),
                password: "p".into(),
            }),
        );

        let result = client.fetch_job(None, Some("proj")).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn renews_token_exactly_once_on_401() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/token"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(json!({"token": "t"})))
            .mount(&server)
            .await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/v4/proj/jobs"))
            .respond_with(wiremock::ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = JobApiClient::new(
            server.uri(),
            Some(Credentials {
                username: "w".into(),
                password: "p".into(),
            }),
        );

        let err = client.get_job_list("proj").await.unwrap_err();
        assert_eq!(err.api_status(), Some(401));
    }
}
