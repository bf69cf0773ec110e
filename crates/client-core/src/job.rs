use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::WorkerError;

/// Valid coordinator-side job states; the agent only ever advances forward through these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Available,
    Claimed,
    Started,
    Finished,
    Failed,
}

/// Job descriptor as returned by the coordinator's fetch endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct JobDescriptor {
    #[serde(rename = "Job")]
    pub job: JobBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobBody {
    #[serde(rename = "URLS")]
    pub urls: JobUrls,
    #[serde(rename = "Environment", default)]
    pub environment: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobUrls {
    #[serde(rename = "URL-claim")]
    pub claim: String,
    #[serde(rename = "URL-status")]
    pub status: String,
    #[serde(rename = "URL-output")]
    pub output: String,
    #[serde(rename = "URL-source")]
    pub source: String,
    #[serde(rename = "URL-target", default)]
    pub target: Option<String>,
    #[serde(rename = "URL-image", default)]
    pub image: Option<String>,
}

/// Operations the job-API client must expose for a `JobHandle` to drive a job to completion.
/// Kept separate from any concrete HTTP implementation so this crate never depends on reqwest.
pub trait JobApi {
    async fn fetch_job(
        &self,
        job_type: Option<&str>,
        project: Option<&str>,
    ) -> Result<Option<JobDescriptor>, WorkerError>;

    async fn claim(&self, url: &str, worker_name: &str) -> Result<(), WorkerError>;

    async fn send_status(
        &self,
        url: &str,
        status: JobStatus,
        processing_time: Option<f64>,
    ) -> Result<(), WorkerError>;

    async fn send_output(&self, url: &str, text: &str) -> Result<(), WorkerError>;

    async fn get_job_list(&self, project: &str) -> Result<serde_json::Value, WorkerError>;
}

/// Convenience wrapper over a fetched descriptor plus a single-shot claim latch.
///
/// `claimed` only ever moves from false to true; once set it never resets for the lifetime of
/// this handle.
pub struct JobHandle {
    descriptor: JobDescriptor,
    claimed: bool,
}

impl JobHandle {
    pub fn new(descriptor: JobDescriptor) -> Self {
        Self {
            descriptor,
            claimed: false,
        }
    }

    /// Fetch a job from the coordinator. Returns `None` if the client reports no job available.
    pub async fn fetch<C: JobApi>(
        client: &C,
        job_type: Option<&str>,
        project: Option<&str>,
    ) -> Result<Option<Self>, WorkerError> {
        let descriptor = client.fetch_job(job_type, project).await?;
        Ok(descriptor.map(JobHandle::new))
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed
    }

    pub fn url_source(&self) -> &str {
        &self.descriptor.job.urls.source
    }

    pub fn url_target(&self) -> Option<&str> {
        self.descriptor.job.urls.target.as_deref()
    }

    pub fn url_image(&self) -> Option<&str> {
        self.descriptor.job.urls.image.as_deref()
    }

    pub fn url_output(&self) -> &str {
        &self.descriptor.job.urls.output
    }

    pub fn environment(&self) -> &HashMap<String, String> {
        &self.descriptor.job.environment
    }

    /// Claim the job. A no-op if already claimed; on any API error the latch stays false and
    /// the error propagates.
    pub async fn claim<C: JobApi>(&mut self, client: &C, worker_name: &str) -> Result<(), WorkerError> {
        if self.claimed {
            return Ok(());
        }
        client
            .claim(&self.descriptor.job.urls.claim, worker_name)
            .await?;
        self.claimed = true;
        Ok(())
    }

    pub async fn send_status<C: JobApi>(
        &self,
        client: &C,
        status: JobStatus,
        processing_time: Option<f64>,
    ) -> Result<(), WorkerError> {
        client
            .send_status(&self.descriptor.job.urls.status, status, processing_time)
            .await
    }

    pub async fn send_output<C: JobApi>(&self, client: &C, text: &str) -> Result<(), WorkerError> {
        client
            .send_output(&self.descriptor.job.urls.output, text)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingClient {
        claim_calls: AtomicUsize,
        claimed_urls: Mutex<Vec<String>>,
    }

    impl JobApi for CountingClient {
        async fn fetch_job(
            &self,
            _job_type: Option<&str>,
            _project: Option<&str>,
        ) -> Result<Option<JobDescriptor>, WorkerError> {
            Ok(None)
        }

        async fn claim(&self, url: &str, _worker_name: &str) -> Result<(), WorkerError> {
            self.claim_calls.fetch_add(1, Ordering::SeqCst);
            self.claimed_urls.lock().unwrap().push(url.to_string());
            Ok(())
        }

        async fn send_status(
            &self,
            _url: &str,
            _status: JobStatus,
            _processing_time: Option<f64>,
        ) -> Result<(), WorkerError> {
            Ok(())
        }

        async fn send_output(&self, _url: &str, _text: &str) -> Result<(), WorkerError> {
            Ok(())
        }

        async fn get_job_list(&self, _project: &str) -> Result<serde_json::Value, WorkerError> {
            Ok(serde_json::Value::Null)
        }
    }

    fn sample_descriptor() -> JobDescriptor {
        JobDescriptor {
            job: JobBody {
                urls: JobUrls {
                    claim: "http://coordinator/claim".into(),
                    status: "http://coordinator/status".into(),
                    output: "http://coordinator/output".into(),
                    source: "http://example.com/source".into(),
                    target: None,
                    image: None,
                },
                environment: HashMap::new(),
            },
        }
    }

    #[tokio::test]
    async fn claim_is_a_no_op_once_latched() {
        let client = CountingClient {
            claim_calls: AtomicUsize::new(0),
            claimed_urls: Mutex::new(Vec::new()),
        };
        let mut handle = JobHandle::new(sample_descriptor());

        handle.claim(&client, "worker1").await.unwrap();
        handle.claim(&client, "worker1").await.unwrap();
        handle.claim(&client, "worker1").await.unwrap();

        assert!(handle.is_claimed());
        assert_eq!(client.claim_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn accessors_expose_descriptor_fields() {
        let handle = JobHandle::new(sample_descriptor());
        assert_eq!(handle.url_source(), "http://example.com/source");
        assert_eq!(handle.url_target(), None);
        assert_eq!(handle.url_image(), None);
    }
}
