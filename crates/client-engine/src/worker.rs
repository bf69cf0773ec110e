//! Top-level worker loop: fetch, claim, execute, report. Single job in flight at a time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use uworker_core::job::{JobApi, JobHandle, JobStatus};
use uworker_core::{Platform, WorkerError};

use crate::executor::{CommandExecutor, ContainerExecutor};

const CLAIM_RETRIES: u32 = 5;

/// Which capability this worker offers the coordinator: a preconfigured command it runs
/// against jobs from one project, or a container runtime it uses to run whatever image a
/// job carries.
#[derive(Debug, Clone)]
pub enum WorkerMode {
    Command {
        job_command: String,
        project: String,
        job_type: Option<String>,
    },
    Image {
        project: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub mode: WorkerMode,
    pub hostname: String,
    pub idle_sleep: Duration,
    pub error_sleep: Duration,
    pub job_timeout: Option<u64>,
    pub kill_after: u64,
    pub container_runtime: String,
    pub external_username: Option<String>,
    pub external_password: Option<String>,
}

/// Drives jobs to completion against a job-API client, using a capability-injected
/// [`Platform`] so tests never have to touch real cgroup files or shell out.
pub struct WorkerLoop<C, P> {
    client: Arc<C>,
    platform: P,
    config: WorkerConfig,
    worker_name: String,
    job_count: AtomicU64,
}

impl<C, P> WorkerLoop<C, P>
where
    C: JobApi + Send + Sync + 'static,
    P: Platform,
{
    pub fn new(client: C, platform: P, config: WorkerConfig) -> Result<Self, WorkerError> {
        match &config.mode {
            WorkerMode::Image { .. } => {
                if platform.in_docker() {
                    return Err(WorkerError::Configuration(
                        "image mode must not be started from within a container".into(),
                    ));
                }
                if !platform.container_runtime_available() {
                    return Err(WorkerError::Configuration(
                        "image mode requires a working connection to the container runtime".into(),
                    ));
                }
            }
            WorkerMode::Command { .. } => {}
        }

        let worker_name = format!("UWorker_{}", config.hostname);

        Ok(Self {
            client: Arc::new(client),
            platform,
            config,
            worker_name,
            job_count: AtomicU64::new(0),
        })
    }

    pub fn job_count(&self) -> u64 {
        self.job_count.load(Ordering::SeqCst)
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// Run until `alive` is cleared. Unhandled errors from a single iteration are logged and
    /// followed by an error-sleep; they never terminate the loop.
    pub async fn run(&self, alive: Arc<AtomicBool>) {
        while alive.load(Ordering::SeqCst) {
            if let Err(err) = self.run_once().await {
                tracing::error!(error = %err, "unhandled error in worker loop");
                sleep(self.config.error_sleep).await;
            }
        }
    }

    fn fetch_params(&self) -> (Option<&str>, Option<&str>) {
        match &self.config.mode {
            WorkerMode::Command {
                project, job_type, ..
            } => (job_type.as_deref(), Some(project.as_str())),
            WorkerMode::Image { project } => (None, project.as_deref()),
        }
    }

    async fn run_once(&self) -> Result<(), WorkerError> {
        let (job_type, project) = self.fetch_params();
        let mut handle = match JobHandle::fetch(self.client.as_ref(), job_type, project).await? {
            Some(handle) => handle,
            None => {
                sleep(self.config.idle_sleep).await;
                return Ok(());
            }
        };

        if handle.url_image().is_some() && matches!(self.config.mode, WorkerMode::Command { .. }) {
            tracing::warn!("received a job requiring an image while running in command mode; skipping");
            sleep(self.config.idle_sleep).await;
            return Ok(());
        }

        if !self.claim_with_retry(&mut handle).await? {
            return Ok(());
        }

        handle
            .send_status(self.client.as_ref(), JobStatus::Started, None)
            .await?;

        let mut args = vec![handle.url_source().to_string()];
        if let Some(target) = handle.url_target() {
            args.push(target.to_string());
            if let Some(username) = &self.config.external_username {
                args.push(username.clone());
            }
            if let Some(password) = &self.config.external_password {
                args.push(password.clone());
            }
        }

        let output_url = handle.url_output().to_string();
        let client_for_output = self.client.clone();
        // Mid-stream emissions run in the background; the executor awaits the *final*
        // emission's task before `execute()` returns, so the terminal status report below
        // always follows the last `send_output` call, per the ordering this loop guarantees.
        let output_callback = move |text: String| {
            let client = client_for_output.clone();
            let url = output_url.clone();
            tokio::spawn(async move {
                if let Err(err) = client.send_output(&url, &text).await {
                    tracing::warn!(error = %err, "failed to send output to coordinator");
                }
            })
        };

        tracing::info!(job = handle.url_source(), "starting job");
        let outcome = match &self.config.mode {
            WorkerMode::Command { job_command, .. } => {
                let executor = CommandExecutor::from_command_line("Job", job_command);
                executor
                    .execute(
                        &args,
                        output_callback,
                        self.config.job_timeout,
                        self.config.kill_after,
                        self.platform.in_docker(),
                    )
                    .await?
            }
            WorkerMode::Image { .. } => {
                let image_url = handle.url_image().ok_or_else(|| {
                    WorkerError::Configuration("image job is missing url_image".into())
                })?;
                let executor = ContainerExecutor::new(
                    "Job",
                    &self.config.container_runtime,
                    image_url,
                    handle.environment(),
                    true,
                    Some("host"),
                );
                executor
                    .execute(&args, output_callback, self.config.job_timeout, self.config.kill_after)
                    .await?
            }
        };

        let status = if outcome.exit_code == 0 {
            JobStatus::Finished
        } else {
            JobStatus::Failed
        };
        handle
            .send_status(
                self.client.as_ref(),
                status,
                Some(outcome.processing_time.as_secs_f64()),
            )
            .await?;
        self.job_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Up to [`CLAIM_RETRIES`] attempts; a 409 conflict is terminal (another worker won).
    async fn claim_with_retry(&self, handle: &mut JobHandle) -> Result<bool, WorkerError> {
        for attempt in 0..CLAIM_RETRIES {
            match handle.claim(self.client.as_ref(), &self.worker_name).await {
                Ok(()) => return Ok(true),
                Err(err) if err.is_claim_conflict() => return Ok(false),
                Err(err) => {
                    tracing::error!(error = %err, attempt, "failed to claim job");
                    if attempt + 1 < CLAIM_RETRIES {
                        sleep(self.config.error_sleep).await;
                    }
                }
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use uworker_core::job::{JobBody, JobDescriptor, JobUrls};
    use uworker_core::FakePlatform;

    struct StubClient {
        descriptors: Mutex<Vec<JobDescriptor>>,
        claim_status: u16,
        statuses: Mutex<Vec<JobStatus>>,
        fetch_calls: AtomicUsize,
    }

    impl JobApi for StubClient {
        async fn fetch_job(
            &self,
            _job_type: Option<&str>,
            _project: Option<&str>,
        ) -> Result<Option<JobDescriptor>, WorkerError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.descriptors.lock().unwrap().pop())
        }

        async fn claim(&self, _url: &str, _worker_name: &str) -> Result<(), WorkerError> {
            if self.claim_status == 409 {
                Err(WorkerError::Api {
                    status: 409,
                    reason: "conflict".into(),
                })
            } else {
                Ok(())
            }
        }

        async fn send_status(
            &self,
            _url: &str,
            status: JobStatus,
            _processing_time: Option<f64>,
        ) -> Result<(), WorkerError> {
            self.statuses.lock().unwrap().push(status);
            Ok(())
        }

        async fn send_output(&self, _url: &str, _text: &str) -> Result<(), WorkerError> {
            Ok(())
        }

        async fn get_job_list(&self, _project: &str) -> Result<Value, WorkerError> {
            Ok(Value::Null)
        }
    }

    fn descriptor(image: Option<&str>) -> JobDescriptor {
        JobDescriptor {
            job: JobBody {
                urls: JobUrls {
                    claim: "http://coordinator/claim".into(),
                    status: "http://coordinator/status".into(),
                    output: "http://coordinator/output".into(),
                    source: "http://example.com/source".into(),
                    target: None,
                    image: image.map(String::from),
                },
                environment: HashMap::new(),
            },
        }
    }

    fn command_config() -> WorkerConfig {
        WorkerConfig {
            mode: WorkerMode::Command {
                job_command: "echo".into(),
                project: "demo".into(),
                job_type: None,
            },
            hostname: "host1".into(),
            idle_sleep: Duration::from_millis(1),
            error_sleep: Duration::from_millis(1),
            job_timeout: None,
            kill_after: 5,
            container_runtime: "docker".into(),
            external_username: None,
            external_password: None,
        }
    }

    #[tokio::test]
    async fn idles_on_empty_fetch() {
        let client = StubClient {
            descriptors: Mutex::new(vec![]),
            claim_status: 200,
            statuses: Mutex::new(vec![]),
            fetch_calls: AtomicUsize::new(0),
        };
        let worker = WorkerLoop::new(client, FakePlatform::default(), command_config()).unwrap();
        worker.run_once().await.unwrap();
        assert_eq!(worker.client.fetch_calls.load(Ordering::SeqCst), 1);
        assert!(worker.client.statuses.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn skips_image_job_in_command_mode() {
        let client = StubClient {
            descriptors: Mutex::new(vec![descriptor(Some("registry/image:tag"))]),
            claim_status: 200,
            statuses: Mutex::new(vec![]),
            fetch_calls: AtomicUsize::new(0),
        };
        let worker = WorkerLoop::new(client, FakePlatform::default(), command_config()).unwrap();
        worker.run_once().await.unwrap();
        assert!(worker.client.statuses.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_conflict_is_terminal_not_error() {
        let client = StubClient {
            descriptors: Mutex::new(vec![descriptor(None)]),
            claim_status: 409,
            statuses: Mutex::new(vec![]),
            fetch_calls: AtomicUsize::new(0),
        };
        let worker = WorkerLoop::new(client, FakePlatform::default(), command_config()).unwrap();
        worker.run_once().await.unwrap();
        assert!(worker.client.statuses.lock().unwrap().is_empty());
    }

    #[test]
    fn image_mode_rejects_construction_inside_container() {
        let config = WorkerConfig {
            mode: WorkerMode::Image { project: None },
            ..command_config()
        };
        let platform = FakePlatform {
            in_docker: true,
            runtime_available: true,
        };
        let err = WorkerLoop::new(
            StubClient {
                descriptors: Mutex::new(vec![]),
                claim_status: 200,
                statuses: Mutex::new(vec![]),
                fetch_calls: AtomicUsize::new(0),
            },
            platform,
            config,
        )
        .unwrap_err();
        assert!(matches!(err, WorkerError::Configuration(_)));
    }

    #[test]
    fn image_mode_rejects_construction_without_runtime() {
        let config = WorkerConfig {
            mode: WorkerMode::Image { project: None },
            ..command_config()
        };
        let platform = FakePlatform {
            in_docker: false,
            runtime_available: false,
        };
        let err = WorkerLoop::new(
            StubClient {
                descriptors: Mutex::new(vec![]),
                claim_status: 200,
                statuses: Mutex::new(vec![]),
                fetch_calls: AtomicUsize::new(0),
            },
            platform,
            config,
        )
        .unwrap_err();
        assert!(matches!(err, WorkerError::Configuration(_)));
    }
}
