mod cli;
mod shutdown;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use uworker_core::{Credentials, HostPlatform, WorkerError};
use uworker_engine::client::BackoffSchedule;
use uworker_engine::worker::{WorkerConfig, WorkerLoop, WorkerMode};
use uworker_engine::JobApiClient;

use crate::cli::Cli;
use crate::shutdown::spawn_signal_handlers;

fn system_hostname() -> String {
    let mut buf = vec![0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "unknown-host".to_string();
    }
    let nul = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..nul]).to_string()
}

fn load_credentials(cli: &Cli) -> anyhow::Result<Option<Credentials>> {
    if let Some(path) = &cli.credentials_file {
        return Ok(Some(Credentials::from_file(path).map_err(|err| {
            anyhow::anyhow!("{err}")
        })?));
    }
    match (&cli.api_username, &cli.api_password) {
        (Some(username), Some(password)) => Ok(Some(Credentials {
            username: username.clone(),
            password: password.clone(),
        })),
        (None, None) => Ok(None),
        _ => anyhow::bail!(
            "UWORKER_JOB_API_USERNAME and UWORKER_JOB_API_PASSWORD must be set together"
        ),
    }
}

fn build_mode(cli: &Cli) -> anyhow::Result<WorkerMode> {
    if cli.no_command {
        return Ok(WorkerMode::Image {
            project: cli.api_project.clone(),
        });
    }
    match &cli.job_command {
        Some(job_command) => {
            let project = cli
                .api_project
                .clone()
                .context("UWORKER_JOB_API_PROJECT is required in command mode")?;
            Ok(WorkerMode::Command {
                job_command: job_command.clone(),
                project,
                job_type: cli.job_type.clone(),
            })
        }
        None => Ok(WorkerMode::Image {
            project: cli.api_project.clone(),
        }),
    }
}

fn redacted_config_line(cli: &Cli) -> String {
    format!(
        "api_root={} api_project={:?} no_command={} job_command={:?} job_type={:?} \
         job_timeout={:?} idle_sleep={} error_sleep={} retries={} container_runtime={} \
         api_username={} api_password=<redacted> credentials_file={:?} \
         external_username={:?} external_password={}",
        cli.api_root,
        cli.api_project,
        cli.no_command,
        cli.job_command,
        cli.job_type,
        cli.job_timeout(),
        cli.idle_sleep,
        cli.error_sleep,
        cli.retries,
        cli.container_runtime,
        cli.api_username.as_deref().unwrap_or("<unset>"),
        cli.credentials_file,
        cli.external_username,
        if cli.external_password.is_some() { "<redacted>" } else { "<unset>" },
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tracing::info!("{}", redacted_config_line(&cli));

    let credentials = load_credentials(&cli)?;
    let client = JobApiClient::new(cli.api_root.clone(), credentials)
        .with_retries(cli.retries)
        .with_backoff(BackoffSchedule::Exponential);

    if let Some(input_url) = &cli.input_data_url {
        let job_command = cli
            .job_command
            .clone()
            .context("a job command must be configured to run a one-shot job")?;
        let executor =
            uworker_engine::executor::CommandExecutor::from_command_line("Job", &job_command);
        let mut args = vec![input_url.clone()];
        if let Some(username) = &cli.external_username {
            args.push(username.clone());
        }
        if let Some(password) = &cli.external_password {
            args.push(password.clone());
        }
        let outcome = executor
            .execute(
                &args,
                |text| {
                    tracing::info!("{text}");
                    tokio::spawn(async {})
                },
                cli.job_timeout(),
                5,
                false,
            )
            .await?;
        std::process::exit(outcome.exit_code);
    }

    let mode = build_mode(&cli)?;
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| system_hostname());
    let config = WorkerConfig {
        mode,
        hostname,
        idle_sleep: std::time::Duration::from_secs(cli.idle_sleep),
        error_sleep: std::time::Duration::from_secs(cli.error_sleep),
        job_timeout: cli.job_timeout(),
        kill_after: 5,
        container_runtime: cli.container_runtime.clone(),
        external_username: cli.external_username.clone(),
        external_password: cli.external_password.clone(),
    };

    let platform = HostPlatform::new(cli.container_runtime.clone());
    let worker = WorkerLoop::new(client, platform, config)
        .map_err(|err: WorkerError| anyhow::anyhow!("{err}"))?;

    tracing::info!(worker_name = worker.worker_name(), "starting worker");

    let alive = Arc::new(AtomicBool::new(true));
    spawn_signal_handlers(alive.clone());

    worker.run(alive).await;

    tracing::info!(jobs_completed = worker.job_count(), "worker shut down");
    Ok(())
}
