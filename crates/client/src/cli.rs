use clap::Parser;

fn parse_job_timeout(input: &str) -> Result<u64, String> {
    input
        .parse()
        .map_err(|_| format!("job timeout must be a non-negative integer of seconds: {input:?}"))
}

#[derive(Debug, Clone, Parser)]
#[command(name = "uworker", version, about = "Job-polling execution agent")]
pub struct Cli {
    /// Base URL of the job-API coordinator.
    #[arg(long, env = "UWORKER_JOB_API_ROOT")]
    pub api_root: String,

    /// Basic-auth username for token issuance.
    #[arg(long, env = "UWORKER_JOB_API_USERNAME")]
    pub api_username: Option<String>,

    /// Basic-auth password for token issuance.
    #[arg(long, env = "UWORKER_JOB_API_PASSWORD")]
    pub api_password: Option<String>,

    /// Path to a JSON credentials file, an alternative to `--api-username`/`--api-password`.
    #[arg(long, env = "UWORKER_CREDENTIALS_FILE")]
    pub credentials_file: Option<std::path::PathBuf>,

    /// Pass-through username appended to the job command's argv when a target URL is set.
    #[arg(long, env = "UWORKER_EXTERNAL_API_USERNAME")]
    pub external_username: Option<String>,

    /// Pass-through password appended to the job command's argv when a target URL is set.
    #[arg(long, env = "UWORKER_EXTERNAL_API_PASSWORD")]
    pub external_password: Option<String>,

    /// Project to fetch jobs from. Required in command mode; ignored in image mode.
    #[arg(long, env = "UWORKER_JOB_API_PROJECT")]
    pub api_project: Option<String>,

    /// Executable and fixed arguments to run against each job. Presence of this flag selects
    /// command mode unless `--no-command` forces image mode regardless.
    #[arg(long, env = "UWORKER_JOB_CMD")]
    pub job_command: Option<String>,

    /// Optional fetch-type filter, only meaningful in command mode.
    #[arg(long, env = "UWORKER_JOB_TYPE")]
    pub job_type: Option<String>,

    /// Seconds before the job command is killed; zero (the default) means no timeout. The
    /// child is sent SIGTERM after this long, SIGKILL 5 seconds later if it hasn't exited.
    #[arg(long, env = "UWORKER_JOB_TIMEOUT", default_value_t = 0, value_parser = parse_job_timeout)]
    pub job_timeout: u64,

    /// Select image mode at startup regardless of whether `--job-command` is also set.
    #[arg(long, env = "UWORKER_NO_COMMAND")]
    pub no_command: bool,

    /// Seconds to sleep after a fetch finds no job available.
    #[arg(long, env = "UWORKER_IDLE_SLEEP", default_value_t = 600)]
    pub idle_sleep: u64,

    /// Seconds to sleep after an unhandled error or a failed claim attempt.
    #[arg(long, env = "UWORKER_ERROR_SLEEP", default_value_t = 30)]
    pub error_sleep: u64,

    /// Retry ceiling for the HTTP client's transport-level retries.
    #[arg(long, env = "UWORKER_RETRIES", default_value_t = uworker_engine::DEFAULT_RETRIES)]
    pub retries: u32,

    /// Container-runtime CLI name, used in image mode.
    #[arg(long, env = "UWORKER_CONTAINER_RUNTIME", default_value = "docker")]
    pub container_runtime: String,

    /// Run the job command once against this input URL and exit, instead of starting the
    /// service loop.
    #[arg(value_name = "INPUT_DATA_URL")]
    pub input_data_url: Option<String>,
}

impl Cli {
    pub fn job_timeout(&self) -> Option<u64> {
        if self.job_timeout == 0 {
            None
        } else {
            Some(self.job_timeout)
        }
    }
}
