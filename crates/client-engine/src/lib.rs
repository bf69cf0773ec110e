#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! HTTP client, command/container executors, and the worker loop that drives a single job
//! from fetch through completion report.

pub mod client;
pub mod executor;
pub mod worker;

pub use client::{BackoffSchedule, JobApiClient, DEFAULT_RETRIES};
pub use executor::{CommandExecutor, ContainerExecutor, EmitHandle, ExecutionOutcome};
pub use worker::{WorkerConfig, WorkerLoop};
