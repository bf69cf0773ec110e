//! Shared types for `uworker`: job descriptors, the job-API contract, configuration
//! primitives, and the error taxonomy.

pub mod credentials;
pub mod error;
pub mod job;
pub mod platform;
pub mod validate;

pub use credentials::Credentials;
pub use error::WorkerError;
pub use job::{JobApi, JobBody, JobDescriptor, JobHandle, JobStatus, JobUrls};
pub use platform::{FakePlatform, HostPlatform, Platform};
pub use validate::validate_project_name;
