use std::{io, time::Duration};
use thiserror::Error;

pub mod admission;
pub mod config;
pub mod judge;
pub mod launcher;
pub mod limits;
pub mod orchestrator;
pub mod output;
pub mod registry;
pub mod result;
pub mod runtime;
pub mod sandbox;
pub mod submission;
pub mod supervisor;
pub mod workspace;

pub use crate::{
    admission::{AdmissionPolicy, GateStatus},
    config::RunnerConfig,
    limits::{LimitOverrides, ResourceLimits},
    orchestrator::Orchestrator,
    output::CapturedOutput,
    registry::{LanguageProfile, LanguageRegistry},
    result::{ExecutionResult, ExecutionStatus},
    submission::Submission,
};
pub use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsupported language: {language}")]
    UnsupportedLanguage { language: String },
    #[error("Language {language} is registered more than once")]
    DuplicateLanguage { language: String },
    #[error("Invalid resource limits: {reason}")]
    InvalidLimits { reason: String },
    #[error("All {slots} execution slots are busy and {queued} submissions are queued")]
    CapacityExceeded { slots: usize, queued: usize },
    #[error("Submission was cancelled before it was admitted")]
    Cancelled,
    #[error("Unable to create workspace directory: {source}")]
    UnableToCreateWorkspace { source: io::Error },
    #[error("Unable to write source file: {source}")]
    UnableToWriteSource { source: io::Error },
    #[error("Unable to write input file: {source}")]
    UnableToWriteInput { source: io::Error },
    #[error("Unable to set permissions for workspace: {source}")]
    UnableToSetWorkspacePermissions { source: io::Error },
    #[error("Unable to remove workspace: {source}")]
    UnableToRemoveWorkspace { source: io::Error },
    #[error("Unable to start the container runtime: {source}")]
    UnableToStartRuntime { source: io::Error },
    #[error("Container runtime command `{command}` failed with status {code:?}: {stderr}")]
    RuntimeCommandFailed {
        command: &'static str,
        code: Option<i32>,
        stderr: String,
    },
    #[error("Unable to find the container ID")]
    MissingContainerId,
    #[error("Container {name} is not running")]
    ContainerNotRunning { name: String },
    #[error("Unable to collect output from container {name}: {source}")]
    UnableToCollectOutput { name: String, source: io::Error },
    #[error("Removal of container {name} was not confirmed after {attempts} attempts")]
    TeardownUnconfirmed { name: String, attempts: u32 },
    #[error("Unable to read configuration: {source}")]
    UnableToReadConfig { source: io::Error },
    #[error("Unable to parse configuration: {source}")]
    UnableToParseConfig { source: serde_json::Error },
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },
    #[error("Refusing to run sandboxes as privileged user {user}")]
    PrivilegedUser { user: String },
    #[error("Compilation took longer than {} ms", timeout.as_millis())]
    CompilationTimedOut { timeout: Duration },
}

impl Error {
    /// Faults of the host rather than of the submitted program. These are
    /// logged in detail and reported to callers generically.
    pub fn is_infra(&self) -> bool {
        !matches!(
            self,
            Error::UnsupportedLanguage { .. }
                | Error::InvalidLimits { .. }
                | Error::CapacityExceeded { .. }
                | Error::Cancelled
                | Error::CompilationTimedOut { .. }
        )
    }

    pub(crate) fn is_workspace_io(&self) -> bool {
        matches!(
            self,
            Error::UnableToCreateWorkspace { .. }
                | Error::UnableToWriteSource { .. }
                | Error::UnableToWriteInput { .. }
                | Error::UnableToSetWorkspacePermissions { .. }
        )
    }
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;
