use crate::output::CapturedOutput;
use serde_derive::Serialize;
use std::{convert::TryFrom, time::Duration};
use uuid::Uuid;

/// Message shown to callers for any host-side fault. Details only go to the log.
pub const INFRA_FAILURE_MESSAGE: &str = "internal error: the submission could not be executed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Completed,
    TimedOut,
    MemoryExceeded,
    CompileFailed,
    RuntimeError,
    InfraFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    submission_id: Uuid,
    status: ExecutionStatus,
    exit_code: Option<i32>,
    stdout: CapturedOutput,
    stderr: CapturedOutput,
    elapsed_ms: u64,
}

impl ExecutionResult {
    pub fn new(
        submission_id: Uuid,
        status: ExecutionStatus,
        exit_code: Option<i32>,
        stdout: CapturedOutput,
        stderr: CapturedOutput,
        elapsed: Duration,
    ) -> Self {
        ExecutionResult {
            submission_id,
            status,
            exit_code,
            stdout,
            stderr,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn infra_failure(submission_id: Uuid, elapsed: Duration) -> Self {
        ExecutionResult::new(
            submission_id,
            ExecutionStatus::InfraFailure,
            None,
            CapturedOutput::default(),
            CapturedOutput::new(INFRA_FAILURE_MESSAGE.as_bytes().to_vec(), false),
            elapsed,
        )
    }

    pub fn submission_id(&self) -> Uuid {
        self.submission_id
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn stdout(&self) -> &CapturedOutput {
        &self.stdout
    }

    pub fn stderr(&self) -> &CapturedOutput {
        &self.stderr
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }
}
