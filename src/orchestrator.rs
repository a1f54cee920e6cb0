//! Top-level entry point: validate, admit, stage, launch, supervise.

use crate::{
    admission::{AdmissionGate, GateStatus},
    config::RunnerConfig,
    launcher::SandboxLauncher,
    limits::ResourceLimits,
    registry::{LanguageProfile, LanguageRegistry},
    result::ExecutionResult,
    runtime::{ContainerRuntime, DockerCli},
    sandbox::{reclaim, TeardownPolicy, ALERT_TARGET},
    submission::Submission,
    supervisor::Supervisor,
    workspace::{Workspace, WorkspaceBuilder},
    Error, Result,
};
use std::{collections::BTreeSet, sync::Arc, time::Instant};
use tokio_util::sync::CancellationToken;

/// Runs untrusted submissions, each in its own sandbox, with bounded
/// concurrency. Cheap to clone; clones share the same slot pool.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<LanguageRegistry>,
    workspaces: WorkspaceBuilder,
    launcher: SandboxLauncher,
    supervisor: Supervisor,
    gate: AdmissionGate,
    runtime: Arc<dyn ContainerRuntime>,
    default_limits: ResourceLimits,
    max_limits: ResourceLimits,
    teardown: TeardownPolicy,
}

impl Orchestrator {
    /// Drives containers through the configured Docker-compatible CLI.
    pub fn new(config: &RunnerConfig) -> Result<Self> {
        let runtime = Arc::new(DockerCli::new(config.runtime.clone()));
        Orchestrator::with_runtime(config, runtime)
    }

    pub fn with_runtime(config: &RunnerConfig, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        config.validate()?;

        Ok(Orchestrator {
            registry: Arc::new(config.registry()?),
            workspaces: WorkspaceBuilder::new(&config.workspace_root),
            launcher: SandboxLauncher::new(
                Arc::clone(&runtime),
                config.sandbox_user,
                config.scratch_bytes,
                config.teardown.clone(),
            ),
            supervisor: Supervisor::new(),
            gate: AdmissionGate::new(config.slots, config.admission),
            runtime,
            default_limits: config.default_limits.clone(),
            max_limits: config.max_limits.clone(),
            teardown: config.teardown.clone(),
        })
    }

    pub async fn execute(&self, submission: Submission) -> Result<ExecutionResult> {
        self.execute_with_cancel(submission, &CancellationToken::new())
            .await
    }

    /// Executes one submission.
    ///
    /// Requests that are rejected (unknown language, bad limits, no capacity,
    /// cancelled while queued) come back as `Err` without anything having
    /// been allocated. Once admitted, every outcome is an [`ExecutionResult`];
    /// host-side faults become `INFRA_FAILURE` and are only detailed in the log.
    pub async fn execute_with_cancel(
        &self,
        submission: Submission,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let profile = self.registry.lookup(submission.language())?;
        let limits = self
            .default_limits
            .resolve(submission.limits(), &self.max_limits)?;

        let slot = self.gate.admit(cancel).await?;
        let started = Instant::now();
        log::info!(
            "Admitted submission {} ({}, {} bytes)",
            submission.id(),
            profile.id,
            submission.source().len()
        );

        let workspace = match self.stage(&submission, &profile) {
            Ok(workspace) => workspace,
            Err(e) => return admitted_failure(&submission, e, started),
        };

        let mut handle = match self.launcher.launch(&profile, workspace, &limits).await {
            Ok(handle) => handle,
            Err(e) => return admitted_failure(&submission, e, started),
        };
        handle.hold(slot);

        Ok(self
            .supervisor
            .supervise(submission.id(), handle, &limits, cancel)
            .await)
    }

    fn stage(&self, submission: &Submission, profile: &LanguageProfile) -> Result<Workspace> {
        retry_once(|| self.workspaces.build(submission, profile), |e| {
            log::warn!(
                "Retrying workspace for submission {} after: {}",
                submission.id(),
                e
            )
        })
    }

    /// Checks the runtime is reachable and pulls every profile's image.
    /// An image that fails to pull is logged and skipped.
    pub async fn prepare(&self) -> Result<()> {
        let version = self.runtime.version().await?;
        log::info!("Using container runtime {}", version);

        let images: BTreeSet<&str> = self
            .registry
            .profiles()
            .map(|profile| profile.image.as_str())
            .collect();

        for image in images {
            match self.runtime.ensure_image(image).await {
                Ok(()) => log::info!("Image {} is ready", image),
                Err(e) => log::warn!("Unable to prepare image {}: {}", image, e),
            }
        }
        Ok(())
    }

    /// Removes every managed container still present, returning how many
    /// were removed. Meant for startup, before any submission is admitted.
    pub async fn reap_orphans(&self) -> Result<usize> {
        let orphans = self.runtime.list_managed().await?;
        let mut removed = 0;

        for name in &orphans {
            match reclaim(&*self.runtime, name, &self.teardown).await {
                Ok(()) => removed += 1,
                Err(e) => log::error!(target: ALERT_TARGET, "Unable to reap orphan {}: {}", name, e),
            }
        }

        if !orphans.is_empty() {
            log::info!("Reaped {} of {} orphaned sandboxes", removed, orphans.len());
        }
        Ok(removed)
    }

    pub fn gate_status(&self) -> GateStatus {
        self.gate.status()
    }

    pub fn languages(&self) -> &[String] {
        self.registry.languages()
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }
}

/// Runs `op` a second time if it failed on workspace IO. Any other error,
/// or a second failure, is returned as is.
fn retry_once<T>(mut op: impl FnMut() -> Result<T>, on_retry: impl FnOnce(&Error)) -> Result<T> {
    match op() {
        Err(e) if e.is_workspace_io() => {
            on_retry(&e);
            op()
        }
        other => other,
    }
}

/// Host faults after admission become a generic `INFRA_FAILURE` result.
fn admitted_failure(submission: &Submission, error: Error, started: Instant) -> Result<ExecutionResult> {
    if !error.is_infra() {
        return Err(error);
    }
    log::error!(
        "Infrastructure failure for submission {}: {}",
        submission.id(),
        error
    );
    Ok(ExecutionResult::infra_failure(submission.id(), started.elapsed()))
}
