//! Ownership of one running execution unit and its guaranteed reclamation.

use crate::{runtime::ContainerRuntime, workspace::Workspace, Error, Result};
use serde_derive::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::sync::OwnedSemaphorePermit;

/// Log target for leaks that need an operator's attention.
pub const ALERT_TARGET: &str = "code_runner::alert";

/// How hard teardown tries before escalating, and how long the background
/// reaper keeps trying afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TeardownPolicy {
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub background_attempts: u32,
}

impl Default for TeardownPolicy {
    fn default() -> Self {
        TeardownPolicy {
            attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            background_attempts: 20,
        }
    }
}

impl TeardownPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

/// The composite command of one submission: compile (optional), then run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub compile: Option<String>,
    pub run: String,
}

/// A running container bound to exactly one submission. It owns the
/// submission's workspace and admission slot and releases all of them
/// exactly once, in [`SandboxHandle::teardown`] or, failing that, on drop.
pub struct SandboxHandle {
    name: String,
    plan: ExecutionPlan,
    runtime: Arc<dyn ContainerRuntime>,
    policy: TeardownPolicy,
    workspace: Option<Workspace>,
    slot: Option<OwnedSemaphorePermit>,
    /// Set once removal is confirmed or handed to the reaper.
    removed: bool,
}

impl SandboxHandle {
    pub(crate) fn new(
        name: String,
        plan: ExecutionPlan,
        runtime: Arc<dyn ContainerRuntime>,
        policy: TeardownPolicy,
        workspace: Workspace,
    ) -> Self {
        SandboxHandle {
            name,
            plan,
            runtime,
            policy,
            workspace: Some(workspace),
            slot: None,
            removed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub(crate) fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn is_released(&self) -> bool {
        self.removed && self.workspace.is_none() && self.slot.is_none()
    }

    /// Ties an admission slot to this handle so it is freed only once the
    /// container is gone.
    pub fn hold(&mut self, slot: OwnedSemaphorePermit) {
        self.slot = Some(slot);
    }

    /// Removes the container and the workspace, then frees the slot.
    /// Calling this again after it returned is a no-op. If the future is
    /// dropped before removal finishes, the handle's drop picks it up.
    ///
    /// An unconfirmed container removal is escalated on [`ALERT_TARGET`] and
    /// handed to a background reaper before the error is returned.
    pub async fn teardown(&mut self) -> Result<()> {
        let removed = if self.removed {
            Ok(())
        } else {
            let removed = reclaim(&*self.runtime, &self.name, &self.policy).await;
            if let Err(ref e) = removed {
                log::error!(target: ALERT_TARGET, "Sandbox {} may still be running: {}", self.name, e);
                spawn_reaper(Arc::clone(&self.runtime), self.name.clone(), self.policy.clone());
            }
            self.removed = true;
            removed
        };

        let cleaned = match self.workspace.as_mut() {
            Some(workspace) => workspace.teardown(),
            None => Ok(()),
        };
        if let Err(ref e) = cleaned {
            log::error!("Unable to remove workspace of sandbox {}: {}", self.name, e);
        }
        self.workspace = None;
        self.slot = None;

        removed.and(cleaned)
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if self.is_released() {
            return;
        }

        // The owning future was dropped mid-execution; finish the job in the background.
        log::warn!("Sandbox {} dropped before teardown; reclaiming in background", self.name);
        let runtime = Arc::clone(&self.runtime);
        let name = self.name.clone();
        let policy = self.policy.clone();
        let pending = !self.removed;
        self.removed = true;
        let mut workspace = self.workspace.take();
        let slot = self.slot.take();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if pending {
                        let removed = reclaim(&*runtime, &name, &policy).await;
                        if let Err(e) = removed {
                            log::error!(target: ALERT_TARGET, "Sandbox {} may still be running: {}", name, e);
                            reap(runtime, name, policy).await;
                        }
                    }
                    if let Some(workspace) = workspace.as_mut() {
                        if let Err(e) = workspace.teardown() {
                            log::error!("Unable to remove workspace: {}", e);
                        }
                    }
                    drop(slot);
                });
            }
            Err(_) => {
                if pending {
                    log::error!(
                        target: ALERT_TARGET,
                        "Sandbox {} dropped outside a runtime; container was not removed",
                        name
                    );
                }
                if let Some(workspace) = workspace.as_mut() {
                    if let Err(e) = workspace.teardown() {
                        log::error!("Unable to remove workspace: {}", e);
                    }
                }
            }
        }
    }
}

/// Force-removes a container, retrying with exponential backoff until a
/// follow-up existence check confirms it is gone.
pub async fn reclaim(runtime: &dyn ContainerRuntime, name: &str, policy: &TeardownPolicy) -> Result<()> {
    let attempts = policy.attempts.max(1);

    for attempt in 0..attempts {
        match runtime.remove(name).await {
            Ok(()) => match runtime.exists(name).await {
                Ok(false) => {
                    log::debug!("Removed sandbox {}", name);
                    return Ok(());
                }
                Ok(true) => log::warn!("Sandbox {} still present after removal", name),
                Err(e) => log::warn!("Unable to confirm removal of sandbox {}: {}", name, e),
            },
            Err(e) => log::warn!(
                "Unable to remove sandbox {} (attempt {}/{}): {}",
                name,
                attempt + 1,
                attempts,
                e
            ),
        }

        if attempt + 1 < attempts {
            tokio::time::sleep(policy.backoff(attempt)).await;
        }
    }

    Err(Error::TeardownUnconfirmed {
        name: name.to_string(),
        attempts,
    })
}

fn spawn_reaper(runtime: Arc<dyn ContainerRuntime>, name: String, policy: TeardownPolicy) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(reap(runtime, name, policy));
    }
}

async fn reap(runtime: Arc<dyn ContainerRuntime>, name: String, policy: TeardownPolicy) {
    let background = TeardownPolicy {
        attempts: policy.background_attempts,
        initial_backoff_ms: policy.max_backoff_ms,
        ..policy
    };

    match reclaim(&*runtime, &name, &background).await {
        Ok(()) => log::info!(target: ALERT_TARGET, "Sandbox {} reclaimed by background reaper", name),
        Err(e) => log::error!(target: ALERT_TARGET, "Giving up on sandbox {}: {}", name, e),
    }
}
