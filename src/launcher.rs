use crate::{
    limits::ResourceLimits,
    registry::{LanguageProfile, SCRATCH_DIR, WORKSPACE_DIR},
    runtime::{ContainerRuntime, ContainerSpec, SandboxUser, MANAGED_LABEL},
    sandbox::{ExecutionPlan, SandboxHandle, TeardownPolicy, ALERT_TARGET},
    workspace::Workspace,
    Result,
};
use std::sync::Arc;
use uuid::Uuid;

const CONTAINER_PREFIX: &str = "code-runner";

/// Turns a profile and a staged workspace into a running, least-privilege
/// container.
#[derive(Clone)]
pub struct SandboxLauncher {
    runtime: Arc<dyn ContainerRuntime>,
    user: SandboxUser,
    scratch_bytes: u64,
    teardown: TeardownPolicy,
}

impl SandboxLauncher {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        user: SandboxUser,
        scratch_bytes: u64,
        teardown: TeardownPolicy,
    ) -> Self {
        SandboxLauncher {
            runtime,
            user,
            scratch_bytes,
            teardown,
        }
    }

    pub fn container_spec(
        &self,
        name: String,
        profile: &LanguageProfile,
        workspace: &Workspace,
        limits: &ResourceLimits,
    ) -> ContainerSpec {
        ContainerSpec {
            name,
            image: profile.image.clone(),
            user: self.user,
            memory_bytes: limits.memory_bytes,
            cpus: limits.cpus,
            pids: limits.pids,
            read_only_root: profile.read_only_root,
            scratch_bytes: self.scratch_bytes,
            workspace_source: workspace.path().to_path_buf(),
            workspace_target: WORKSPACE_DIR.to_string(),
            scratch_target: SCRATCH_DIR.to_string(),
            keep_alive: limits.container_lifetime(),
            labels: vec![
                (MANAGED_LABEL.to_string(), "true".to_string()),
                ("code-runner.language".to_string(), profile.id.clone()),
            ],
        }
    }

    /// Creates and starts the container. The returned handle owns the
    /// container from the moment it exists, so a failed start, or a caller
    /// that gives up while waiting for it, still gets it removed.
    pub async fn launch(
        &self,
        profile: &LanguageProfile,
        mut workspace: Workspace,
        limits: &ResourceLimits,
    ) -> Result<SandboxHandle> {
        let name = format!("{}-{}", CONTAINER_PREFIX, Uuid::new_v4());
        let spec = self.container_spec(name, profile, &workspace, limits);

        if let Err(e) = self.runtime.create(&spec).await {
            discard(&mut workspace);
            return Err(e);
        }

        let plan = ExecutionPlan {
            compile: profile.build_command(),
            run: profile.run_command(),
        };
        let mut handle = SandboxHandle::new(
            spec.name,
            plan,
            Arc::clone(&self.runtime),
            self.teardown.clone(),
            workspace,
        );

        if let Err(e) = self.runtime.start(handle.name()).await {
            if let Err(cleanup) = handle.teardown().await {
                log::error!(
                    target: ALERT_TARGET,
                    "Unable to remove unstarted sandbox {}: {}",
                    handle.name(),
                    cleanup
                );
            }
            return Err(e);
        }

        log::debug!("Started sandbox {} from {}", handle.name(), spec.image);
        Ok(handle)
    }
}

fn discard(workspace: &mut Workspace) {
    if let Err(e) = workspace.teardown() {
        log::error!("Unable to remove workspace {}: {}", workspace.path().display(), e);
    }
}
