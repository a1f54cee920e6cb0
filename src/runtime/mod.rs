//! The container runtime primitive the sandbox is built on.
//!
//! Everything above this module talks to containers only through
//! [`ContainerRuntime`], which keeps the lifecycle logic independent of
//! whether Docker, Podman or an in-process fake sits underneath.

use crate::{output::OutputBuffer, Error, Result};
use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use std::{convert::TryFrom, fmt, path::PathBuf, str::FromStr, time::Duration};

pub mod docker;
#[cfg(test)]
pub(crate) mod fake;

pub use self::docker::DockerCli;

/// Label attached to every container we create, used to find orphans.
pub const MANAGED_LABEL: &str = "code-runner.managed";
/// Exit code reported for a process killed by SIGKILL.
pub const SIGKILL_EXIT_CODE: i32 = 128 + 9;

/// Explicit non-privileged identity every sandboxed process runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SandboxUser {
    uid: u32,
    gid: u32,
}

impl SandboxUser {
    pub fn new(uid: u32, gid: u32) -> Result<Self> {
        if uid == 0 || gid == 0 {
            return Err(Error::PrivilegedUser {
                user: format!("{}:{}", uid, gid),
            });
        }
        Ok(SandboxUser { uid, gid })
    }

    /// The conventional `nobody:nogroup` identity.
    pub fn nobody() -> Self {
        SandboxUser { uid: 65534, gid: 65534 }
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }
}

impl Default for SandboxUser {
    fn default() -> Self {
        SandboxUser::nobody()
    }
}

impl fmt::Display for SandboxUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

impl FromStr for SandboxUser {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidConfig {
            reason: format!("sandbox user must be numeric uid:gid, got {:?}", s),
        };
        let (uid, gid) = match s.trim().split_once(':') {
            Some((uid, gid)) => (uid, gid),
            None => (s.trim(), s.trim()),
        };
        let uid = uid.parse().map_err(|_| invalid())?;
        let gid = gid.parse().map_err(|_| invalid())?;
        SandboxUser::new(uid, gid)
    }
}

impl TryFrom<String> for SandboxUser {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SandboxUser> for String {
    fn from(user: SandboxUser) -> String {
        user.to_string()
    }
}

/// Everything needed to create one isolated execution unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub user: SandboxUser,
    pub memory_bytes: u64,
    pub cpus: f64,
    pub pids: u32,
    pub read_only_root: bool,
    pub scratch_bytes: u64,
    /// Host directory mounted read-only at `workspace_target`.
    pub workspace_source: PathBuf,
    pub workspace_target: String,
    pub scratch_target: String,
    /// The container exits by itself after this long even if nobody stops it.
    pub keep_alive: Duration,
    pub labels: Vec<(String, String)>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Confirms the runtime is reachable, returning its version.
    async fn version(&self) -> Result<String>;

    /// Makes `image` available locally, pulling it when missing.
    async fn ensure_image(&self, image: &str) -> Result<()>;

    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, name: &str) -> Result<()>;

    async fn is_running(&self, name: &str) -> Result<bool>;

    /// Runs `command` through `sh -c` inside the container and waits for it,
    /// streaming its output into the buffers. Dropping the returned future
    /// abandons the wait but does not stop the process; use [`kill`].
    ///
    /// [`kill`]: ContainerRuntime::kill
    async fn exec(
        &self,
        name: &str,
        command: &str,
        stdout: &mut OutputBuffer,
        stderr: &mut OutputBuffer,
    ) -> Result<Option<i32>>;

    /// Stops every process in the container immediately.
    async fn kill(&self, name: &str) -> Result<()>;

    /// Whether the kernel OOM killer fired inside the container.
    async fn oom_killed(&self, name: &str) -> Result<bool>;

    /// Force-removes the container. Removing a missing container succeeds.
    async fn remove(&self, name: &str) -> Result<()>;

    async fn exists(&self, name: &str) -> Result<bool>;

    /// Names of containers carrying [`MANAGED_LABEL`].
    async fn list_managed(&self) -> Result<Vec<String>>;
}
