//! Deployment configuration, loaded from JSON and the environment.

use crate::{
    admission::AdmissionPolicy,
    limits::ResourceLimits,
    registry::{builtin_profiles, LanguageProfile, LanguageRegistry},
    runtime::SandboxUser,
    sandbox::TeardownPolicy,
    Error, Result,
};
use serde_derive::{Deserialize, Serialize};
use std::{env, fs, path::Path, path::PathBuf, time::Duration};

pub const RUNTIME_ENV: &str = "CODE_RUNNER_RUNTIME";
pub const SLOTS_ENV: &str = "CODE_RUNNER_SLOTS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerConfig {
    /// Docker-compatible CLI used to drive containers.
    pub runtime: String,
    pub sandbox_user: SandboxUser,
    pub slots: usize,
    pub admission: AdmissionPolicy,
    pub workspace_root: PathBuf,
    pub default_limits: ResourceLimits,
    /// Caller overrides are clamped to these values.
    pub max_limits: ResourceLimits,
    pub scratch_bytes: u64,
    pub teardown: TeardownPolicy,
    /// Replaces the built-in language table when present.
    pub languages: Option<Vec<LanguageProfile>>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            runtime: "docker".to_string(),
            sandbox_user: SandboxUser::nobody(),
            slots: 4,
            admission: AdmissionPolicy::default(),
            workspace_root: env::temp_dir().join("code-runner"),
            default_limits: ResourceLimits::default(),
            max_limits: ResourceLimits {
                wall_time: Duration::from_secs(30),
                compile_time: Duration::from_secs(60),
                memory_bytes: 1024 * 1024 * 1024,
                max_output_bytes: 1024 * 1024,
                cpus: 2.0,
                pids: 256,
            },
            scratch_bytes: 64 * 1024 * 1024,
            teardown: TeardownPolicy::default(),
            languages: None,
        }
    }
}

impl RunnerConfig {
    /// Reads a JSON configuration file, applies environment overrides and
    /// validates the result.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read(path).map_err(|e| Error::UnableToReadConfig { source: e })?;
        let config: RunnerConfig =
            serde_json::from_slice(&raw).map_err(|e| Error::UnableToParseConfig { source: e })?;
        log::debug!("Loaded configuration from {}", path.display());

        config.with_env_overrides()
    }

    /// Built-in defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        RunnerConfig::default().with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(runtime) = env::var(RUNTIME_ENV) {
            if !runtime.trim().is_empty() {
                self.runtime = runtime.trim().to_string();
            }
        }

        if let Ok(slots) = env::var(SLOTS_ENV) {
            self.slots = slots.trim().parse().map_err(|_| Error::InvalidConfig {
                reason: format!("{} must be a positive integer, got {:?}", SLOTS_ENV, slots),
            })?;
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.runtime.trim().is_empty() {
            return Err(invalid("runtime binary cannot be empty"));
        }
        if self.slots == 0 {
            return Err(invalid("at least one execution slot is required"));
        }
        if self.scratch_bytes == 0 {
            return Err(invalid("scratch space must be positive"));
        }
        if self.teardown.attempts == 0 {
            return Err(invalid("teardown needs at least one attempt"));
        }
        // Serde bypasses SandboxUser::new, so check the identity again.
        SandboxUser::new(self.sandbox_user.uid(), self.sandbox_user.gid())?;

        self.default_limits.validate()?;
        self.max_limits.validate()?;
        self.registry().map(drop)
    }

    pub fn registry(&self) -> Result<LanguageRegistry> {
        match &self.languages {
            Some(profiles) => LanguageRegistry::from_profiles(profiles.iter().cloned()),
            None => LanguageRegistry::from_profiles(builtin_profiles()),
        }
    }
}

fn invalid(reason: &str) -> Error {
    Error::InvalidConfig {
        reason: reason.to_string(),
    }
}
