//! In-process runtime used by unit tests in place of a Docker daemon.

use super::{ContainerRuntime, ContainerSpec, SIGKILL_EXIT_CODE};
use crate::{output::OutputBuffer, Error, Result};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

/// What a scripted `exec` does.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeExec {
    pub exit: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub delay: Duration,
    pub oom: bool,
}

impl FakeExec {
    pub fn exit(code: i32) -> Self {
        FakeExec {
            exit: Some(code),
            ..Default::default()
        }
    }

    pub fn stdout(mut self, data: &[u8]) -> Self {
        self.stdout = data.to_vec();
        self
    }

    pub fn stderr(mut self, data: &[u8]) -> Self {
        self.stderr = data.to_vec();
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn oom(mut self) -> Self {
        self.exit = Some(SIGKILL_EXIT_CODE);
        self.oom = true;
        self
    }
}

#[derive(Debug, Default)]
struct FakeContainer {
    running: bool,
    oom: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    specs: Vec<ContainerSpec>,
    execs: Vec<String>,
    peak_live: usize,
    kills: usize,
    failing_removals: u32,
    fail_create: bool,
    fail_start: bool,
    start_delay: Duration,
}

type Script = Box<dyn Fn(&str) -> FakeExec + Send + Sync>;

pub(crate) struct FakeRuntime {
    state: Mutex<FakeState>,
    script: Script,
}

fn failed(command: &'static str) -> Error {
    Error::RuntimeCommandFailed {
        command,
        code: Some(125),
        stderr: "scripted failure".to_string(),
    }
}

impl FakeRuntime {
    /// `script` decides the outcome of every exec from its command line.
    pub fn new(script: impl Fn(&str) -> FakeExec + Send + Sync + 'static) -> Self {
        FakeRuntime {
            state: Mutex::new(FakeState::default()),
            script: Box::new(script),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail_removals(&self, count: u32) {
        self.state().failing_removals = count;
    }

    pub fn fail_create(&self) {
        self.state().fail_create = true;
    }

    pub fn fail_start(&self) {
        self.state().fail_start = true;
    }

    /// Makes `start` take this long, like a slow daemon.
    pub fn delay_start(&self, delay: Duration) {
        self.state().start_delay = delay;
    }

    /// Containers that exist and have not been removed.
    pub fn live(&self) -> usize {
        self.state().containers.len()
    }

    pub fn created(&self) -> usize {
        self.state().specs.len()
    }

    pub fn peak_live(&self) -> usize {
        self.state().peak_live
    }

    pub fn kills(&self) -> usize {
        self.state().kills
    }

    pub fn specs(&self) -> Vec<ContainerSpec> {
        self.state().specs.clone()
    }

    pub fn execs(&self) -> Vec<String> {
        self.state().execs.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn version(&self) -> Result<String> {
        Ok("fake".to_string())
    }

    async fn ensure_image(&self, _image: &str) -> Result<()> {
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state();
        if state.fail_create {
            return Err(failed("create"));
        }
        state.specs.push(spec.clone());
        state
            .containers
            .insert(spec.name.clone(), FakeContainer::default());
        state.peak_live = state.peak_live.max(state.containers.len());
        Ok(format!("id-{}", spec.name))
    }

    async fn start(&self, name: &str) -> Result<()> {
        let delay = self.state().start_delay;
        tokio::time::sleep(delay).await;

        let mut state = self.state();
        if state.fail_start {
            return Err(failed("start"));
        }
        match state.containers.get_mut(name) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(failed("start")),
        }
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self
            .state()
            .containers
            .get(name)
            .map_or(false, |c| c.running))
    }

    async fn exec(
        &self,
        name: &str,
        command: &str,
        stdout: &mut OutputBuffer,
        stderr: &mut OutputBuffer,
    ) -> Result<Option<i32>> {
        {
            let mut state = self.state();
            if !state.containers.get(name).map_or(false, |c| c.running) {
                return Err(Error::ContainerNotRunning {
                    name: name.to_string(),
                });
            }
            state.execs.push(command.to_string());
        }

        let outcome = (self.script)(command);
        stdout.push(&outcome.stdout);
        stderr.push(&outcome.stderr);
        tokio::time::sleep(outcome.delay).await;

        let mut state = self.state();
        match state.containers.get_mut(name) {
            Some(container) if container.running => {
                if outcome.oom {
                    container.oom = true;
                }
                Ok(outcome.exit)
            }
            _ => Ok(Some(SIGKILL_EXIT_CODE)),
        }
    }

    async fn kill(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.kills += 1;
        if let Some(container) = state.containers.get_mut(name) {
            container.running = false;
        }
        Ok(())
    }

    async fn oom_killed(&self, name: &str) -> Result<bool> {
        Ok(self.state().containers.get(name).map_or(false, |c| c.oom))
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        if state.failing_removals > 0 {
            state.failing_removals -= 1;
            return Err(failed("rm"));
        }
        state.containers.remove(name);
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.state().containers.contains_key(name))
    }

    async fn list_managed(&self) -> Result<Vec<String>> {
        Ok(self.state().containers.keys().cloned().collect())
    }
}
