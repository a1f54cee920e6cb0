//! Drives one sandbox from start to teardown.
//!
//! ```text
//! Starting ──> Running ──> Completed | TimedOut | MemoryExceeded | Crashed
//!    │                                  │
//!    └──> CompileFailed | InfraFailure ─┴──> Teardown ──> Done
//! ```
//!
//! Whatever terminal state is reached, `Teardown` runs before the result is
//! returned.

use crate::{
    limits::ResourceLimits,
    output::OutputBuffer,
    result::{ExecutionResult, ExecutionStatus},
    runtime::{ContainerRuntime, SIGKILL_EXIT_CODE},
    sandbox::SandboxHandle,
    Error, Result,
};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Starting,
    Running,
    Completed,
    TimedOut,
    MemoryExceeded,
    Crashed,
    CompileFailed,
    InfraFailure,
    Teardown,
    Done,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed
                | ExecutionState::TimedOut
                | ExecutionState::MemoryExceeded
                | ExecutionState::Crashed
                | ExecutionState::CompileFailed
                | ExecutionState::InfraFailure
        )
    }

    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;

        match (self, next) {
            (Starting, Running) | (Starting, CompileFailed) | (Starting, TimedOut) | (Starting, InfraFailure) => true,
            (Running, Completed)
            | (Running, TimedOut)
            | (Running, MemoryExceeded)
            | (Running, Crashed)
            | (Running, InfraFailure) => true,
            (from, Teardown) => from.is_terminal(),
            (Teardown, Done) => true,
            _ => false,
        }
    }

    fn status(self) -> Option<ExecutionStatus> {
        match self {
            ExecutionState::Completed => Some(ExecutionStatus::Completed),
            ExecutionState::TimedOut => Some(ExecutionStatus::TimedOut),
            ExecutionState::MemoryExceeded => Some(ExecutionStatus::MemoryExceeded),
            ExecutionState::Crashed => Some(ExecutionStatus::RuntimeError),
            ExecutionState::CompileFailed => Some(ExecutionStatus::CompileFailed),
            ExecutionState::InfraFailure => Some(ExecutionStatus::InfraFailure),
            _ => None,
        }
    }
}

/// How one phase of the plan ended.
#[derive(Debug)]
enum PhaseEnd {
    Exited(Option<i32>),
    Deadline,
    Cancelled,
}

/// Everything observed while running one phase.
struct PhaseOutcome {
    end: Result<PhaseEnd>,
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    elapsed: Duration,
}

/// Mutable record of one execution until the result is sealed.
struct Execution {
    submission_id: Uuid,
    sandbox: String,
    state: ExecutionState,
}

impl Execution {
    fn enter(&mut self, next: ExecutionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        log::debug!(
            "Submission {} in sandbox {}: {:?} -> {:?}",
            self.submission_id,
            self.sandbox,
            self.state,
            next
        );
        self.state = next;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Supervisor;

impl Supervisor {
    pub fn new() -> Self {
        Supervisor
    }

    /// Runs the handle's plan under `limits` and always tears the sandbox
    /// down before returning. Cancelling `cancel` takes the timeout path.
    pub async fn supervise(
        &self,
        submission_id: Uuid,
        mut handle: SandboxHandle,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let mut execution = Execution {
            submission_id,
            sandbox: handle.name().to_string(),
            state: ExecutionState::Starting,
        };

        let result = drive(&mut execution, &handle, limits, cancel).await;

        execution.enter(ExecutionState::Teardown);
        if let Err(e) = handle.teardown().await {
            log::error!("Teardown of sandbox {} failed: {}", execution.sandbox, e);
        }
        execution.enter(ExecutionState::Done);

        log::info!(
            "Submission {} finished with {:?} in {} ms",
            submission_id,
            result.status(),
            result.elapsed_ms()
        );
        result
    }
}

async fn drive(
    execution: &mut Execution,
    handle: &SandboxHandle,
    limits: &ResourceLimits,
    cancel: &CancellationToken,
) -> ExecutionResult {
    let runtime = handle.runtime();
    let name = handle.name();
    let started = Instant::now();

    match runtime.is_running(name).await {
        Ok(true) => {}
        Ok(false) => {
            let e = Error::ContainerNotRunning {
                name: name.to_string(),
            };
            return infra(execution, e, started.elapsed());
        }
        Err(e) => return infra(execution, e, started.elapsed()),
    }

    if let Some(compile) = &handle.plan().compile {
        let outcome = run_phase(&**runtime, name, compile, limits.compile_time, limits, cancel).await;

        match outcome.end {
            Ok(PhaseEnd::Exited(Some(0))) => {}
            Ok(PhaseEnd::Exited(code)) => {
                let memory_exceeded =
                    code == Some(SIGKILL_EXIT_CODE) && matches!(runtime.oom_killed(name).await, Ok(true));
                let mut stderr = outcome.stderr;
                if memory_exceeded {
                    stderr.push(b"\ncompiler exceeded the memory limit\n");
                }
                return finish(execution, ExecutionState::CompileFailed, code, outcome.stdout, stderr, outcome.elapsed);
            }
            Ok(PhaseEnd::Deadline) => {
                kill(&**runtime, name).await;
                let mut stderr = outcome.stderr;
                let message = Error::CompilationTimedOut {
                    timeout: limits.compile_time,
                };
                stderr.push(format!("\n{}\n", message).as_bytes());
                return finish(execution, ExecutionState::CompileFailed, None, outcome.stdout, stderr, outcome.elapsed);
            }
            Ok(PhaseEnd::Cancelled) => {
                kill(&**runtime, name).await;
                return finish(
                    execution,
                    ExecutionState::TimedOut,
                    None,
                    outcome.stdout,
                    outcome.stderr,
                    outcome.elapsed,
                );
            }
            Err(e) => return infra(execution, e, started.elapsed()),
        }
    }

    execution.enter(ExecutionState::Running);
    let outcome = run_phase(&**runtime, name, &handle.plan().run, limits.wall_time, limits, cancel).await;

    let (state, exit_code) = match outcome.end {
        Ok(PhaseEnd::Exited(Some(0))) => (ExecutionState::Completed, Some(0)),
        Ok(PhaseEnd::Exited(Some(code))) if code == SIGKILL_EXIT_CODE => match runtime.oom_killed(name).await {
            Ok(true) => (ExecutionState::MemoryExceeded, None),
            Ok(false) => (ExecutionState::Crashed, Some(code)),
            Err(e) => {
                log::warn!("Unable to check OOM state of sandbox {}: {}", name, e);
                (ExecutionState::Crashed, Some(code))
            }
        },
        Ok(PhaseEnd::Exited(Some(code))) => (ExecutionState::Crashed, Some(code)),
        Ok(PhaseEnd::Exited(None)) => {
            let e = Error::UnableToCollectOutput {
                name: name.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "exec client terminated by a signal"),
            };
            return infra(execution, e, outcome.elapsed);
        }
        Ok(PhaseEnd::Deadline) | Ok(PhaseEnd::Cancelled) => {
            kill(&**runtime, name).await;
            (ExecutionState::TimedOut, None)
        }
        Err(e) => return infra(execution, e, outcome.elapsed),
    };

    finish(execution, state, exit_code, outcome.stdout, outcome.stderr, outcome.elapsed)
}

/// Races one command against its deadline and the cancellation token.
/// The first to finish decides the outcome.
async fn run_phase(
    runtime: &dyn ContainerRuntime,
    name: &str,
    command: &str,
    deadline: Duration,
    limits: &ResourceLimits,
    cancel: &CancellationToken,
) -> PhaseOutcome {
    let mut stdout = OutputBuffer::new(limits.max_output_bytes);
    let mut stderr = OutputBuffer::new(limits.max_output_bytes);
    let started = Instant::now();

    let end = {
        let exec = runtime.exec(name, command, &mut stdout, &mut stderr);
        tokio::select! {
            exited = exec => exited.map(PhaseEnd::Exited),
            _ = tokio::time::sleep(deadline) => Ok(PhaseEnd::Deadline),
            _ = cancel.cancelled() => Ok(PhaseEnd::Cancelled),
        }
    };

    PhaseOutcome {
        end,
        stdout,
        stderr,
        elapsed: started.elapsed(),
    }
}

async fn kill(runtime: &dyn ContainerRuntime, name: &str) {
    // Teardown force-removes the container regardless, so a failed kill is not fatal.
    if let Err(e) = runtime.kill(name).await {
        log::warn!("Unable to kill sandbox {}: {}", name, e);
    }
}

fn finish(
    execution: &mut Execution,
    state: ExecutionState,
    exit_code: Option<i32>,
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    elapsed: Duration,
) -> ExecutionResult {
    execution.enter(state);
    let status = state.status().unwrap_or(ExecutionStatus::InfraFailure);
    ExecutionResult::new(
        execution.submission_id,
        status,
        exit_code,
        stdout.into_captured(),
        stderr.into_captured(),
        elapsed,
    )
}

fn infra(execution: &mut Execution, error: Error, elapsed: Duration) -> ExecutionResult {
    log::error!(
        "Infrastructure failure in sandbox {} for submission {}: {}",
        execution.sandbox,
        execution.submission_id,
        error
    );
    execution.enter(ExecutionState::InfraFailure);
    ExecutionResult::infra_failure(execution.submission_id, elapsed)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        launcher::SandboxLauncher,
        registry::LanguageRegistry,
        runtime::{
            fake::{FakeExec, FakeRuntime},
            SandboxUser,
        },
        sandbox::TeardownPolicy,
        submission::Submission,
        workspace::WorkspaceBuilder,
    };
    use std::sync::Arc;
    use tempdir::TempDir;

    struct Harness {
        root: TempDir,
        runtime: Arc<FakeRuntime>,
    }

    impl Harness {
        fn new(script: impl Fn(&str) -> FakeExec + Send + Sync + 'static) -> Self {
            Harness {
                root: TempDir::new("supervisor-test").unwrap(),
                runtime: Arc::new(FakeRuntime::new(script)),
            }
        }

        async fn run(&self, language: &str, limits: ResourceLimits) -> ExecutionResult {
            self.run_with(language, limits, CancellationToken::new()).await
        }

        async fn run_with(
            &self,
            language: &str,
            limits: ResourceLimits,
            cancel: CancellationToken,
        ) -> ExecutionResult {
            let profile = LanguageRegistry::builtin().unwrap().lookup(language).unwrap();
            let submission = Submission::new(language, "source", "7");
            let workspace = WorkspaceBuilder::new(self.root.path())
                .build(&submission, &profile)
                .unwrap();
            let launcher = SandboxLauncher::new(
                self.runtime.clone(),
                SandboxUser::nobody(),
                1024 * 1024,
                TeardownPolicy {
                    initial_backoff_ms: 1,
                    ..Default::default()
                },
            );
            let handle = launcher.launch(&profile, workspace, &limits).await.unwrap();
            Supervisor::new()
                .supervise(submission.id(), handle, &limits, &cancel)
                .await
        }

        fn assert_clean(&self) {
            assert_eq!(self.runtime.live(), 0, "container leaked");
            assert!(
                std::fs::read_dir(self.root.path()).unwrap().next().is_none(),
                "workspace leaked"
            );
        }
    }

    fn compile_ok_run(run: FakeExec) -> impl Fn(&str) -> FakeExec + Send + Sync + 'static {
        move |command: &str| {
            if command.starts_with("g++") {
                FakeExec::exit(0)
            } else {
                run.clone()
            }
        }
    }

    #[test]
    fn transitions_follow_the_lifecycle() {
        use ExecutionState::*;

        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(CompileFailed));
        assert!(Running.can_transition_to(TimedOut));
        assert!(TimedOut.can_transition_to(Teardown));
        assert!(Teardown.can_transition_to(Done));

        assert!(!Starting.can_transition_to(Completed));
        assert!(!Running.can_transition_to(CompileFailed));
        assert!(!Running.can_transition_to(Teardown));
        assert!(!Done.can_transition_to(Starting));
        assert!(!Teardown.can_transition_to(Running));
    }

    #[tokio::test]
    async fn natural_exit_completes_with_output() {
        let harness = Harness::new(compile_ok_run(FakeExec::exit(0).stdout(b"49\n")));

        let result = harness.run("cpp", ResourceLimits::default()).await;

        assert_eq!(result.status(), ExecutionStatus::Completed);
        assert_eq!(result.exit_code(), Some(0));
        assert_eq!(result.stdout().as_bytes(), b"49\n");
        assert_eq!(harness.runtime.execs().len(), 2);
        harness.assert_clean();
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_runtime_error_with_exact_code() {
        let harness = Harness::new(compile_ok_run(FakeExec::exit(3).stderr(b"boom")));

        let result = harness.run("cpp", ResourceLimits::default()).await;

        assert_eq!(result.status(), ExecutionStatus::RuntimeError);
        assert_eq!(result.exit_code(), Some(3));
        assert_eq!(result.stderr().text(), "boom");
        harness.assert_clean();
    }

    #[tokio::test]
    async fn compile_failure_skips_the_run_phase() {
        let harness = Harness::new(|command: &str| {
            if command.starts_with("g++") {
                FakeExec::exit(1).stderr(b"solution.cpp:1:1: error: expected ';'")
            } else {
                panic!("run phase must not execute");
            }
        });

        let result = harness.run("cpp", ResourceLimits::default()).await;

        assert_eq!(result.status(), ExecutionStatus::CompileFailed);
        assert!(result.stderr().text().contains("error: expected ';'"));
        assert_eq!(harness.runtime.execs().len(), 1);
        harness.assert_clean();
    }

    #[tokio::test]
    async fn slow_compile_is_a_compile_failure() {
        let harness = Harness::new(|_: &str| FakeExec::exit(0).delay(Duration::from_secs(5)));
        let limits = ResourceLimits {
            compile_time: Duration::from_millis(20),
            ..Default::default()
        };

        let result = harness.run("cpp", limits).await;

        assert_eq!(result.status(), ExecutionStatus::CompileFailed);
        assert!(result.stderr().text().contains("Compilation took longer than 20 ms"));
        assert_eq!(harness.runtime.kills(), 1);
        harness.assert_clean();
    }

    #[tokio::test]
    async fn wall_time_expiry_kills_and_times_out() {
        let harness = Harness::new(compile_ok_run(
            FakeExec::exit(0).stdout(b"partial").delay(Duration::from_secs(5)),
        ));
        let limits = ResourceLimits {
            wall_time: Duration::from_millis(50),
            ..Default::default()
        };

        let result = harness.run("cpp", limits).await;

        assert_eq!(result.status(), ExecutionStatus::TimedOut);
        assert_eq!(result.exit_code(), None);
        assert_eq!(result.stdout().as_bytes(), b"partial");
        assert!(result.elapsed() >= Duration::from_millis(50));
        assert!(result.elapsed() < Duration::from_secs(2));
        assert_eq!(harness.runtime.kills(), 1);
        harness.assert_clean();
    }

    #[tokio::test]
    async fn oom_kill_is_memory_exceeded() {
        let harness = Harness::new(|_: &str| FakeExec::exit(0).oom());

        let result = harness.run("python", ResourceLimits::default()).await;

        assert_eq!(result.status(), ExecutionStatus::MemoryExceeded);
        assert_eq!(result.exit_code(), None);
        harness.assert_clean();
    }

    #[tokio::test]
    async fn sigkill_without_oom_is_a_crash() {
        let harness = Harness::new(|_: &str| FakeExec::exit(SIGKILL_EXIT_CODE));

        let result = harness.run("python", ResourceLimits::default()).await;

        assert_eq!(result.status(), ExecutionStatus::RuntimeError);
        assert_eq!(result.exit_code(), Some(SIGKILL_EXIT_CODE));
    }

    #[tokio::test]
    async fn output_is_truncated_without_changing_status() {
        let flood = vec![b'x'; 4096];
        let harness = Harness::new(move |_: &str| FakeExec::exit(0).stdout(&flood));
        let limits = ResourceLimits {
            max_output_bytes: 100,
            ..Default::default()
        };

        let result = harness.run("python", limits).await;

        assert_eq!(result.status(), ExecutionStatus::Completed);
        assert_eq!(result.stdout().as_bytes().len(), 100);
        assert!(result.stdout().truncated());
        assert!(!result.stderr().truncated());
    }

    #[tokio::test]
    async fn cancellation_takes_the_timeout_path() {
        let harness = Harness::new(|_: &str| FakeExec::exit(0).delay(Duration::from_secs(5)));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = harness.run_with("python", ResourceLimits::default(), cancel).await;

        assert_eq!(result.status(), ExecutionStatus::TimedOut);
        assert_eq!(harness.runtime.kills(), 1);
        harness.assert_clean();
    }

    #[tokio::test]
    async fn dead_container_is_an_infra_failure() {
        let harness = Harness::new(|_: &str| FakeExec::exit(0));
        let profile = LanguageRegistry::builtin().unwrap().lookup("python").unwrap();
        let submission = Submission::new("python", "", "");
        let workspace = WorkspaceBuilder::new(harness.root.path())
            .build(&submission, &profile)
            .unwrap();
        let launcher = SandboxLauncher::new(
            harness.runtime.clone(),
            SandboxUser::nobody(),
            1024,
            TeardownPolicy::default(),
        );
        let handle = launcher
            .launch(&profile, workspace, &ResourceLimits::default())
            .await
            .unwrap();
        harness.runtime.kill(handle.name()).await.unwrap();

        let result = Supervisor::new()
            .supervise(submission.id(), handle, &ResourceLimits::default(), &CancellationToken::new())
            .await;

        assert_eq!(result.status(), ExecutionStatus::InfraFailure);
        assert!(!result.stderr().text().contains("code-runner-"));
        harness.assert_clean();
    }
}
