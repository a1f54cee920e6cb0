use super::{ContainerRuntime, ContainerSpec, MANAGED_LABEL};
use crate::{output::OutputBuffer, Error, Result};
use async_trait::async_trait;
use std::process::{Output, Stdio};
use tokio::{io::AsyncRead, io::AsyncReadExt, process::Command};

macro_rules! docker_command {
    ($binary:expr, $($arg:expr),* $(,)?) => ({
        let mut cmd = Command::new($binary);
        $( cmd.arg($arg); )*
        cmd.kill_on_drop(true);
        cmd
    });
}

/// Drives containers through the `docker` command line, or any CLI-compatible
/// replacement such as `podman`.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        DockerCli {
            binary: binary.into(),
        }
    }

    /// Arguments for `docker create`, in order.
    pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            spec.name.clone(),
            "--user".into(),
            spec.user.to_string(),
            "--cap-drop=ALL".into(),
            "--security-opt=no-new-privileges".into(),
            "--net".into(),
            "none".into(),
            "--memory".into(),
            spec.memory_bytes.to_string(),
            "--memory-swap".into(),
            spec.memory_bytes.to_string(),
            "--cpus".into(),
            format!("{}", spec.cpus),
            "--pids-limit".into(),
            spec.pids.to_string(),
            "--ulimit".into(),
            "core=0".into(),
            "--tmpfs".into(),
            format!(
                "{}:rw,exec,nosuid,nodev,size={}",
                spec.scratch_target, spec.scratch_bytes
            ),
            "--mount".into(),
            format!(
                "type=bind,source={},target={},readonly",
                spec.workspace_source.display(),
                spec.workspace_target
            ),
            "--workdir".into(),
            spec.scratch_target.clone(),
            "--env".into(),
            format!("HOME={}", spec.scratch_target),
        ];

        if spec.read_only_root {
            args.push("--read-only".into());
        }

        for (key, value) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }

        args.push("--entrypoint".into());
        args.push("".into());
        args.push(spec.image.clone());
        args.push("sleep".into());
        args.push(spec.keep_alive.as_secs().max(1).to_string());

        args
    }

    async fn run(&self, command: &'static str, mut cmd: Command) -> Result<Output> {
        log::debug!("Runtime command is {:?}", cmd);
        cmd.stdin(Stdio::null());
        let output = cmd
            .output()
            .await
            .map_err(|e| Error::UnableToStartRuntime { source: e })?;

        if output.status.success() {
            Ok(output)
        } else {
            Err(Error::RuntimeCommandFailed {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        DockerCli::new("docker")
    }
}

fn first_line(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or("")
        .trim()
        .to_string()
}

fn is_missing_container(err: &Error) -> bool {
    match err {
        Error::RuntimeCommandFailed { stderr, .. } => {
            let stderr = stderr.to_lowercase();
            stderr.contains("no such container") || stderr.contains("no container with name")
        }
        _ => false,
    }
}

/// Parses the `oom_kill` counter out of a cgroup v2 `memory.events` file.
pub(crate) fn oom_kills(memory_events: &str) -> Option<u64> {
    memory_events.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("oom_kill"), Some(count)) => count.parse().ok(),
            _ => None,
        }
    })
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R, buffer: &mut OutputBuffer) -> std::io::Result<()> {
    let mut chunk = [0u8; 8 * 1024];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buffer.push(&chunk[..n]);
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn version(&self) -> Result<String> {
        let cmd = docker_command!(&self.binary, "version", "--format", "{{.Server.Version}}");
        let output = self.run("version", cmd).await?;
        Ok(first_line(&output))
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        let cmd = docker_command!(&self.binary, "image", "inspect", "--format", "{{.Id}}", image);
        if self.run("image inspect", cmd).await.is_ok() {
            return Ok(());
        }

        log::info!("Pulling image {}", image);
        let cmd = docker_command!(&self.binary, "pull", "--quiet", image);
        self.run("pull", cmd).await.map(drop)
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(DockerCli::create_args(spec)).kill_on_drop(true);
        let output = self.run("create", cmd).await?;

        let id = first_line(&output);
        if id.is_empty() {
            return Err(Error::MissingContainerId);
        }
        Ok(id)
    }

    async fn start(&self, name: &str) -> Result<()> {
        let cmd = docker_command!(&self.binary, "start", name);
        self.run("start", cmd).await.map(drop)
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        let cmd = docker_command!(&self.binary, "inspect", "--format", "{{.State.Running}}", name);
        let output = self.run("inspect", cmd).await?;
        Ok(first_line(&output) == "true")
    }

    async fn exec(
        &self,
        name: &str,
        command: &str,
        stdout: &mut OutputBuffer,
        stderr: &mut OutputBuffer,
    ) -> Result<Option<i32>> {
        let mut cmd = docker_command!(&self.binary, "exec", name, "sh", "-c", command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        log::debug!("Exec command is {:?}", cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::UnableToStartRuntime { source: e })?;
        let collect_error = |source| Error::UnableToCollectOutput {
            name: name.to_string(),
            source,
        };

        let child_stdout = child.stdout.take();
        let child_stderr = child.stderr.take();
        let (out, err) = match (child_stdout, child_stderr) {
            (Some(out), Some(err)) => (out, err),
            _ => {
                return Err(collect_error(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "output pipes were not captured",
                )))
            }
        };

        let (_, _, status) = tokio::try_join!(drain(out, stdout), drain(err, stderr), child.wait())
            .map_err(collect_error)?;

        Ok(status.code())
    }

    async fn kill(&self, name: &str) -> Result<()> {
        let cmd = docker_command!(&self.binary, "kill", "--signal", "KILL", name);
        match self.run("kill", cmd).await {
            Ok(_) => Ok(()),
            // Already stopped or already gone; either way nothing is running.
            Err(Error::RuntimeCommandFailed { ref stderr, .. }) if stderr.contains("is not running") => Ok(()),
            Err(e) if is_missing_container(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn oom_killed(&self, name: &str) -> Result<bool> {
        let cmd = docker_command!(&self.binary, "exec", name, "cat", "/sys/fs/cgroup/memory.events");
        if let Ok(output) = self.run("exec", cmd).await {
            if let Some(kills) = oom_kills(&String::from_utf8_lossy(&output.stdout)) {
                return Ok(kills > 0);
            }
        }

        // cgroup v1 hosts, or the container itself was killed.
        let cmd = docker_command!(&self.binary, "inspect", "--format", "{{.State.OOMKilled}}", name);
        let output = self.run("inspect", cmd).await?;
        Ok(first_line(&output) == "true")
    }

    async fn remove(&self, name: &str) -> Result<()> {
        // Kills container if still running
        let mut cmd = docker_command!(&self.binary, "rm", "--force", "--volumes", name);
        cmd.stdout(Stdio::null());
        match self.run("rm", cmd).await {
            Err(e) if is_missing_container(&e) => Ok(()),
            other => other.map(drop),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let filter = format!("name=^/?{}$", name);
        let cmd = docker_command!(&self.binary, "ps", "--all", "--quiet", "--filter", filter);
        let output = self.run("ps", cmd).await?;
        Ok(!first_line(&output).is_empty())
    }

    async fn list_managed(&self) -> Result<Vec<String>> {
        let filter = format!("label={}=true", MANAGED_LABEL);
        let cmd = docker_command!(
            &self.binary,
            "ps",
            "--all",
            "--filter",
            filter,
            "--format",
            "{{.Names}}",
        );
        let output = self.run("ps", cmd).await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}
