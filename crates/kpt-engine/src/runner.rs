//! Running KRM functions in a container or as a local executable
//!
//! A function reads a `ResourceList` on stdin and writes one on stdout.
//! Containers run without network access, as an unprivileged user, with
//! the package mounted read-only at `/source`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use kpt_core::Function;

use crate::error::{EngineError, Result};

/// Number of stderr lines kept in errors when truncation is on
pub const DEFAULT_STDERR_LINES: usize = 4;

/// Exit code the container runtimes use for their own failures
const RUNTIME_FAILURE_EXIT_CODE: i32 = 125;

/// When the container runtime pulls function images
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImagePullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

impl ImagePullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImagePullPolicy::Always => "always",
            ImagePullPolicy::IfNotPresent => "ifNotPresent",
            ImagePullPolicy::Never => "never",
        }
    }

    /// Value of the runtime's `--pull` flag
    fn pull_flag(&self) -> &'static str {
        match self {
            ImagePullPolicy::Always => "always",
            ImagePullPolicy::IfNotPresent => "missing",
            ImagePullPolicy::Never => "never",
        }
    }
}

impl fmt::Display for ImagePullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImagePullPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "always" | "Always" => Ok(ImagePullPolicy::Always),
            "ifNotPresent" | "IfNotPresent" | "if-not-present" => Ok(ImagePullPolicy::IfNotPresent),
            "never" | "Never" => Ok(ImagePullPolicy::Never),
            other => Err(format!(
                "unknown image pull policy '{}', expected always, ifNotPresent or never",
                other
            )),
        }
    }
}

/// Container runtime used for image functions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContainerRuntime {
    #[default]
    Docker,
    Podman,
    Nerdctl,
}

impl ContainerRuntime {
    /// Environment variable selecting the runtime
    pub const ENV: &'static str = "KPT_FN_RUNTIME";

    pub fn binary(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
            ContainerRuntime::Nerdctl => "nerdctl",
        }
    }
}

impl fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

impl FromStr for ContainerRuntime {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "docker" => Ok(ContainerRuntime::Docker),
            "podman" => Ok(ContainerRuntime::Podman),
            "nerdctl" => Ok(ContainerRuntime::Nerdctl),
            other => Err(format!(
                "unsupported function runtime '{}', expected docker, podman or nerdctl",
                other
            )),
        }
    }
}

/// Options shared by every function run of one invocation
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub runtime: ContainerRuntime,
    pub image_pull_policy: ImagePullPolicy,
    pub allow_exec: bool,
    pub truncate_output: bool,
    pub timeout: Option<Duration>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            runtime: ContainerRuntime::default(),
            image_pull_policy: ImagePullPolicy::default(),
            allow_exec: false,
            truncate_output: true,
            timeout: None,
        }
    }
}

impl RunnerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runtime(mut self, runtime: ContainerRuntime) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_image_pull_policy(mut self, policy: ImagePullPolicy) -> Self {
        self.image_pull_policy = policy;
        self
    }

    pub fn with_allow_exec(mut self, allow: bool) -> Self {
        self.allow_exec = allow;
        self
    }

    pub fn with_truncate_output(mut self, truncate: bool) -> Self {
        self.truncate_output = truncate;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Runs an image function through the container runtime
#[derive(Debug, Clone)]
pub struct ContainerRunner {
    image: String,
    runtime: ContainerRuntime,
    pull_policy: ImagePullPolicy,
    source: PathBuf,
}

/// Runs a local executable
#[derive(Debug, Clone)]
pub struct ExecRunner {
    command: String,
    program: String,
    args: Vec<String>,
    cwd: PathBuf,
}

/// What a function process produced
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub exit_code: i32,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A runnable function, either sandboxed or local
#[derive(Debug, Clone)]
pub enum FunctionRunner {
    Container(ContainerRunner),
    Exec(ExecRunner),
}

impl FunctionRunner {
    /// Build the runner for `function` executed on the package at `pkg_dir`
    pub fn new(function: &Function, pkg_dir: &Path, options: &RunnerOptions) -> Result<Self> {
        if let Some(image) = function.image_ref() {
            return Ok(FunctionRunner::Container(ContainerRunner {
                image,
                runtime: options.runtime,
                pull_policy: options.image_pull_policy,
                source: pkg_dir.to_path_buf(),
            }));
        }

        let command = function.exec.clone().unwrap_or_default();
        if !options.allow_exec {
            return Err(EngineError::ExecNotAllowed { exec: command });
        }
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| {
            EngineError::Core(kpt_core::CoreError::InvalidFunction {
                message: "exec must not be empty".to_string(),
            })
        })?;
        Ok(FunctionRunner::Exec(ExecRunner {
            program,
            args: parts.collect(),
            command,
            cwd: pkg_dir.to_path_buf(),
        }))
    }

    /// Image reference or exec command line
    pub fn id(&self) -> &str {
        match self {
            FunctionRunner::Container(c) => &c.image,
            FunctionRunner::Exec(e) => &e.command,
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, FunctionRunner::Container(_))
    }

    fn command(&self) -> Command {
        match self {
            FunctionRunner::Container(c) => {
                let mut cmd = Command::new(c.runtime.binary());
                cmd.arg("run")
                    .arg("--rm")
                    .arg("-i")
                    .args(["--network", "none"])
                    .args(["--user", "nobody"])
                    .arg("--security-opt=no-new-privileges")
                    .args(["--pull", c.pull_policy.pull_flag()])
                    .arg("--mount")
                    .arg(format!(
                        "type=bind,src={},dst=/source,readonly",
                        c.source.display()
                    ))
                    .args(["--tmpfs", "/tmp"])
                    .arg(&c.image);
                cmd
            }
            FunctionRunner::Exec(e) => {
                let mut cmd = Command::new(&e.program);
                cmd.args(&e.args).current_dir(&e.cwd);
                cmd
            }
        }
    }

    /// Run the function process with `input` on stdin
    ///
    /// The process is killed when `cancel` fires or the timeout elapses.
    /// A runtime failure to pull the image is reported as
    /// [`EngineError::ContainerImage`]; any other exit status is returned
    /// to the caller.
    pub async fn run(
        &self,
        input: Vec<u8>,
        options: &RunnerOptions,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput> {
        let id = self.id().to_string();
        tracing::debug!(function = %id, "starting function");

        let mut child = self
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                id: id.clone(),
                source,
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let mut stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let mut stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        let writer = tokio::spawn(async move {
            match stdin.write_all(&input).await {
                // functions may exit without reading their input
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }
        });
        let out_reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await.map(|_| buf)
        });
        let err_reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await.map(|_| buf)
        });

        let timeout = options.timeout;
        let deadline = async move {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                writer.abort();
                tracing::debug!(function = %id, "function cancelled");
                return Err(EngineError::Cancelled);
            }
            _ = deadline => {
                let _ = child.kill().await;
                writer.abort();
                return Err(EngineError::Timeout {
                    id,
                    timeout: timeout.unwrap_or_default(),
                });
            }
        };

        joined(writer.await)?;
        let stdout = joined(out_reader.await)?;
        let stderr = String::from_utf8_lossy(&joined(err_reader.await)?).into_owned();
        let exit_code = status.code().unwrap_or(-1);
        tracing::debug!(function = %id, exit_code, "function finished");

        if let FunctionRunner::Container(c) = self {
            if exit_code == RUNTIME_FAILURE_EXIT_CODE && is_pull_failure(&stderr) {
                return Err(EngineError::ContainerImage {
                    image: c.image.clone(),
                    message: stderr.trim().to_string(),
                });
            }
        }

        Ok(ProcessOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}

fn missing_pipe(name: &str) -> EngineError {
    EngineError::Io(std::io::Error::other(format!(
        "function {} was not captured",
        name
    )))
}

fn joined<T>(
    result: std::result::Result<std::io::Result<T>, tokio::task::JoinError>,
) -> Result<T> {
    match result {
        Ok(inner) => Ok(inner?),
        Err(e) => Err(EngineError::Io(std::io::Error::other(e))),
    }
}

fn is_pull_failure(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    [
        "unable to find image",
        "pull access denied",
        "manifest unknown",
        "not found",
        "failed to resolve",
        "error pulling image",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

/// Keep the first lines of `stderr`, noting how many were dropped
pub fn truncate_stderr(stderr: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = stderr.trim_end().lines().collect();
    if lines.len() <= max_lines {
        return stderr.trim_end().to_string();
    }
    format!(
        "{}\n...({} line(s) truncated, use '--truncate-output=false' to disable)",
        lines[..max_lines].join("\n"),
        lines.len() - max_lines
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec_function(cmd: &str) -> Function {
        Function {
            exec: Some(cmd.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_pull_policy_parsing() {
        assert_eq!("always".parse::<ImagePullPolicy>().unwrap(), ImagePullPolicy::Always);
        assert_eq!(
            "ifNotPresent".parse::<ImagePullPolicy>().unwrap(),
            ImagePullPolicy::IfNotPresent
        );
        assert!("sometimes".parse::<ImagePullPolicy>().is_err());
        assert_eq!(ImagePullPolicy::IfNotPresent.pull_flag(), "missing");
        assert_eq!("Podman".parse::<ContainerRuntime>().unwrap(), ContainerRuntime::Podman);
    }

    #[test]
    fn test_exec_requires_opt_in() {
        let err = FunctionRunner::new(
            &exec_function("./fn.sh"),
            Path::new("/pkg"),
            &RunnerOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::ExecNotAllowed { .. }));
    }

    #[test]
    fn test_container_command_line() {
        let function = Function {
            image: Some("set-namespace:v0.4".to_string()),
            ..Default::default()
        };
        let runner = FunctionRunner::new(
            &function,
            Path::new("/work/pkg"),
            &RunnerOptions::default().with_image_pull_policy(ImagePullPolicy::Never),
        )
        .unwrap();
        assert_eq!(runner.id(), "gcr.io/kpt-fn/set-namespace:v0.4");

        let cmd = runner.command();
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "docker");
        let args: Vec<String> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args.join(" "),
            "run --rm -i --network none --user nobody --security-opt=no-new-privileges \
             --pull never --mount type=bind,src=/work/pkg,dst=/source,readonly --tmpfs /tmp \
             gcr.io/kpt-fn/set-namespace:v0.4"
        );
    }

    #[test]
    fn test_truncate_stderr() {
        let stderr = "1\n2\n3\n4\n5\n6\n";
        assert_eq!(
            truncate_stderr(stderr, DEFAULT_STDERR_LINES),
            "1\n2\n3\n4\n...(2 line(s) truncated, use '--truncate-output=false' to disable)"
        );
        assert_eq!(truncate_stderr("only\n", DEFAULT_STDERR_LINES), "only");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_roundtrips_stdin() {
        let dir = tempfile::TempDir::new().unwrap();
        let options = RunnerOptions::default().with_allow_exec(true);
        let runner = FunctionRunner::new(&exec_function("cat"), dir.path(), &options).unwrap();

        let output = runner
            .run(b"hello\n".to_vec(), &options, &CancellationToken::new())
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, b"hello\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_reports_exit_code_and_stderr() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("fail.sh"), "echo boom >&2\nexit 3\n").unwrap();
        let options = RunnerOptions::default().with_allow_exec(true);
        let runner = FunctionRunner::new(&exec_function("sh fail.sh"), dir.path(), &options).unwrap();

        let output = runner
            .run(Vec::new(), &options, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stderr.trim(), "boom");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_kills_the_process() {
        let dir = tempfile::TempDir::new().unwrap();
        let options = RunnerOptions::default().with_allow_exec(true);
        let runner = FunctionRunner::new(&exec_function("sleep 30"), dir.path(), &options).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = runner.run(Vec::new(), &options, &cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout() {
        let dir = tempfile::TempDir::new().unwrap();
        let options = RunnerOptions::default()
            .with_allow_exec(true)
            .with_timeout(Some(Duration::from_millis(50)));
        let runner = FunctionRunner::new(&exec_function("sleep 30"), dir.path(), &options).unwrap();

        let err = runner
            .run(Vec::new(), &options, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }));
    }
}
