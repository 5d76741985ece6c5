//! Core execution logic.
//!
//! A run writes the source file into the session workspace, resolves the
//! language pipeline and spawns each stage as the leader of its own process
//! group. Compile and run share one wall-clock deadline; on expiry the whole
//! group is killed and whatever output was captured so far is returned.

use crate::config::Config;
use crate::error::{ExecError, Result};
use crate::language::{self, Invocation, Language, Plan};
use crate::state::Sessions;
use crate::workspace::{validate_session_id, FileRef, Workspaces};
use serde::Serialize;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long to keep reading pipes after the process group is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(500);
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Variables that tell toolchains where their installation and caches live,
/// with the directory under the server's `HOME` used when the server has the
/// variable unset. Stages run with `HOME` pointed at the workspace, so
/// shims such as rustup cannot find their state without these.
const TOOLCHAIN_VARS: &[(&str, Option<&str>)] = &[
    ("RUSTUP_HOME", Some(".rustup")),
    ("RUSTUP_TOOLCHAIN", None),
    ("CARGO_HOME", Some(".cargo")),
    ("GOROOT", None),
    ("GOPATH", Some("go")),
    ("GOCACHE", Some(".cache/go-build")),
    ("GOMODCACHE", None),
    ("JAVA_HOME", None),
    ("NODE_PATH", None),
    ("NPM_CONFIG_CACHE", Some(".npm")),
    ("R_HOME", None),
    ("R_LIBS_USER", None),
];

/// Environment inherited by every stage, captured once from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainEnv {
    vars: Vec<(String, OsString)>,
}

impl ToolchainEnv {
    pub fn capture() -> Self {
        Self::from_lookup(|name| std::env::var_os(name))
    }

    fn from_lookup(get: impl Fn(&str) -> Option<OsString>) -> Self {
        let home = get("HOME").map(PathBuf::from);
        let mut vars = vec![(
            "PATH".to_string(),
            get("PATH").unwrap_or_else(|| DEFAULT_PATH.into()),
        )];
        for &(name, under_home) in TOOLCHAIN_VARS {
            let value = get(name).or_else(|| {
                let dir = home.as_ref()?.join(under_home?);
                dir.is_dir().then(|| dir.into_os_string())
            });
            if let Some(value) = value {
                vars.push((name.to_string(), value));
            }
        }
        Self { vars }
    }

    pub fn get(&self, name: &str) -> Option<&OsStr> {
        self.vars
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_os_str())
    }
}

/// One execute call.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub code: String,
    pub lang: String,
    pub args: Option<String>,
    pub session_id: Option<String>,
    pub files: Vec<FileRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    CompileFailed,
    TimedOut,
}

/// Captured outcome of a program. Produced exactly once per execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// Exit code of the last stage that ran; absent when it was killed.
    pub exit_code: Option<i32>,
    /// Name of the terminating signal, e.g. `SIGKILL` after a timeout.
    pub signal: Option<String>,
    pub outcome: Outcome,
    pub message: Option<String>,
    #[serde(serialize_with = "as_millis")]
    pub elapsed: Duration,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Result plus the workspace accounting around it.
#[derive(Debug, Clone)]
pub struct Execution {
    pub session_id: String,
    pub language: &'static str,
    pub result: ExecutionResult,
    pub artifacts: Vec<String>,
}

/// Runs code for sessions. Cheap to clone.
#[derive(Clone)]
pub struct Runner {
    config: Arc<Config>,
    workspaces: Workspaces,
    sessions: Sessions,
    env: Arc<ToolchainEnv>,
}

impl Runner {
    /// Build a runner. The toolchain environment is read from the current
    /// process here, once.
    pub fn new(config: Arc<Config>, workspaces: Workspaces, sessions: Sessions) -> Self {
        Self {
            config,
            workspaces,
            sessions,
            env: Arc::new(ToolchainEnv::capture()),
        }
    }

    pub fn with_env(mut self, env: ToolchainEnv) -> Self {
        self.env = Arc::new(env);
        self
    }

    pub fn workspaces(&self) -> &Workspaces {
        &self.workspaces
    }

    /// Execute `req` in its session workspace.
    ///
    /// Request problems (unknown language, bad session id, malformed args)
    /// are rejected before the workspace is touched.
    pub async fn execute(&self, req: ExecRequest) -> Result<Execution> {
        if req.code.is_empty() || req.lang.is_empty() {
            return Err(ExecError::InvalidRequest(
                "Missing required parameters: code and lang".into(),
            ));
        }
        let language = language::lookup(&req.lang)?;
        let extra_args = language::split_args(req.args.as_deref())?;
        let session_id = match req.session_id.filter(|s| !s.is_empty()) {
            Some(id) => id,
            None => uuid::Uuid::new_v4().to_string(),
        };
        validate_session_id(&session_id)?;

        let _guard = self.sessions.lock(&session_id).await;

        let workdir = self.workspaces.ensure(&session_id).await?;
        let staged = self.workspaces.stage(&session_id, &req.files).await?;
        if !staged.is_empty() {
            debug!(session = %session_id, files = ?staged, "Staged files");
        }

        let source_name = language.source_file_name();
        fs::write(workdir.join(&source_name), &req.code)
            .await
            .map_err(|e| ExecError::io(format!("write {source_name}"), e))?;
        let tmp = workdir.join(".tmp");
        fs::create_dir_all(&tmp)
            .await
            .map_err(|e| ExecError::io("mkdir .tmp", e))?;

        let plan = language.plan(&workdir, &extra_args);
        info!(session = %session_id, lang = language.tag, "Running code");
        let result = self.run_plan(language, &workdir, &plan).await?;

        let artifacts = self
            .workspaces
            .list_artifacts(&session_id, &source_name)
            .await?;

        info!(
            session = %session_id,
            lang = language.tag,
            outcome = ?result.outcome,
            exit_code = ?result.exit_code,
            elapsed_ms = result.elapsed.as_millis() as u64,
            artifacts = artifacts.len(),
            "Execution finished"
        );

        Ok(Execution {
            session_id,
            language: language.tag,
            result,
            artifacts,
        })
    }

    async fn run_plan(
        &self,
        language: &Language,
        workdir: &Path,
        plan: &Plan,
    ) -> Result<ExecutionResult> {
        let timeout = self.config.exec_timeout();
        let cap = self.config.max_output_bytes;
        let start = Instant::now();
        let deadline = start + timeout;
        let mut stdout = Capture::new(cap);
        let mut stderr = Capture::new(cap);

        if let Some(compile) = &plan.compile {
            debug!(lang = language.tag, program = %compile.program, "Compiling");
            let stage = run_stage(compile, workdir, &self.env, deadline, cap).await?;
            stdout.absorb(&stage.stdout);
            stderr.absorb(&stage.stderr);
            match stage.status {
                StageStatus::TimedOut => {
                    return Ok(timed_out(stdout, stderr, timeout, start.elapsed()));
                }
                StageStatus::Exited(status) if !status.success() => {
                    return Ok(ExecutionResult {
                        exit_code: status.code(),
                        signal: signal_name(&status),
                        outcome: Outcome::CompileFailed,
                        message: Some("Compilation failed".into()),
                        elapsed: start.elapsed(),
                        ..finish(stdout, stderr)
                    });
                }
                StageStatus::Exited(_) => {}
            }
        }

        let stage = run_stage(&plan.run, workdir, &self.env, deadline, cap).await?;
        stdout.absorb(&stage.stdout);
        stderr.absorb(&stage.stderr);
        Ok(match stage.status {
            StageStatus::TimedOut => timed_out(stdout, stderr, timeout, start.elapsed()),
            StageStatus::Exited(status) => ExecutionResult {
                exit_code: status.code(),
                signal: signal_name(&status),
                elapsed: start.elapsed(),
                ..finish(stdout, stderr)
            },
        })
    }
}

fn finish(stdout: Capture, stderr: Capture) -> ExecutionResult {
    ExecutionResult {
        stdout_truncated: stdout.truncated,
        stderr_truncated: stderr.truncated,
        stdout: String::from_utf8_lossy(&stdout.bytes).into_owned(),
        stderr: String::from_utf8_lossy(&stderr.bytes).into_owned(),
        exit_code: None,
        signal: None,
        outcome: Outcome::Completed,
        message: None,
        elapsed: Duration::ZERO,
    }
}

fn timed_out(
    stdout: Capture,
    stderr: Capture,
    timeout: Duration,
    elapsed: Duration,
) -> ExecutionResult {
    ExecutionResult {
        signal: Some("SIGKILL".into()),
        outcome: Outcome::TimedOut,
        message: Some(format!(
            "Execution timed out after {} ms",
            timeout.as_millis()
        )),
        elapsed,
        ..finish(stdout, stderr)
    }
}

#[cfg(unix)]
fn signal_name(status: &ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|sig| {
        nix::sys::signal::Signal::try_from(sig)
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|_| format!("signal {sig}"))
    })
}

#[cfg(not(unix))]
fn signal_name(_status: &ExitStatus) -> Option<String> {
    None
}

/// Output buffer that keeps at most `cap` bytes.
#[derive(Debug, Default)]
struct Capture {
    bytes: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl Capture {
    fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::new(),
            cap,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn absorb(&mut self, other: &Capture) {
        self.push(&other.bytes);
        self.truncated |= other.truncated;
    }
}

enum StageStatus {
    Exited(ExitStatus),
    TimedOut,
}

struct StageOutput {
    status: StageStatus,
    stdout: Capture,
    stderr: Capture,
}

async fn run_stage(
    invocation: &Invocation,
    workdir: &Path,
    env: &ToolchainEnv,
    deadline: Instant,
    cap: usize,
) -> Result<StageOutput> {
    let mut std_cmd = std::process::Command::new(&invocation.program);
    std_cmd
        .args(&invocation.args)
        .current_dir(workdir)
        .env_clear()
        .envs(env.vars.iter().map(|(key, value)| (key, value)))
        .env("HOME", workdir)
        .env("LANG", "C.UTF-8")
        .env("TMPDIR", workdir.join(".tmp"))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        std_cmd.process_group(0);
    }
    let mut cmd = Command::from(std_cmd);
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
        program: invocation.program.clone(),
        source,
    })?;
    let pgid = child.id();
    debug!(program = %invocation.program, pid = ?pgid, "Spawned");

    let stdout = Arc::new(Mutex::new(Capture::new(cap)));
    let stderr = Arc::new(Mutex::new(Capture::new(cap)));
    let out_task = child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(drain(pipe, stdout.clone())));
    let err_task = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(drain(pipe, stderr.clone())));

    let status = match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(Ok(status)) => StageStatus::Exited(status),
        Ok(Err(e)) => {
            kill_group(pgid);
            return Err(ExecError::io(format!("wait {}", invocation.program), e));
        }
        Err(_) => {
            warn!(program = %invocation.program, pid = ?pgid, "Deadline reached, killing process group");
            kill_group(pgid);
            // Reap the leader.
            let _ = child.wait().await;
            StageStatus::TimedOut
        }
    };

    // Anything the program left running in its group goes too, so the pipes
    // reach EOF and nothing outlives the request.
    kill_group(pgid);
    for mut task in [out_task, err_task].into_iter().flatten() {
        if tokio::time::timeout(DRAIN_GRACE, &mut task).await.is_err() {
            task.abort();
        }
    }

    let stdout = std::mem::take(&mut *stdout.lock().await);
    let stderr = std::mem::take(&mut *stderr.lock().await);
    Ok(StageOutput {
        status,
        stdout,
        stderr,
    })
}

/// Read a pipe to EOF into `sink`. Bytes past the cap are read and dropped
/// so the writer never blocks on a full pipe.
async fn drain<R: AsyncRead + Unpin>(mut pipe: R, sink: Arc<Mutex<Capture>>) {
    let mut buf = [0u8; 8192];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink.lock().await.push(&buf[..n]),
        }
    }
}

#[cfg(unix)]
fn kill_group(pgid: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pgid) = pgid else { return };
    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = %e, "killpg failed"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: Option<u32>) {}
