//! Bounded-timeout execution of external collaborators.
//!
//! Every build, sync, install and restart step is an out-of-process command.
//! The dispatcher only ever talks to them through [`CommandRunner`], so tests
//! can substitute a recording fake.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::debug;

/// Bytes of stdout/stderr kept for log messages.
const OUTPUT_TAIL_BYTES: usize = 2048;

const PIPE_GRACE: Duration = Duration::from_secs(1);

/// How a collaborator is launched, as written in `deploy-watch.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandSpec {
    /// Program followed by its arguments. `{mode}` is substituted per call.
    #[serde(default)]
    pub argv: Vec<String>,
    /// Overrides the cycle-wide default timeout.
    pub timeout_secs: Option<u64>,
    /// Working directory, relative to the project root.
    pub workdir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(argv: &[&str]) -> Self {
        Self {
            argv: argv.iter().map(|a| a.to_string()).collect(),
            timeout_secs: None,
            workdir: None,
        }
    }
}

/// A fully resolved collaborator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub name: String,
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    /// Resolve `spec` for one call: substitute `{mode}`, pick the timeout and
    /// export the mode/timeout to the child environment.
    pub fn from_spec(
        name: &str,
        spec: &CommandSpec,
        project_root: &std::path::Path,
        default_timeout: Duration,
        mode: Option<&str>,
    ) -> Self {
        let timeout = spec
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default_timeout);
        let argv = spec
            .argv
            .iter()
            .map(|arg| match mode {
                Some(mode) => arg.replace("{mode}", mode),
                None => arg.clone(),
            })
            .collect();
        let workdir = match &spec.workdir {
            Some(dir) => project_root.join(dir),
            None => project_root.to_path_buf(),
        };

        let mut env = vec![(
            "DEPLOY_WATCH_TIMEOUT_SECS".to_string(),
            timeout.as_secs().to_string(),
        )];
        if let Some(mode) = mode {
            env.push(("DEPLOY_WATCH_MODE".to_string(), mode.to_string()));
        }

        Self {
            name: name.to_string(),
            argv,
            workdir,
            timeout,
            env,
        }
    }
}

/// A collaborator that exited zero in time.
#[derive(Debug, Clone, Default)]
pub struct Completed {
    pub elapsed: Duration,
    pub output_tail: String,
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("{name}: no command configured")]
    EmptyCommand { name: String },

    #[error("{name}: failed to start {program}: {source}")]
    Spawn {
        name: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{name}: timed out after {}s and was killed", .after.as_secs_f64())]
    Timeout { name: String, after: Duration },

    #[error("{name}: exited with code {}", .code.map_or_else(|| "none (signal)".to_string(), |c| c.to_string()))]
    Failed {
        name: String,
        code: Option<i32>,
        output_tail: String,
    },

    #[error("{name}: lost track of child process: {source}")]
    Wait {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl ActionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Captured output, when the child got far enough to produce some.
    pub fn output_tail(&self) -> Option<&str> {
        match self {
            Self::Failed { output_tail, .. } if !output_tail.is_empty() => Some(output_tail),
            _ => None,
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> Result<Completed, ActionError>;
}

/// Runs collaborators as child processes, killing them when their timeout
/// elapses.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, inv: &Invocation) -> Result<Completed, ActionError> {
        let Some((program, args)) = inv.argv.split_first() else {
            return Err(ActionError::EmptyCommand {
                name: inv.name.clone(),
            });
        };

        debug!(
            action = %inv.name,
            command = %inv.argv.join(" "),
            timeout_secs = inv.timeout.as_secs(),
            "spawning collaborator"
        );

        let started = Instant::now();
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&inv.workdir)
            .envs(inv.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout can take down everything it started.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| ActionError::Spawn {
            name: inv.name.clone(),
            program: program.clone(),
            source,
        })?;
        let pid = child.id();

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = match tokio::time::timeout(inv.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(source)) => {
                return Err(ActionError::Wait {
                    name: inv.name.clone(),
                    source,
                });
            }
            Err(_) => {
                kill_group(pid);
                let _ = child.kill().await;
                // Grandchildren may keep the pipes open; don't wait on readers.
                abort(stdout);
                abort(stderr);
                return Err(ActionError::Timeout {
                    name: inv.name.clone(),
                    after: inv.timeout,
                });
            }
        };

        let mut output = collect(stdout).await;
        output.extend_from_slice(&collect(stderr).await);
        let output_tail = tail(&output);
        let elapsed = started.elapsed();

        debug!(
            action = %inv.name,
            code = ?status.code(),
            elapsed_ms = elapsed.as_millis() as u64,
            "collaborator exited"
        );

        if status.success() {
            Ok(Completed {
                elapsed,
                output_tail,
            })
        } else {
            Err(ActionError::Failed {
                name: inv.name.clone(),
                code: status.code(),
                output_tail,
            })
        }
    }
}

/// SIGKILL the collaborator's whole process group.
#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!(pid, error = %err, "process group already gone");
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

fn drain<R: AsyncRead + Unpin + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf).await;
        buf
    })
}

/// Bytes read from a pipe. A daemonized grandchild can hold the pipe open
/// after the child exits, so reading is cut off shortly after exit.
async fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let Some(mut h) = handle else {
        return Vec::new();
    };
    match tokio::time::timeout(PIPE_GRACE, &mut h).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(_)) => Vec::new(),
        Err(_) => {
            h.abort();
            Vec::new()
        }
    }
}

fn abort(handle: Option<JoinHandle<Vec<u8>>>) {
    if let Some(h) = handle {
        h.abort();
    }
}

fn tail(output: &[u8]) -> String {
    let start = output.len().saturating_sub(OUTPUT_TAIL_BYTES);
    String::from_utf8_lossy(&output[start..]).trim().to_string()
}
