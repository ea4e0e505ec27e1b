//! Runs one analyzer as a supervised child process.
//!
//! The child gets a wall-clock timeout, an optional address-space cap and no
//! core dumps. A non-zero exit is data, not an error: only failing to spawn or
//! collect the process is reported as [`SandboxError`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::SandboxError;
use crate::models::RunRecord;

/// How long to keep draining pipes after the child exited or was killed.
/// Grandchildren that inherited the pipes may keep them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct Sandbox {
    pub timeout: Duration,
    pub memory_limit_mb: Option<u64>,
    pub extra_env: Vec<(String, String)>,
    /// Directories prepended to `PATH` for the child.
    pub path_prefix: Vec<PathBuf>,
}

impl Sandbox {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            memory_limit_mb: None,
            extra_env: Vec::new(),
            path_prefix: Vec::new(),
        }
    }

    pub fn with_memory_limit(mut self, limit_mb: Option<u64>) -> Self {
        self.memory_limit_mb = limit_mb;
        self
    }

    pub fn with_path_prefix(mut self, dirs: Vec<PathBuf>) -> Self {
        self.path_prefix = dirs;
        self
    }

    /// Run `argv` in `cwd` and capture everything it printed.
    pub async fn run(&self, tool: &str, argv: &[String], cwd: &Path) -> Result<RunRecord, SandboxError> {
        let (program, args) = argv.split_first().ok_or_else(|| SandboxError::EmptyCommand {
            tool: tool.to_string(),
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONWARNINGS", "ignore")
            .envs(self.extra_env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(path) = self.child_path() {
            cmd.env("PATH", path);
        }
        apply_limits(&mut cmd, self.memory_limit_mb);

        debug!(tool, cmd = %argv.join(" "), cwd = %cwd.display(), "spawning analyzer");
        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            program: program.clone(),
            source,
        })?;

        let stdout = Capture::start(child.stdout.take());
        let stderr = Capture::start(child.stderr.take());

        let exit_code = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => Some(status.code().unwrap_or(-1)),
            Ok(Err(source)) => {
                return Err(SandboxError::Wait {
                    program: program.clone(),
                    source,
                })
            }
            Err(_) => {
                warn!(tool, timeout_secs = self.timeout.as_secs(), "analyzer timed out, killing it");
                if let Err(err) = child.kill().await {
                    warn!(tool, error = %err, "failed to kill timed out analyzer");
                }
                None
            }
        };

        let stdout = stdout.finish().await;
        let mut stderr = stderr.finish().await;
        let duration_s = started.elapsed().as_secs_f64();

        let exit_code = match exit_code {
            Some(code) => code,
            None => {
                stderr.push_str(&format!("\n[TIMEOUT after {}s]", self.timeout.as_secs()));
                RunRecord::TIMEOUT_EXIT
            }
        };

        let payload = detect_payload(&stdout);
        Ok(RunRecord {
            tool: tool.to_string(),
            cmd: argv.to_vec(),
            cwd: cwd.to_string_lossy().into_owned(),
            exit_code,
            duration_s,
            stdout,
            stderr,
            payload,
        })
    }

    fn child_path(&self) -> Option<std::ffi::OsString> {
        if self.path_prefix.is_empty() {
            return None;
        }
        let inherited = std::env::var_os("PATH").unwrap_or_default();
        let dirs = self
            .path_prefix
            .iter()
            .cloned()
            .chain(std::env::split_paths(&inherited));
        std::env::join_paths(dirs).ok()
    }
}

/// Parse stdout as JSON when it looks like a JSON document.
pub fn detect_payload(stdout: &str) -> Option<Value> {
    let trimmed = stdout.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        serde_json::from_str(trimmed).ok()
    } else {
        None
    }
}

/// Drains one pipe into a shared buffer so partial output survives a kill.
struct Capture {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl Capture {
    fn start<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let task = pipe.map(|mut pipe| {
            let sink = Arc::clone(&buffer);
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                loop {
                    match pipe.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if let Ok(mut buf) = sink.lock() {
                                buf.extend_from_slice(&chunk[..n]);
                            }
                        }
                    }
                }
            })
        });
        Self { buffer, task }
    }

    async fn finish(mut self) -> String {
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(DRAIN_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        let bytes = match self.buffer.lock() {
            Ok(buf) => buf.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(unix)]
fn apply_limits(cmd: &mut Command, memory_limit_mb: Option<u64>) {
    let address_space = memory_limit_mb.map(|mb| mb.saturating_mul(1024 * 1024) as libc::rlim_t);
    // SAFETY: the hook only calls async-signal-safe setrlimit and never allocates.
    unsafe {
        cmd.pre_exec(move || {
            if let Some(bytes) = address_space {
                let limit = libc::rlimit {
                    rlim_cur: bytes,
                    rlim_max: bytes,
                };
                libc::setrlimit(libc::RLIMIT_AS, &limit);
            }
            let no_core = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            libc::setrlimit(libc::RLIMIT_CORE, &no_core);
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_limits(_cmd: &mut Command, _memory_limit_mb: Option<u64>) {}
