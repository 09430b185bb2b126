//! Child process execution
//!
//! [`ProcessRunner`] is the seam between the engine and the operating system.
//! [`ShellRunner`] runs commands through the platform shell, streams output
//! into log files and keeps a bounded tail of each stream in memory.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;

use crate::common::{Error, Result};

pub const STDOUT_LOG: &str = "stdout.log";
pub const STDERR_LOG: &str = "stderr.log";

/// A single command invocation
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    /// Command line passed to the shell
    pub command: String,
    pub work_dir: PathBuf,
    /// Extra environment on top of the inherited one
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    /// Bytes kept in memory per stream
    pub max_output_bytes: usize,
    /// Write `stdout.log` / `stderr.log` into the work dir
    pub write_logs: bool,
    /// 1-based attempt number; later attempts append to the logs
    pub attempt: u32,
}

/// What happened when a command ran
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutcome {
    /// `None` when killed by a signal or timed out
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
    /// Output exceeded the in-memory bound; only the tail was kept
    pub truncated: bool,
}

impl ProcessOutcome {
    /// Successful exit with the given stdout
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    /// Exit with a code and stderr
    pub fn exit(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stderr: stderr.into(),
            ..Default::default()
        }
    }
}

/// Spawns commands for the step executor.
///
/// An `Err` means the process could not be started at all; anything the
/// process itself does (including timing out) is an `Ok` outcome.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, request: &ProcessRequest) -> Result<ProcessOutcome>;
}

/// Runs commands through `sh -c` (`cmd /C` on Windows)
#[derive(Debug, Clone)]
pub struct ShellRunner {
    /// How long to wait for output pipes after the process is gone
    kill_grace: Duration,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl ShellRunner {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    fn command(request: &ProcessRequest) -> Command {
        #[cfg(unix)]
        let mut cmd = {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&request.command);
            // own process group so a timeout can kill the whole tree
            cmd.process_group(0);
            cmd
        };
        #[cfg(not(unix))]
        let mut cmd = {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(&request.command);
            cmd
        };
        cmd.current_dir(&request.work_dir)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ProcessRunner for ShellRunner {
    async fn run(&self, request: &ProcessRequest) -> Result<ProcessOutcome> {
        tokio::fs::create_dir_all(&request.work_dir).await?;
        let (stdout_log, stderr_log) = if request.write_logs {
            (
                Some(open_log(&request.work_dir, STDOUT_LOG, request.attempt).await?),
                Some(open_log(&request.work_dir, STDERR_LOG, request.attempt).await?),
            )
        } else {
            (None, None)
        };

        let start = Instant::now();
        let mut child = Self::command(request)
            .spawn()
            .map_err(|e| Error::ProcessSpawn {
                command: request.command.clone(),
                reason: e.to_string(),
            })?;
        let pid = child.id();
        let mut group = GroupGuard::new(pid);
        tracing::debug!(pid = ?pid, command = %request.command, "Spawned process");

        let stdout = Arc::new(Mutex::new(Capture::new(request.max_output_bytes)));
        let stderr = Arc::new(Mutex::new(Capture::new(request.max_output_bytes)));
        let stdout_task = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(pump(pipe, stdout_log, Arc::clone(&stdout))));
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(pump(pipe, stderr_log, Arc::clone(&stderr))));

        let waited = match request.timeout {
            Some(limit) => timeout(limit, child.wait()).await.ok(),
            None => Some(child.wait().await),
        };

        let (exit_code, timed_out) = match waited {
            Some(status) => {
                group.disarm();
                (status?.code(), false)
            }
            None => {
                tracing::warn!(pid = ?pid, "Process timed out, killing process group");
                group.kill();
                let _ = child.start_kill();
                let _ = timeout(self.kill_grace, child.wait()).await;
                (None, true)
            }
        };
        let duration = start.elapsed();

        // Background children may keep the pipes open after the shell exits
        for mut task in [stdout_task, stderr_task].into_iter().flatten() {
            if timeout(self.kill_grace, &mut task).await.is_err() {
                tracing::debug!("Output pipe still open after exit, detaching reader");
            }
        }

        let (stdout, out_truncated) = take_capture(&stdout);
        let (stderr, err_truncated) = take_capture(&stderr);
        Ok(ProcessOutcome {
            exit_code,
            stdout,
            stderr,
            duration,
            timed_out,
            truncated: out_truncated || err_truncated,
        })
    }
}

/// Kills the child's process group unless disarmed.
///
/// Dropping the run future (a case deadline, for instance) drops the guard
/// and takes background grandchildren down with the shell.
struct GroupGuard {
    pid: Option<u32>,
}

impl GroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    fn disarm(&mut self) {
        self.pid = None;
    }

    fn kill(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid.take().and_then(|p| i32::try_from(p).ok()) {
            // SAFETY: killpg only sends a signal to the group we created
            unsafe {
                libc::killpg(pid, libc::SIGKILL);
            }
        }
        self.pid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if self.pid.is_some() {
            tracing::debug!(pid = ?self.pid, "Run abandoned, killing process group");
            self.kill();
        }
    }
}

/// Open a step log: the first attempt starts it fresh, retries append
async fn open_log(dir: &Path, name: &str, attempt: u32) -> Result<File> {
    let path = dir.join(name);
    let opened = if attempt <= 1 {
        File::create(&path).await
    } else {
        OpenOptions::new().create(true).append(true).open(&path).await
    };
    let mut file = opened.map_err(|e| Error::FileRead {
        path: path.display().to_string(),
        error: e.to_string(),
    })?;
    if attempt > 1 {
        file.write_all(format!("=== attempt {} ===\n", attempt).as_bytes())
            .await?;
    }
    Ok(file)
}

/// Bounded tail of one output stream
struct Capture {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > self.limit.saturating_mul(2) {
            self.compact();
        }
    }

    fn compact(&mut self) {
        if self.buf.len() > self.limit {
            let excess = self.buf.len() - self.limit;
            self.buf.drain(..excess);
            self.truncated = true;
        }
    }
}

fn take_capture(capture: &Mutex<Capture>) -> (String, bool) {
    match capture.lock() {
        Ok(mut c) => {
            c.compact();
            (String::from_utf8_lossy(&c.buf).into_owned(), c.truncated)
        }
        Err(_) => (String::new(), false),
    }
}

async fn pump<R: AsyncRead + Unpin>(
    mut pipe: R,
    mut log: Option<File>,
    capture: Arc<Mutex<Capture>>,
) {
    let mut chunk = [0u8; 8192];
    loop {
        let n = match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if let Some(file) = log.as_mut() {
            if let Err(e) = file.write_all(&chunk[..n]).await {
                tracing::warn!("Failed to write output log: {}", e);
                log = None;
            }
        }
        if let Ok(mut c) = capture.lock() {
            c.push(&chunk[..n]);
        }
    }
    if let Some(mut file) = log {
        let _ = file.flush().await;
    }
}
