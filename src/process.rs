//! External Process Execution
//!
//! This module is the ONLY sanctioned way to run external programs:
//! prerequisite probes, prerequisite installers, `RunExecutable` operations,
//! and the uninstaller of a previous installation all go through
//! [`run_command`].
//!
//! - Every child gets its own process group (unix), so a timeout or a
//!   cancellation kills the whole tree, not just the direct child.
//! - On Linux the child also receives SIGTERM if the engine dies first.
//! - Every wait is bounded by a timeout.
//! - stdout/stderr are captured on reader threads so a chatty child cannot
//!   block on a full pipe.

use crate::cancel::CancelToken;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// How often a waiting runner re-checks the cancel token
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A fully substituted program invocation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Output from an external process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output from the process.
    pub stdout: String,
    /// Standard error from the process.
    pub stderr: String,
    /// Exit code (None if terminated by signal or killed).
    pub exit_code: Option<i32>,
    /// Whether the process exited successfully (exit code 0).
    pub success: bool,
    /// The process was killed because it exceeded its timeout.
    pub timed_out: bool,
    /// The process was killed because the session was cancelled.
    pub cancelled: bool,
}

impl CommandOutput {
    /// Check if the process succeeded and return an error if not.
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            return Ok(());
        }
        if self.timed_out {
            anyhow::bail!("{} timed out and was killed", context);
        }
        if self.cancelled {
            anyhow::bail!("{} was cancelled", context);
        }
        let code = self.exit_code.unwrap_or(-1);
        anyhow::bail!(
            "{} failed (exit code {}): {}",
            context,
            code,
            self.stderr.trim()
        )
    }
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Configure the command to run in its own process group
    fn in_new_process_group(&mut self) -> &mut Self;
}

#[cfg(unix)]
impl CommandProcessGroup for Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use nix::unistd::Pid;
        use std::os::unix::process::CommandExt;

        // SAFETY: the closure only makes async-signal-safe syscalls
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                #[cfg(target_os = "linux")]
                if nix::libc::prctl(nix::libc::PR_SET_PDEATHSIG, nix::libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}

#[cfg(not(unix))]
impl CommandProcessGroup for Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        self
    }
}

/// Kill the child and, on unix, its whole process group.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Err(e) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
            debug!("killpg({}) failed: {}", child.id(), e);
        }
    }
    if let Err(e) = child.kill() {
        debug!("kill({}) failed: {}", child.id(), e);
    }
}

fn spawn_reader<R: Read + Send + 'static>(source: Option<R>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut source) = source {
            let _ = source.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Run `spec` to completion, killing it after `timeout` or on cancellation.
///
/// A non-zero exit, a timeout and a cancellation are all reported through
/// [`CommandOutput`], not as `Err`; `Err` means the process could not be
/// spawned or waited on at all.
pub fn run_command(
    spec: &CommandSpec,
    timeout: Duration,
    cancel: Option<&CancelToken>,
) -> Result<CommandOutput> {
    info!("run_command: {} (timeout {:?})", spec, timeout);

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {}", spec.program))?;
    let pid = child.id();
    debug!("Spawned {} as PID {}", spec.program, pid);

    let stdout = spawn_reader(child.stdout.take());
    let stderr = spawn_reader(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let mut cancelled = false;

    let status = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!("{} (PID {}) exceeded {:?}, killing", spec.program, pid, timeout);
            timed_out = true;
            kill_tree(&mut child);
            break child.wait().context("Failed to reap timed-out process")?;
        }
        if cancel.is_some_and(CancelToken::is_cancelled) {
            warn!("Cancellation requested, killing {} (PID {})", spec.program, pid);
            cancelled = true;
            kill_tree(&mut child);
            break child.wait().context("Failed to reap cancelled process")?;
        }

        let slice = if cancel.is_some() {
            remaining.min(POLL_INTERVAL)
        } else {
            remaining
        };
        if let Some(status) = child
            .wait_timeout(slice)
            .with_context(|| format!("Failed waiting for {}", spec.program))?
        {
            break status;
        }
    };

    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();
    let success = status.success() && !timed_out && !cancelled;

    if success {
        info!("{} completed successfully", spec.program);
    } else {
        info!("{} failed with exit code {:?}", spec.program, status.code());
    }

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code: status.code(),
        success,
        timed_out,
        cancelled,
    })
}

/// Start `spec` without waiting for it and without tying it to our lifetime.
///
/// Used for launching the installed product from the finished page.
pub fn spawn_detached(spec: &CommandSpec) -> Result<u32> {
    info!("spawn_detached: {}", spec);
    let child = Command::new(&spec.program)
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to launch {}", spec.program))?;
    Ok(child.id())
}

/// Seconds a deferred removal waits for this process to exit
const DEFERRED_REMOVAL_DELAY_SECS: u32 = 3;

/// Whether `path` is the executable this process is running from.
pub fn is_current_exe(path: &Path) -> bool {
    let Ok(exe) = std::env::current_exe().and_then(|exe| exe.canonicalize()) else {
        return false;
    };
    path.canonicalize().is_ok_and(|path| path == exe)
}

/// Single-quote `value` for PowerShell.
pub fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Single-quote `value` for `sh`.
pub fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Command that waits, deletes `files`, then removes `prune` if it is empty.
#[cfg(windows)]
pub fn deferred_removal_command(files: &[PathBuf], prune: Option<&Path>) -> CommandSpec {
    let mut script = format!("Start-Sleep -Seconds {}; ", DEFERRED_REMOVAL_DELAY_SECS);
    for file in files {
        script.push_str(&format!(
            "Remove-Item -LiteralPath {} -Force -ErrorAction SilentlyContinue; ",
            ps_quote(&file.to_string_lossy())
        ));
    }
    if let Some(dir) = prune {
        let dir = ps_quote(&dir.to_string_lossy());
        script.push_str(&format!(
            "if (-not (Get-ChildItem -LiteralPath {dir} -Force)) {{ Remove-Item -LiteralPath {dir} }}"
        ));
    }
    CommandSpec::new("powershell").args([
        "-NoProfile".to_string(),
        "-NonInteractive".to_string(),
        "-Command".to_string(),
        script,
    ])
}

/// Command that waits, deletes `files`, then removes `prune` if it is empty.
#[cfg(not(windows))]
pub fn deferred_removal_command(files: &[PathBuf], prune: Option<&Path>) -> CommandSpec {
    let mut script = format!("sleep {}", DEFERRED_REMOVAL_DELAY_SECS);
    for file in files {
        script.push_str(&format!("; rm -f {}", sh_quote(&file.to_string_lossy())));
    }
    if let Some(dir) = prune {
        script.push_str(&format!("; rmdir {} 2>/dev/null", sh_quote(&dir.to_string_lossy())));
    }
    CommandSpec::new("sh").args(["-c".to_string(), script])
}

/// Delete files this process cannot remove while it runs (its own
/// executable on Windows) once it has exited.
pub fn remove_after_exit(files: &[PathBuf], prune: Option<&Path>) -> Result<u32> {
    for file in files {
        info!("Scheduling removal of {} after exit", file.display());
    }
    spawn_detached(&deferred_removal_command(files, prune))
}
