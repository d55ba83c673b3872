//! External command runner.
//!
//! Every tool the pipeline drives (debootstrap, chroot, tar) goes through
//! [`Cmd`]: a small builder that optionally elevates through `sudo`, captures
//! output for diagnostics, enforces a wall-clock timeout and honours a
//! [`CancelToken`].
//!
//! # Example
//!
//! ```rust,ignore
//! use rootfs_builder::process::Cmd;
//! use std::time::Duration;
//!
//! let out = Cmd::new("debootstrap")
//!     .args(["--variant=minbase", "bookworm"])
//!     .arg_path(rootfs)
//!     .sudo(true)
//!     .timeout(Duration::from_secs(1800))
//!     .run()?;
//! ```

use std::ffi::{OsStr, OsString};
use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::cancel::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const TERMINATE_GRACE: Duration = Duration::from_secs(5);
const DIAGNOSTIC_LINES: usize = 40;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to execute '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("waiting for '{program}' failed: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} failed ({status}): {diagnostics}")]
    Failed {
        program: String,
        status: String,
        diagnostics: String,
    },
    #[error("{program} timed out after {}s", timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },
    #[error("{program} interrupted by cancellation")]
    Cancelled { program: String },
}

/// Captured output of a successful command.
#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Whether the current process runs with effective uid 0.
pub fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Check whether `program` resolves on PATH.
pub fn exists(program: &str) -> bool {
    which::which(program).is_ok()
}

#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    sudo: bool,
    timeout: Option<Duration>,
    cancel: Option<CancelToken>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            sudo: false,
            timeout: None,
            cancel: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Run through `sudo`. Environment variables are passed via `env(1)`
    /// because sudo scrubs the caller's environment.
    pub fn sudo(mut self, enabled: bool) -> Self {
        self.sudo = enabled;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel(mut self, token: &CancelToken) -> Self {
        self.cancel = Some(token.clone());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Human-readable command line, for logs.
    pub fn display(&self) -> String {
        let mut parts = Vec::new();
        if self.sudo {
            parts.push("sudo".to_string());
        }
        parts.push(self.program.clone());
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }

    fn build(&self) -> Command {
        let mut cmd = if self.sudo {
            let mut cmd = Command::new("sudo");
            if !self.envs.is_empty() {
                cmd.arg("env");
                for (key, value) in &self.envs {
                    let mut pair = key.clone();
                    pair.push("=");
                    pair.push(value);
                    cmd.arg(pair);
                }
            }
            cmd.arg(&self.program);
            cmd
        } else {
            let mut cmd = Command::new(&self.program);
            cmd.envs(self.envs.iter().map(|(k, v)| (k, v)));
            cmd
        };
        cmd.args(&self.args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Run to completion, capturing output.
    ///
    /// Non-zero exit maps to [`CommandError::Failed`] carrying the tail of the
    /// tool's stderr (or stdout when stderr is empty).
    pub fn run(&self) -> Result<CmdOutput, CommandError> {
        tracing::debug!(command = %self.display(), "running");

        let mut child = self.build().spawn().map_err(|source| CommandError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = self.wait(&mut child)?;

        let stdout = collect(stdout);
        let stderr = collect(stderr);

        if !status.success() {
            return Err(CommandError::Failed {
                program: self.program.clone(),
                status: status.to_string(),
                diagnostics: diagnostics(&stdout, &stderr),
            });
        }

        Ok(CmdOutput { stdout, stderr })
    }

    fn wait(&self, child: &mut Child) -> Result<ExitStatus, CommandError> {
        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(source) => {
                    return Err(CommandError::Wait {
                        program: self.program.clone(),
                        source,
                    })
                }
            }

            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                terminate(child);
                return Err(CommandError::Cancelled {
                    program: self.program.clone(),
                });
            }

            if let Some(timeout) = self.timeout {
                if start.elapsed() > timeout {
                    terminate(child);
                    return Err(CommandError::TimedOut {
                        program: self.program.clone(),
                        timeout,
                    });
                }
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// SIGTERM first so sudo can relay it to the real tool, SIGKILL if it lingers.
fn terminate(child: &mut Child) {
    if let Ok(pid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: plain kill(2) on our own child's pid.
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }
    let deadline = Instant::now() + TERMINATE_GRACE;
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        thread::sleep(POLL_INTERVAL);
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

fn diagnostics(stdout: &str, stderr: &str) -> String {
    let source = if stderr.trim().is_empty() {
        stdout
    } else {
        stderr
    };
    let lines: Vec<&str> = source.trim().lines().collect();
    let tail = &lines[lines.len().saturating_sub(DIAGNOSTIC_LINES)..];
    if tail.is_empty() {
        "no output".to_string()
    } else {
        tail.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_stdout() {
        let out = Cmd::new("sh").args(["-c", "echo hello"]).run().unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_env_is_passed() {
        let out = Cmd::new("sh")
            .args(["-c", "echo $GREETING"])
            .env("GREETING", "hi")
            .run()
            .unwrap();
        assert_eq!(out.stdout.trim(), "hi");
    }

    #[test]
    fn test_failure_carries_stderr() {
        let err = Cmd::new("sh")
            .args(["-c", "echo boom >&2; exit 3"])
            .run()
            .unwrap_err();
        match err {
            CommandError::Failed { diagnostics, .. } => assert_eq!(diagnostics, "boom"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let err = Cmd::new("definitely_not_a_real_command_12345")
            .run()
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[test]
    fn test_timeout_kills_command() {
        let start = Instant::now();
        let err = Cmd::new("sleep")
            .arg("30")
            .timeout(Duration::from_millis(200))
            .run()
            .unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }));
        assert!(start.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn test_cancel_kills_command() {
        let token = CancelToken::new();
        token.cancel();
        let err = Cmd::new("sleep").arg("30").cancel(&token).run().unwrap_err();
        assert!(matches!(err, CommandError::Cancelled { .. }));
    }

    #[test]
    fn test_display_includes_sudo_prefix() {
        let cmd = Cmd::new("chroot").arg("/tmp/root").sudo(true);
        assert_eq!(cmd.display(), "sudo chroot /tmp/root");
    }

    #[test]
    fn test_exists() {
        assert!(exists("sh"));
        assert!(!exists("definitely_not_a_real_command_12345"));
    }
}
