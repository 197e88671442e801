//! Timeout-bounded execution wrapper for external binaries.
//!
//! Shell integration stays isolated here so facade and notifier logic remain
//! testable against fake binaries and deterministic output parsing.

use crate::error::{VigilError, VigilResult};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Captured result of one external invocation.
#[derive(Debug)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Prefer stderr for diagnostics, falling back to stdout.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            stderr.to_string()
        } else {
            self.stdout.trim().to_string()
        }
    }
}

/// Runner bound to one binary with a fixed timeout.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    binary: PathBuf,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Run the binary with `args`, optionally piping `input` to stdin.
    ///
    /// The child is killed once `timeout` elapses; a timeout is an error, not
    /// a non-zero exit.
    pub fn run(&self, args: &[&str], input: Option<&[u8]>) -> VigilResult<CmdOutput> {
        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        if input.is_some() {
            command.stdin(Stdio::piped());
        }

        let mut child = command.spawn()?;

        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(payload)?;
                stdin.flush().ok();
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(child, stdout_pipe, stderr_pipe)
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> VigilResult<CmdOutput> {
        let start = Instant::now();
        let stdout_handle = spawn_output_reader(stdout_pipe);
        let stderr_handle = spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait()? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }

        if exit_status.is_none() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(VigilError::System(format!(
                "{} timed out after {:?}",
                self.binary.display(),
                self.timeout
            )));
        }

        let stdout = stdout_handle
            .join()
            .map_err(|_| VigilError::System("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| VigilError::System("stderr reader thread panicked".into()))??;

        let status = exit_status.map(|s| s.code().unwrap_or(-1)).unwrap_or(-1);

        Ok(CmdOutput {
            stdout,
            stderr,
            status,
        })
    }
}

/// Resolve a binary from a fixed candidate list, then `PATH`.
pub fn resolve_binary(candidates: &[&str], name: &str) -> Option<PathBuf> {
    for candidate in candidates {
        let path = Path::new(candidate);
        if path.exists() {
            return Some(path.to_path_buf());
        }
    }
    find_in_path(name)
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(binary);
        if candidate.exists() {
            Some(candidate)
        } else {
            None
        }
    })
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<VigilResult<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> VigilResult<String> {
        if let Some(mut reader) = pipe {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).to_string())
        } else {
            Ok(String::new())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_captures_stdout_and_status() {
        let runner = CommandRunner::new(PathBuf::from("/bin/sh"), Duration::from_secs(5));
        let out = runner.run(&["-c", "echo hello"], None).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn run_pipes_stdin() {
        let runner = CommandRunner::new(PathBuf::from("/bin/cat"), Duration::from_secs(5));
        let out = runner.run(&[], Some(b"payload")).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "payload");
    }

    #[test]
    fn run_reports_timeout() {
        let runner = CommandRunner::new(PathBuf::from("/bin/sleep"), Duration::from_millis(100));
        let err = runner.run(&["5"], None).unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn diagnostic_prefers_stderr() {
        let out = CmdOutput {
            stdout: "ignored".into(),
            stderr: "problem".into(),
            status: 1,
        };
        assert_eq!(out.diagnostic(), "problem");
    }
}
