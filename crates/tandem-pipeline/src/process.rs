//! Running external tools (generator, compiler) with captured output and an
//! optional deadline.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Lines of stderr kept in failure messages.
const STDERR_TAIL_LINES: usize = 20;

/// Poll interval while waiting on a child with a deadline.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Failure of an external collaborator (generation engine or toolchain).
#[derive(Debug, Error)]
pub enum ExternalError {
    /// The program could not be started.
    #[error("could not start '{program}': {reason}")]
    Unavailable { program: String, reason: String },

    /// The program ran and exited unsuccessfully.
    #[error("'{program}' exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    /// The program exceeded its deadline and was killed.
    #[error("'{program}' timed out after {}s", .after.as_secs())]
    TimedOut { program: String, after: Duration },

    /// An in-process collaborator refused the request.
    #[error("{0}")]
    Rejected(String),

    /// I/O error while preparing or collecting output.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Captured result of a finished child process.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Run `command` to completion, capturing stdout and stderr.
///
/// With a `timeout` the child is killed once the deadline passes. A
/// non-zero exit is returned as [`ExternalError::Failed`] carrying the tail
/// of stderr.
pub fn run(command: &mut Command, timeout: Option<Duration>) -> Result<ProcessOutput, ExternalError> {
    let program = command.get_program().to_string_lossy().into_owned();

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ExternalError::Unavailable {
            program: program.clone(),
            reason: e.to_string(),
        })?;

    // Drain both pipes on their own threads so a chatty child cannot block
    // on a full pipe while we wait on it.
    let stdout_reader = child.stdout.take().map(|mut out| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = out.read_to_end(&mut buf);
            buf
        })
    });
    let stderr_reader = child.stderr.take().map(|mut err| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = err.read_to_end(&mut buf);
            buf
        })
    });

    let status = match timeout {
        None => child.wait()?,
        Some(limit) => {
            let deadline = Instant::now() + limit;
            loop {
                if let Some(status) = child.try_wait()? {
                    break status;
                }
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ExternalError::TimedOut {
                        program,
                        after: limit,
                    });
                }
                thread::sleep(POLL_INTERVAL);
            }
        }
    };

    let stdout = stdout_reader
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default();
    let stderr = stderr_reader
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default();

    if !status.success() {
        return Err(ExternalError::Failed {
            program,
            status: status.to_string(),
            stderr: stderr_tail(&stderr),
        });
    }

    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
    })
}

/// Last few lines of a stderr capture, joined with ` | `.
fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    let tail = lines[start..].join(" | ");
    if tail.is_empty() {
        "(no output)".to_string()
    } else {
        tail
    }
}
