//! Spawned jobs.
//!
//! Every external tool the daemon drives (`mdadm`, `cryptsetup`, `losetup`,
//! `wipefs`, `umount`) is invoked through the [`JobRunner`] contract. The
//! production runner executes the argv vector directly (no shell ever
//! interprets the arguments), captures stdout/stderr and reports the exit
//! status. Callers log the command line with [`quote`] applied to each
//! argument so pasted lines stay shell-safe.

use std::process::Command;

use tracing::info;

use crate::error::{Error, Result};

/// Captured result of a spawned job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl JobOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// The message reported to callers when the job failed: stderr if the
    /// tool produced any, the exit description otherwise.
    pub fn error_message(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        match self.exit_code {
            Some(code) => format!("command exited with status {}", code),
            None => "command was killed by a signal".to_string(),
        }
    }
}

/// Contract for executing external commands on behalf of a caller.
pub trait JobRunner: Send + Sync {
    /// Runs `argv` synchronously.
    ///
    /// `operation` is the job-kind identifier (e.g. `md-raid-start`) and
    /// `caller_uid` the user the job is attributed to; both end up in the
    /// log, not in the command environment.
    fn spawn_job(&self, operation: &str, caller_uid: u32, argv: &[String]) -> Result<JobOutput>;
}

/// [`JobRunner`] that spawns the command as a child process.
pub struct SpawnedJobRunner;

impl JobRunner for SpawnedJobRunner {
    fn spawn_job(&self, operation: &str, caller_uid: u32, argv: &[String]) -> Result<JobOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Failed("Cannot spawn a job with an empty command".to_string()))?;

        info!(
            "Spawning job {} (uid {}): {}",
            operation,
            caller_uid,
            command_line(argv)
        );

        let output = Command::new(program).args(args).output().map_err(|err| {
            Error::Failed(format!("Error spawning command {}: {}", quote(program), err))
        })?;

        Ok(JobOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Quotes `arg` so the logged command line can be pasted into a shell.
///
/// The returned string is never handed to a shell by the daemon itself.
pub fn quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b':' | b'='))
    {
        return arg.to_string();
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('\'');
    for c in arg.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

/// Renders `argv` as a shell-safe command line for logging.
pub fn command_line(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}
