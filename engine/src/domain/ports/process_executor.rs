//! ProcessExecutor port
//! Interface for running commands and signalling processes

use crate::domain::{DomainError, ProcessSignal, StdinSource};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Options applied to a single command execution
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Process name, for logging
    pub name: String,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    /// User name or numeric uid; only applied when the daemon runs as root
    pub uid: Option<String>,
    /// Group name or numeric gid; only applied when the daemon runs as root
    pub gid: Option<String>,
    pub groups: Vec<String>,
    pub chroot: Option<String>,
    pub umask: Option<u32>,
    pub stdin: Option<StdinSource>,
    /// Detach into a new session and return as soon as the pid is known
    pub daemonize: bool,
    pub logfile: Option<String>,
    pub errfile: Option<String>,
    /// Foreground only: kill the command once this elapses
    pub timeout: Option<Duration>,
}

/// Outcome of a command execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    pub pid: u32,
    pub stdout: String,
    pub stderr: String,
    /// None when the command was killed by a signal, timed out or was detached
    pub exit_code: Option<i32>,
    pub succeeded: bool,
}

impl ExecutionResult {
    pub fn exited(pid: u32, exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            pid,
            stdout,
            stderr,
            exit_code: Some(exit_code),
            succeeded: exit_code == crate::domain::constants::SUCCESS_EXIT_CODE,
        }
    }

    pub fn detached(pid: u32) -> Self {
        Self {
            pid,
            succeeded: pid != 0,
            ..Self::default()
        }
    }
}

/// Port for executing system commands
#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    /// Run `command` through the shell. Foreground runs wait for completion
    /// and capture output; daemonized runs return once the pid is known.
    async fn run(&self, command: &str, options: &ExecOptions) -> Result<ExecutionResult, DomainError>;

    /// Send `signal` to `pid`
    async fn signal(&self, pid: u32, signal: ProcessSignal) -> Result<(), DomainError>;
}
