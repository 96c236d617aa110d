//! Tokio Process Executor
//! Real implementation of the ProcessExecutor port
//!
//! Commands run through `/bin/sh -c`:
//! - Foreground: output is captured and the call waits for the exit status
//! - Daemonized: the child detaches into its own session with output appended
//!   to the configured log files, and is reaped in the background
//!
//! When the daemon runs as root the child drops to the configured identity
//! before exec.

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::{Group, Pid, Uid, User};
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::domain::constants::DEFAULT_PROBE_TIMEOUT_SEC;
use crate::domain::ports::{ExecOptions, ExecutionResult, ProcessExecutor};
use crate::domain::{DomainError, ProcessSignal, StdinSource};

const SHELL: &str = "/bin/sh";

/// Tokio-based process executor
#[derive(Debug, Default, Clone)]
pub struct TokioProcessExecutor;

/// Identity and filesystem changes applied in the child before exec
#[derive(Debug, Default)]
struct ChildSetup {
    daemonize: bool,
    chroot: Option<CString>,
    groups: Vec<libc::gid_t>,
    gid: Option<libc::gid_t>,
    uid: Option<libc::uid_t>,
    umask: Option<libc::mode_t>,
    cwd: Option<CString>,
}

impl TokioProcessExecutor {
    pub fn new() -> Self {
        Self
    }

    // ========================================================================
    // Helper Methods
    // ========================================================================

    /// Open an output file in append mode, `/dev/null` when unset
    fn configure_output(path: Option<&str>) -> Result<Stdio, DomainError> {
        match path {
            None => Ok(Stdio::null()),
            Some(path) => {
                if let Some(parent) = Path::new(path).parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| {
                        DomainError::ExecutionFailed(format!(
                            "Failed to open output file '{}': {}",
                            path, e
                        ))
                    })?;
                Ok(Stdio::from(file))
            }
        }
    }

    /// Resolve a user by name or numeric id
    fn get_user(user: &str) -> Result<User, DomainError> {
        let found = match user.parse::<u32>() {
            Ok(uid) => User::from_uid(Uid::from_raw(uid)),
            Err(_) => User::from_name(user),
        };
        found
            .map_err(|e| DomainError::ExecutionFailed(format!("Failed to look up user '{}': {}", user, e)))?
            .ok_or_else(|| DomainError::ExecutionFailed(format!("User '{}' not found", user)))
    }

    /// Resolve a group by name or numeric id
    fn get_gid(group: &str) -> Result<libc::gid_t, DomainError> {
        if let Ok(gid) = group.parse::<u32>() {
            return Ok(gid);
        }
        Group::from_name(group)
            .map_err(|e| DomainError::ExecutionFailed(format!("Failed to look up group '{}': {}", group, e)))?
            .map(|g| g.gid.as_raw())
            .ok_or_else(|| DomainError::ExecutionFailed(format!("Group '{}' not found", group)))
    }

    fn c_path(path: &str) -> Result<CString, DomainError> {
        CString::new(path)
            .map_err(|e| DomainError::ExecutionFailed(format!("Invalid path '{}': {}", path, e)))
    }

    /// Build the shell command with environment and child setup applied
    fn build_command(command: &str, options: &ExecOptions) -> Result<Command, DomainError> {
        let mut cmd = Command::new(SHELL);
        cmd.arg("-c").arg(command);
        cmd.envs(&options.env);

        let mut setup = ChildSetup {
            daemonize: options.daemonize,
            umask: options.umask.map(|m| m as libc::mode_t),
            cwd: options.cwd.as_deref().map(Self::c_path).transpose()?,
            ..Default::default()
        };

        let wants_privileges = options.uid.is_some()
            || options.gid.is_some()
            || !options.groups.is_empty()
            || options.chroot.is_some();

        // Privileges can only be dropped by root
        if wants_privileges && nix::unistd::geteuid().is_root() {
            setup.chroot = options.chroot.as_deref().map(Self::c_path).transpose()?;

            if let Some(ref group) = options.gid {
                setup.gid = Some(Self::get_gid(group)?);
            }
            if let Some(gid) = setup.gid {
                setup.groups.push(gid);
            }
            for group in &options.groups {
                let gid = Self::get_gid(group)?;
                if !setup.groups.contains(&gid) {
                    setup.groups.push(gid);
                }
            }

            if let Some(ref user) = options.uid {
                let user = Self::get_user(user)?;
                debug!(process = %options.name, user = %user.name, uid = user.uid.as_raw(), "Resolved process user");
                setup.uid = Some(user.uid.as_raw());
                cmd.env("HOME", &user.dir);
                cmd.env("USER", &user.name);
            }
        } else if wants_privileges {
            debug!(process = %options.name, "Not running as root; ignoring uid, gid, groups and chroot");
        }

        Self::configure_child(&mut cmd, setup);
        Ok(cmd)
    }

    fn configure_child(cmd: &mut Command, setup: ChildSetup) {
        unsafe {
            cmd.pre_exec(move || {
                if setup.daemonize {
                    // Fails only if already a session leader
                    libc::setsid();
                }

                if let Some(ref root) = setup.chroot {
                    if libc::chroot(root.as_ptr()) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::chdir(b"/\0".as_ptr() as *const libc::c_char) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                // Supplementary groups and gid before uid
                if !setup.groups.is_empty()
                    && libc::setgroups(setup.groups.len() as _, setup.groups.as_ptr()) != 0
                {
                    return Err(std::io::Error::last_os_error());
                }
                if let Some(gid) = setup.gid {
                    if libc::setgid(gid) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                if let Some(uid) = setup.uid {
                    if libc::setuid(uid) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                if let Some(mask) = setup.umask {
                    libc::umask(mask);
                }
                if let Some(ref dir) = setup.cwd {
                    if libc::chdir(dir.as_ptr()) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                Ok(())
            });
        }
    }

    /// Resolve the stdin source into a stdio handle plus a payload to write
    async fn configure_stdin(
        &self,
        source: Option<&StdinSource>,
        options: &ExecOptions,
    ) -> Result<(Stdio, Option<String>), DomainError> {
        match source {
            None => Ok((Stdio::null(), None)),
            Some(StdinSource::Literal(data)) => Ok((Stdio::piped(), Some(data.clone()))),
            Some(StdinSource::File(path)) => match File::open(path) {
                Ok(file) => Ok((Stdio::from(file), None)),
                Err(e) => {
                    warn!(process = %options.name, path = %path, error = %e, "Stdin file unavailable, using /dev/null");
                    Ok((Stdio::null(), None))
                }
            },
            Some(StdinSource::Command(command)) => {
                let input_options = ExecOptions {
                    stdin: None,
                    daemonize: false,
                    timeout: Some(Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SEC)),
                    ..options.clone()
                };
                let result = self.run_foreground(command, &input_options, None).await?;
                Ok((Stdio::piped(), Some(result.stdout)))
            }
        }
    }

    async fn write_stdin(child: &mut Child, payload: Option<String>, name: &str) {
        let (Some(payload), Some(mut stdin)) = (payload, child.stdin.take()) else {
            return;
        };
        if let Err(e) = stdin.write_all(payload.as_bytes()).await {
            debug!(process = %name, error = %e, "Child closed stdin early");
        }
        // Dropping the handle closes the pipe
    }

    async fn run_foreground(
        &self,
        command: &str,
        options: &ExecOptions,
        stdin: Option<(Stdio, Option<String>)>,
    ) -> Result<ExecutionResult, DomainError> {
        let mut cmd = Self::build_command(command, options)?;
        let (stdin, payload) = stdin.unwrap_or((Stdio::null(), None));
        cmd.stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            DomainError::ExecutionFailed(format!("Failed to spawn '{}': {}", command, e))
        })?;
        let pid = child.id().unwrap_or(0);
        Self::write_stdin(&mut child, payload, &options.name).await;

        let output = match options.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    DomainError::ExecutionFailed(format!(
                        "'{}' timed out after {}s",
                        command,
                        limit.as_secs_f64()
                    ))
                })?,
            None => child.wait_with_output().await,
        }?;

        Ok(ExecutionResult {
            pid,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
            succeeded: output.status.success(),
        })
    }

    async fn run_detached(
        &self,
        command: &str,
        options: &ExecOptions,
        stdin: (Stdio, Option<String>),
    ) -> Result<ExecutionResult, DomainError> {
        let mut cmd = Self::build_command(command, options)?;
        let (stdin, payload) = stdin;
        cmd.stdin(stdin)
            .stdout(Self::configure_output(options.logfile.as_deref())?)
            .stderr(Self::configure_output(
                options.errfile.as_deref().or(options.logfile.as_deref()),
            )?);

        let mut child = cmd.spawn().map_err(|e| {
            DomainError::ExecutionFailed(format!("Failed to spawn '{}': {}", command, e))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| DomainError::ExecutionFailed(format!("'{}' exited before reporting a pid", command)))?;
        Self::write_stdin(&mut child, payload, &options.name).await;

        info!(process = %options.name, pid, "Process spawned");

        let name = options.name.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(process = %name, pid, status = %status, "Detached process exited"),
                Err(e) => warn!(process = %name, pid, error = %e, "Failed to reap detached process"),
            }
        });

        Ok(ExecutionResult::detached(pid))
    }
}

// ============================================================================
// ProcessExecutor Trait Implementation
// ============================================================================

#[async_trait]
impl ProcessExecutor for TokioProcessExecutor {
    async fn run(&self, command: &str, options: &ExecOptions) -> Result<ExecutionResult, DomainError> {
        if command.trim().is_empty() {
            return Err(DomainError::ExecutionFailed("Empty command".to_string()));
        }
        debug!(process = %options.name, command = %command, daemonize = options.daemonize, "Running command");

        let stdin = self.configure_stdin(options.stdin.as_ref(), options).await?;
        if options.daemonize {
            self.run_detached(command, options, stdin).await
        } else {
            self.run_foreground(command, options, Some(stdin)).await
        }
    }

    async fn signal(&self, pid: u32, signal: ProcessSignal) -> Result<(), DomainError> {
        let raw = i32::try_from(pid)
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| DomainError::ExecutionFailed(format!("Refusing to signal pid {}", pid)))?;

        match signal::kill(Pid::from_raw(raw), signal.as_nix()) {
            Ok(()) => {
                debug!(pid, signal = %signal, "Signal sent");
                Ok(())
            }
            Err(Errno::ESRCH) => Err(DomainError::ExecutionFailed(format!("No process with pid {}", pid))),
            Err(e) => {
                warn!(pid, signal = %signal, error = %e, "Failed to send signal");
                Err(DomainError::ExecutionFailed(format!(
                    "Failed to send {} to {}: {}",
                    signal, pid, e
                )))
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;
    use tempfile::TempDir;

    fn options() -> ExecOptions {
        ExecOptions {
            name: "test".to_string(),
            ..Default::default()
        }
    }

    fn alive(pid: u32) -> bool {
        signal::kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[tokio::test]
    async fn test_foreground_captures_output() {
        let executor = TokioProcessExecutor::new();
        let result = executor
            .run("echo hello; echo oops >&2", &options())
            .await
            .unwrap();
        assert!(result.succeeded);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.stderr.trim(), "oops");
        assert!(result.pid > 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_unsuccessful() {
        let executor = TokioProcessExecutor::new();
        let result = executor.run("exit 3", &options()).await.unwrap();
        assert!(!result.succeeded);
        assert_eq!(result.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_env_and_umask_and_cwd() {
        let dir = TempDir::new().unwrap();
        let mut opts = options();
        opts.env.insert("SV_TEST_VAR".to_string(), "value".to_string());
        opts.umask = Some(0o027);
        opts.cwd = Some(dir.path().to_string_lossy().into_owned());

        let executor = TokioProcessExecutor::new();
        let result = executor
            .run("echo $SV_TEST_VAR; umask; pwd -P", &opts)
            .await
            .unwrap();
        let lines: Vec<&str> = result.stdout.lines().collect();
        assert_eq!(lines[0], "value");
        assert_eq!(lines[1], "0027");
        assert_eq!(
            Path::new(lines[2]),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }

    #[tokio::test]
    async fn test_stdin_sources() {
        let dir = TempDir::new().unwrap();
        let executor = TokioProcessExecutor::new();

        let mut opts = options();
        opts.stdin = Some(StdinSource::Literal("from literal".to_string()));
        assert_eq!(executor.run("cat", &opts).await.unwrap().stdout, "from literal");

        let input = dir.path().join("input.txt");
        std::fs::write(&input, "from file").unwrap();
        opts.stdin = Some(StdinSource::File(input.to_string_lossy().into_owned()));
        assert_eq!(executor.run("cat", &opts).await.unwrap().stdout, "from file");

        opts.stdin = Some(StdinSource::Command("echo from command".to_string()));
        assert_eq!(executor.run("cat", &opts).await.unwrap().stdout.trim(), "from command");

        opts.stdin = Some(StdinSource::File("/nonexistent/input".to_string()));
        assert_eq!(executor.run("cat", &opts).await.unwrap().stdout, "");
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let executor = TokioProcessExecutor::new();
        let mut opts = options();
        opts.timeout = Some(Duration::from_millis(100));
        let result = executor.run("sleep 5", &opts).await;
        assert!(matches!(result, Err(DomainError::ExecutionFailed(_))));
    }

    #[tokio::test]
    async fn test_daemonized_command_detaches_and_logs() {
        let dir = TempDir::new().unwrap();
        let logfile = dir.path().join("logs").join("out.log");
        let errfile = dir.path().join("err.log");
        let mut opts = options();
        opts.daemonize = true;
        opts.logfile = Some(logfile.to_string_lossy().into_owned());
        opts.errfile = Some(errfile.to_string_lossy().into_owned());

        let executor = TokioProcessExecutor::new();
        let result = executor
            .run("echo started; echo warning >&2; exec sleep 5", &opts)
            .await
            .unwrap();
        assert!(result.succeeded);
        assert!(result.pid > 0);
        assert!(alive(result.pid));

        for _ in 0..50 {
            if std::fs::read_to_string(&logfile).unwrap_or_default().contains("started") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(std::fs::read_to_string(&logfile).unwrap().trim(), "started");
        assert_eq!(std::fs::read_to_string(&errfile).unwrap().trim(), "warning");

        executor
            .signal(result.pid, ProcessSignal::from(Signal::SIGTERM))
            .await
            .unwrap();
        for _ in 0..100 {
            if !alive(result.pid) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive(result.pid));
    }

    #[tokio::test]
    async fn test_signal_rejects_pid_zero() {
        let executor = TokioProcessExecutor::new();
        let term = ProcessSignal::from(Signal::SIGTERM);
        assert!(executor.signal(0, term).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let executor = TokioProcessExecutor::new();
        assert!(executor.run("  ", &options()).await.is_err());
    }
}
