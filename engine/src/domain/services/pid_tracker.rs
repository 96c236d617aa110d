//! PID Tracker
//! Resolves and caches the OS pid of a managed process from its pid_command,
//! its pidfile, or the pid reported by the last daemonized start.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::domain::constants::DEFAULT_PROBE_TIMEOUT_SEC;
use crate::domain::ports::{ExecOptions, ProcessExecutor, SystemMetrics};
use crate::domain::DomainError;

pub struct PidTracker {
    name: String,
    pidfile: Option<PathBuf>,
    pid_command: Option<String>,
    exec: ExecOptions,
    executor: Arc<dyn ProcessExecutor>,
    metrics: Arc<dyn SystemMetrics>,
    cached: Mutex<u32>,
}

impl PidTracker {
    pub fn new(
        name: impl Into<String>,
        pidfile: Option<String>,
        pid_command: Option<String>,
        exec: ExecOptions,
        executor: Arc<dyn ProcessExecutor>,
        metrics: Arc<dyn SystemMetrics>,
    ) -> Self {
        Self {
            name: name.into(),
            pidfile: pidfile.map(PathBuf::from),
            pid_command,
            exec,
            executor,
            metrics,
            cached: Mutex::new(0),
        }
    }

    /// True when the pid can be re-resolved from a pid_command or pidfile
    pub fn has_source(&self) -> bool {
        self.pid_command.is_some() || self.pidfile.is_some()
    }

    pub fn pidfile(&self) -> Option<&Path> {
        self.pidfile.as_deref()
    }

    /// Cached pid without resolving; 0 when unknown
    pub fn cached(&self) -> u32 {
        *self.cached.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_cached(&self, pid: u32) {
        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = pid;
    }

    /// Cached pid while it is alive, otherwise a fresh resolution
    pub async fn current(&self) -> u32 {
        let cached = self.cached();
        if cached != 0 && self.metrics.is_alive(cached) {
            return cached;
        }
        self.read().await
    }

    /// Resolve from pid_command, else the pidfile. A dead pid resolves to 0.
    pub async fn read(&self) -> u32 {
        let candidate = if let Some(command) = &self.pid_command {
            self.read_from_command(command).await
        } else if let Some(path) = &self.pidfile {
            Self::read_pidfile(path)
        } else {
            // Nothing to resolve from; keep whatever a start reported
            self.cached()
        };

        let pid = if candidate != 0 && self.metrics.is_alive(candidate) {
            candidate
        } else {
            0
        };
        self.set_cached(pid);
        pid
    }

    async fn read_from_command(&self, command: &str) -> u32 {
        let mut options = self.exec.clone();
        options.daemonize = false;
        options.stdin = None;
        options.timeout = Some(Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SEC));

        match self.executor.run(command, &options).await {
            Ok(result) => result.stdout.trim().parse::<u32>().unwrap_or(0),
            Err(e) => {
                warn!(process = %self.name, error = %e, "pid_command failed");
                0
            }
        }
    }

    fn read_pidfile(path: &Path) -> u32 {
        fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(0)
    }

    /// Cache `pid` and persist it to the pidfile, if any
    pub fn write(&self, pid: u32) -> Result<(), DomainError> {
        self.set_cached(pid);
        let Some(path) = &self.pidfile else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, pid.to_string())?;
        debug!(process = %self.name, pidfile = %path.display(), pid, "Wrote PID file");
        Ok(())
    }

    /// Remove the pidfile; a missing file is not an error
    pub fn unlink(&self) -> Result<(), DomainError> {
        let Some(path) = &self.pidfile else {
            return Ok(());
        };
        match fs::remove_file(path) {
            Ok(()) => {
                debug!(process = %self.name, pidfile = %path.display(), "Removed PID file");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn invalidate(&self) {
        self.set_cached(0);
    }
}
