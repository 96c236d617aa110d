//! Hand-written test doubles for the executor and metrics ports

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::domain::ports::{ExecOptions, ExecutionResult, ProcessExecutor, SystemMetrics};
use crate::domain::{DomainError, ProcessSignal};

#[derive(Default)]
struct MetricsInner {
    procs: HashMap<u32, (u32, f64, u64)>,
    alive: HashSet<u32>,
    resets: usize,
}

/// In-memory process table
#[derive(Clone, Default)]
pub struct MockMetrics {
    inner: Arc<Mutex<MetricsInner>>,
}

impl MockMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_process(&self, pid: u32, ppid: u32, cpu: f64, rss_kb: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.procs.insert(pid, (ppid, cpu, rss_kb));
        inner.alive.insert(pid);
    }

    pub fn set_alive(&self, pid: u32) {
        self.inner.lock().unwrap().alive.insert(pid);
    }

    pub fn kill(&self, pid: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.alive.remove(&pid);
        inner.procs.remove(&pid);
    }

    pub fn resets(&self) -> usize {
        self.inner.lock().unwrap().resets
    }
}

#[async_trait]
impl SystemMetrics for MockMetrics {
    async fn reset_cache(&self) -> Result<(), DomainError> {
        self.inner.lock().unwrap().resets += 1;
        Ok(())
    }

    fn cpu_usage(&self, pid: u32) -> Option<f64> {
        self.inner.lock().unwrap().procs.get(&pid).map(|p| p.1)
    }

    fn memory_usage(&self, pid: u32) -> Option<u64> {
        self.inner.lock().unwrap().procs.get(&pid).map(|p| p.2)
    }

    fn children_of(&self, pid: u32) -> Vec<u32> {
        let inner = self.inner.lock().unwrap();
        let mut children: Vec<u32> = inner
            .procs
            .iter()
            .filter(|(_, p)| p.0 == pid)
            .map(|(child, _)| *child)
            .collect();
        children.sort_unstable();
        children
    }

    fn is_alive(&self, pid: u32) -> bool {
        pid != 0 && self.inner.lock().unwrap().alive.contains(&pid)
    }
}

#[derive(Clone)]
struct Scripted {
    exit_code: i32,
    stdout: String,
    delay: Duration,
    fail: bool,
}

#[derive(Default)]
struct ExecutorInner {
    scripted: HashMap<String, Scripted>,
    calls: Vec<(String, ExecOptions)>,
    signals: Vec<(u32, ProcessSignal)>,
    next_pid: u32,
}

/// Scripted executor. Unscripted commands succeed; daemonized runs return
/// increasing pids starting at 1000 and mark them alive in the linked metrics.
/// Signals mark the target dead in the linked metrics.
#[derive(Clone)]
pub struct MockExecutor {
    inner: Arc<Mutex<ExecutorInner>>,
    metrics: Option<MockMetrics>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ExecutorInner {
                next_pid: 1000,
                ..Default::default()
            })),
            metrics: None,
        }
    }

    pub fn linked(metrics: MockMetrics) -> Self {
        Self {
            metrics: Some(metrics),
            ..Self::new()
        }
    }

    pub fn respond(&self, command: &str, exit_code: i32, stdout: &str) {
        self.script(command, exit_code, stdout, Duration::ZERO, false);
    }

    pub fn respond_slowly(&self, command: &str, exit_code: i32, delay: Duration) {
        self.script(command, exit_code, "", delay, false);
    }

    pub fn fail(&self, command: &str) {
        self.script(command, 1, "", Duration::ZERO, true);
    }

    fn script(&self, command: &str, exit_code: i32, stdout: &str, delay: Duration, fail: bool) {
        self.inner.lock().unwrap().scripted.insert(
            command.to_string(),
            Scripted {
                exit_code,
                stdout: stdout.to_string(),
                delay,
                fail,
            },
        );
    }

    pub fn count(&self, command: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(c, _)| c == command)
            .count()
    }

    pub fn commands(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|(c, _)| c.clone())
            .collect()
    }

    pub fn last_options(&self, command: &str) -> Option<ExecOptions> {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .rev()
            .find(|(c, _)| c == command)
            .map(|(_, o)| o.clone())
    }

    pub fn last_env(&self, command: &str) -> HashMap<String, String> {
        self.last_options(command).map(|o| o.env).unwrap_or_default()
    }

    pub fn signals(&self) -> Vec<(u32, ProcessSignal)> {
        self.inner.lock().unwrap().signals.clone()
    }
}

#[async_trait]
impl ProcessExecutor for MockExecutor {
    async fn run(&self, command: &str, options: &ExecOptions) -> Result<ExecutionResult, DomainError> {
        let scripted = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push((command.to_string(), options.clone()));
            inner.scripted.get(command).cloned()
        };

        if let Some(s) = &scripted {
            if !s.delay.is_zero() {
                tokio::time::sleep(s.delay).await;
            }
            if s.fail {
                return Err(DomainError::ExecutionFailed(command.to_string()));
            }
        }

        if options.daemonize {
            let pid = {
                let mut inner = self.inner.lock().unwrap();
                inner.next_pid += 1;
                inner.next_pid
            };
            if let Some(metrics) = &self.metrics {
                metrics.set_alive(pid);
            }
            return Ok(ExecutionResult::detached(pid));
        }

        let (code, stdout) = scripted
            .map(|s| (s.exit_code, s.stdout))
            .unwrap_or((0, String::new()));
        Ok(ExecutionResult::exited(0, code, stdout, String::new()))
    }

    async fn signal(&self, pid: u32, signal: ProcessSignal) -> Result<(), DomainError> {
        self.inner.lock().unwrap().signals.push((pid, signal));
        if let Some(metrics) = &self.metrics {
            metrics.kill(pid);
        }
        Ok(())
    }
}
