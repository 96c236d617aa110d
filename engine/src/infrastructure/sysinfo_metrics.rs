//! sysinfo-backed System Metrics
//! Refreshes the OS process table once per tick and answers cpu, memory and
//! parentage queries from the resulting snapshot. Liveness always probes the
//! kernel with signal 0.

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use sysinfo::{ProcessesToUpdate, System};
use tracing::debug;

use crate::domain::ports::SystemMetrics;
use crate::domain::DomainError;

#[derive(Debug, Clone, Copy, PartialEq)]
struct ProcessSample {
    ppid: u32,
    cpu_percent: f64,
    rss_kb: u64,
}

type ProcessTable = HashMap<u32, ProcessSample>;

/// Keeps one `System` alive across ticks; cpu usage is measured between
/// two consecutive refreshes.
pub struct SysinfoMetrics {
    system: Arc<Mutex<System>>,
    table: RwLock<Arc<ProcessTable>>,
}

impl Default for SysinfoMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoMetrics {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
            table: RwLock::new(Arc::new(ProcessTable::new())),
        }
    }

    fn snapshot(&self) -> Arc<ProcessTable> {
        self.table.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn refresh(system: &mut System) -> ProcessTable {
        system.refresh_processes(ProcessesToUpdate::All, true);
        system
            .processes()
            .iter()
            .map(|(pid, process)| {
                let sample = ProcessSample {
                    ppid: process.parent().map(|p| p.as_u32()).unwrap_or(0),
                    cpu_percent: f64::from(process.cpu_usage()),
                    rss_kb: process.memory() / 1024,
                };
                (pid.as_u32(), sample)
            })
            .collect()
    }
}

#[async_trait]
impl SystemMetrics for SysinfoMetrics {
    async fn reset_cache(&self) -> Result<(), DomainError> {
        let system = self.system.clone();
        // Reading /proc for every process blocks
        let table = tokio::task::spawn_blocking(move || {
            let mut system = system.lock().unwrap_or_else(|e| e.into_inner());
            Self::refresh(&mut system)
        })
        .await
        .map_err(|e| DomainError::ProbeFailed(format!("Process table refresh failed: {}", e)))?;

        debug!(processes = table.len(), "Refreshed process table");
        *self.table.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(table);
        Ok(())
    }

    fn cpu_usage(&self, pid: u32) -> Option<f64> {
        self.snapshot().get(&pid).map(|s| s.cpu_percent)
    }

    fn memory_usage(&self, pid: u32) -> Option<u64> {
        self.snapshot().get(&pid).map(|s| s.rss_kb)
    }

    fn children_of(&self, pid: u32) -> Vec<u32> {
        let mut children: Vec<u32> = self
            .snapshot()
            .iter()
            .filter(|(_, s)| s.ppid == pid)
            .map(|(child, _)| *child)
            .collect();
        children.sort_unstable();
        children
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw == 0 {
            return false;
        }
        // EPERM means the pid exists but belongs to someone else
        matches!(signal::kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
    }
}
