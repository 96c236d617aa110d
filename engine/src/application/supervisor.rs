//! Supervisor
//! Composition root for a running daemon: the process table, the shared
//! executor and metrics handles, and the tick loop driving every process.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::managed_process::{ManagedProcess, ProcessStatus};
use crate::domain::ports::{ProcessExecutor, SystemMetrics};
use crate::domain::{DomainError, Event, ProcessDefinition, Result};
use crate::infrastructure::config;

/// One line of a status listing
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatusEntry {
    Process(ProcessStatus),
    Error { target: String, error: String },
}

pub struct Supervisor {
    executor: Arc<dyn ProcessExecutor>,
    metrics: Arc<dyn SystemMetrics>,
    processes: RwLock<BTreeMap<String, Arc<ManagedProcess>>>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(executor: Arc<dyn ProcessExecutor>, metrics: Arc<dyn SystemMetrics>) -> Self {
        Self {
            executor,
            metrics,
            processes: RwLock::new(BTreeMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelled once [`Supervisor::shutdown`] has run
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register a process. With `monitor` set, supervision begins right away.
    pub async fn add(&self, definition: ProcessDefinition, monitor: bool) -> Result<Arc<ManagedProcess>> {
        let name = definition.name.clone();
        let process = {
            let mut processes = self.processes.write().await;
            if processes.contains_key(&name) {
                return Err(DomainError::DuplicateProcess(name));
            }
            let process = ManagedProcess::new(definition, self.executor.clone(), self.metrics.clone());
            processes.insert(name.clone(), process.clone());
            process
        };

        info!(process = %name, group = ?process.group(), monitor, "Process registered");
        if monitor {
            process.dispatch(Event::Monitor).await;
        }
        Ok(process)
    }

    /// Unmonitor a process and forget it
    pub async fn remove(&self, name: &str) -> Result<()> {
        let process = self
            .processes
            .write()
            .await
            .remove(name)
            .ok_or_else(|| DomainError::ProcessNotFound(name.to_string()))?;

        process.handle_user_command(Event::Unmonitor).await;
        process.shutdown().await;
        info!(process = %name, "Process removed");
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<ManagedProcess>> {
        self.processes.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        self.processes.read().await.keys().cloned().collect()
    }

    /// One supervision round, waiting for every process tick to finish
    pub async fn tick_all(&self) {
        let mut ticks = JoinSet::new();
        self.spawn_ticks(&mut ticks).await;
        while let Some(joined) = ticks.join_next().await {
            Self::reap_tick(joined);
        }
    }

    /// Refresh the metrics snapshot once, then start one tick per process.
    /// A process still busy with its previous tick drops the new one, so a
    /// slow ping or exec condition never holds back the others.
    async fn spawn_ticks(&self, ticks: &mut JoinSet<()>) {
        if let Err(e) = self.metrics.reset_cache().await {
            warn!(error = %e, "Failed to refresh process metrics");
        }

        let processes: Vec<Arc<ManagedProcess>> =
            self.processes.read().await.values().cloned().collect();
        for process in processes {
            ticks.spawn(async move { process.tick().await });
        }
    }

    fn reap_tick(joined: std::result::Result<(), tokio::task::JoinError>) {
        if let Err(e) = joined {
            if !e.is_cancelled() {
                error!(error = %e, "Process tick failed");
            }
        }
    }

    /// Tick on a fixed interval until shut down. Missed ticks are skipped and
    /// rounds never wait on each other; ticks still running at shutdown are
    /// aborted.
    pub async fn run(&self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks = JoinSet::new();

        info!(interval_ms = period.as_millis() as u64, "Supervision loop started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => self.spawn_ticks(&mut ticks).await,
                Some(joined) = ticks.join_next(), if !ticks.is_empty() => Self::reap_tick(joined),
            }
        }
        ticks.shutdown().await;
        info!("Supervision loop stopped");
    }

    /// Apply a user command to every process named or grouped by `args`
    pub async fn command(&self, command: &str, args: &[String]) -> Result<Vec<ProcessStatus>> {
        let event: Event = command.parse()?;
        if !Event::USER_COMMANDS.contains(&event) {
            return Err(DomainError::UnknownCommand(command.to_string()));
        }

        let targets = self.resolve(args).await?;
        let mut statuses = Vec::with_capacity(targets.len());
        for process in targets {
            process.handle_user_command(event).await;
            statuses.push(process.status().await);
        }
        Ok(statuses)
    }

    /// Status of every process, or of those named or grouped by `args`.
    /// Unknown targets become error entries.
    pub async fn status(&self, args: &[String]) -> Vec<StatusEntry> {
        let mut entries = Vec::new();

        if args.is_empty() {
            let processes: Vec<Arc<ManagedProcess>> =
                self.processes.read().await.values().cloned().collect();
            for process in processes {
                entries.push(StatusEntry::Process(process.status().await));
            }
            return entries;
        }

        for target in args {
            match self.resolve(std::slice::from_ref(target)).await {
                Ok(processes) => {
                    for process in processes {
                        entries.push(StatusEntry::Process(process.status().await));
                    }
                }
                Err(e) => entries.push(StatusEntry::Error {
                    target: target.clone(),
                    error: e.to_string(),
                }),
            }
        }
        entries
    }

    /// Load a YAML file or directory. Returns the names registered; entries
    /// that fail validation or clash with a known name are logged and skipped.
    pub async fn load(&self, path: &Path) -> Result<Vec<String>> {
        let loaded = config::load_path(path)?;

        let mut names = Vec::new();
        for entry in loaded {
            let name = entry.definition.name.clone();
            match self.add(entry.definition, entry.monitor).await {
                Ok(_) => names.push(name),
                Err(e) => warn!(process = %name, error = %e, "Skipping process"),
            }
        }
        info!(path = %path.display(), loaded = names.len(), "Configuration loaded");
        Ok(names)
    }

    /// Stop supervising. Scheduled events and in-flight actions are
    /// cancelled; managed OS processes keep running.
    pub async fn shutdown(&self) {
        // Stops the tick loop first so no tick holds a process lock
        self.shutdown.cancel();
        let processes: Vec<Arc<ManagedProcess>> =
            self.processes.read().await.values().cloned().collect();
        for process in processes {
            process.shutdown().await;
        }
        debug!("Supervisor shut down");
    }

    /// Names first, then groups
    async fn resolve(&self, targets: &[String]) -> Result<Vec<Arc<ManagedProcess>>> {
        if targets.is_empty() {
            return Err(DomainError::MissingProcessName);
        }

        let processes = self.processes.read().await;
        let mut matched: Vec<Arc<ManagedProcess>> = Vec::new();
        for target in targets {
            let found: Vec<&Arc<ManagedProcess>> = match processes.get(target) {
                Some(process) => vec![process],
                None => processes
                    .values()
                    .filter(|p| p.group() == Some(target.as_str()))
                    .collect(),
            };
            if found.is_empty() {
                return Err(DomainError::ProcessNotFound(target.clone()));
            }
            for process in found {
                if !matched.iter().any(|m| Arc::ptr_eq(m, process)) {
                    matched.push(process.clone());
                }
            }
        }
        Ok(matched)
    }
}
