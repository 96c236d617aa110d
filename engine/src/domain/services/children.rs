//! Child discovery
//!
//! Direct OS children of a running managed process are tracked as shadow
//! children: they carry their own condition evaluators but never autostart,
//! carry no triggers and never discover children of their own. A breach can
//! only stop a child or drop it from the list.

use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::action_executor::ActionExecutor;
use super::condition_evaluator::{run_due, ConditionEvaluator};
use super::conditions::ProbeContext;
use crate::domain::ports::SystemMetrics;
use crate::domain::{ChildPolicy, ConditionAction, Event, ProcessSignal, ProcessSnapshot, ProcessState};

pub struct ChildProcess {
    pid: u32,
    name: String,
    evaluators: Vec<ConditionEvaluator>,
    stopping: bool,
}

impl ChildProcess {
    fn new(pid: u32, policy: &ChildPolicy) -> Self {
        Self {
            pid,
            name: format!("<child(pid:{})>", pid),
            evaluators: policy
                .conditions
                .iter()
                .cloned()
                .map(ConditionEvaluator::new)
                .collect(),
            stopping: false,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            name: self.name.clone(),
            pid: self.pid,
            state: if self.stopping {
                ProcessState::Stopping
            } else {
                ProcessState::Running
            },
        }
    }
}

/// How a breached child is stopped
#[derive(Clone)]
pub struct ChildStopper {
    pub actions: ActionExecutor,
    pub signals: Vec<ProcessSignal>,
    pub timeout: Duration,
    pub ctx: ProbeContext,
}

pub struct Children {
    policy: ChildPolicy,
    children: Vec<ChildProcess>,
    /// Stop actions still running; aborted on drop
    stops: JoinSet<()>,
}

impl Children {
    pub fn new(policy: ChildPolicy) -> Self {
        Self {
            policy,
            children: Vec::new(),
            stops: JoinSet::new(),
        }
    }

    pub fn pids(&self) -> Vec<u32> {
        self.children.iter().map(|c| c.pid).collect()
    }

    pub fn clear(&mut self) {
        self.children.clear();
    }

    /// Number of child stop actions not yet reaped
    pub fn pending_stops(&mut self) -> usize {
        while self.stops.try_join_next().is_some() {}
        self.stops.len()
    }

    /// Abort every child stop action still running
    pub fn abort_stops(&mut self) {
        if !self.stops.is_empty() {
            debug!(count = self.stops.len(), "Aborting child stop actions");
            self.stops.abort_all();
        }
    }

    /// Wait for every child stop action to finish or be aborted
    pub async fn join_stops(&mut self) {
        while let Some(joined) = self.stops.join_next().await {
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    warn!(error = %e, "Child stop task failed");
                }
            }
        }
    }

    /// Drop dead children and adopt new direct children of `parent_pid`
    pub fn refresh(&mut self, parent: &str, parent_pid: u32, metrics: &dyn SystemMetrics) {
        self.children.retain(|c| metrics.is_alive(c.pid));

        if parent_pid == 0 {
            return;
        }

        let known = self.pids();
        let found: Vec<u32> = metrics
            .children_of(parent_pid)
            .into_iter()
            .filter(|pid| !known.contains(pid))
            .collect();

        if !found.is_empty() {
            info!(
                process = %parent,
                existing = ?known,
                new = ?found,
                "Discovered child processes"
            );
        }
        for pid in found {
            self.children.push(ChildProcess::new(pid, &self.policy));
        }
    }

    /// Evaluate every child's conditions and apply the first breach per child
    pub async fn tick(&mut self, stopper: &ChildStopper, now: Instant) {
        while self.stops.try_join_next().is_some() {}
        let mut dropped = Vec::new();

        for child in self.children.iter_mut().filter(|c| !c.stopping) {
            let ctx = ProbeContext {
                pid: child.pid,
                ..stopper.ctx.clone()
            };
            let actions = run_due(&mut child.evaluators, &ctx, now, &child.name).await;

            for (condition, action) in actions {
                let events = match action {
                    ConditionAction::Events(events) => events,
                    ConditionAction::Callback(callback) => callback(&child.snapshot()),
                };
                let mut handled = false;
                for event in events {
                    match event {
                        Event::Stop | Event::Restart => {
                            debug!(process = %child.name, condition = %condition, "Stopping child");
                            child.stopping = true;
                            Self::spawn_stop(
                                &mut self.stops,
                                child.pid,
                                child.name.clone(),
                                self.policy.stop_command.clone(),
                                stopper.clone(),
                            );
                            handled = true;
                        }
                        Event::Unmonitor => {
                            debug!(process = %child.name, condition = %condition, "Dropping child");
                            dropped.push(child.pid);
                            handled = true;
                        }
                        other => {
                            debug!(process = %child.name, event = %other, "Event not applicable to child process");
                        }
                    }
                    if handled {
                        break;
                    }
                }
                if handled {
                    break;
                }
            }
        }

        self.children.retain(|c| !dropped.contains(&c.pid));
    }

    fn spawn_stop(
        stops: &mut JoinSet<()>,
        pid: u32,
        name: String,
        stop_command: Option<String>,
        stopper: ChildStopper,
    ) {
        stops.spawn(async move {
            if let Some(command) = stop_command {
                let command = command.replace("{{PID}}", &pid.to_string());
                let mut options = stopper.ctx.exec.clone();
                options.daemonize = false;
                options.stdin = None;
                options.timeout = Some(stopper.timeout);
                if let Err(e) = stopper.ctx.executor.run(&command, &options).await {
                    warn!(process = %name, error = %e, "Child stop command failed");
                }
            } else {
                let stopped = stopper
                    .actions
                    .stop_with_signals(&name, pid, &stopper.signals, stopper.timeout)
                    .await;
                debug!(process = %name, stopped, "Child signalled");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ExecOptions;
    use crate::domain::services::conditions::AlwaysTrue;
    use crate::domain::ConditionSpec;
    use crate::testing::{MockExecutor, MockMetrics};
    use std::sync::Arc;

    fn stopper(executor: &MockExecutor, metrics: &MockMetrics) -> ChildStopper {
        let executor: Arc<MockExecutor> = Arc::new(executor.clone());
        let metrics: Arc<MockMetrics> = Arc::new(metrics.clone());
        ChildStopper {
            actions: ActionExecutor::new(executor.clone(), metrics.clone()),
            signals: ProcessSignal::default_escalation(),
            timeout: Duration::from_secs(5),
            ctx: ProbeContext {
                pid: 0,
                metrics,
                executor,
                exec: ExecOptions::default(),
            },
        }
    }

    #[test]
    fn test_refresh_adopts_and_prunes() {
        let metrics = MockMetrics::new();
        metrics.set_process(100, 1, 0.0, 0);
        metrics.set_process(101, 100, 0.0, 0);
        metrics.set_process(102, 100, 0.0, 0);
        metrics.set_process(200, 101, 0.0, 0);

        let mut children = Children::new(ChildPolicy::default());
        children.refresh("web", 100, &metrics);
        assert_eq!(children.pids(), vec![101, 102]);
        assert_eq!(children.children[0].name(), "<child(pid:101)>");

        metrics.kill(101);
        children.refresh("web", 100, &metrics);
        assert_eq!(children.pids(), vec![102]);

        children.clear();
        assert!(children.pids().is_empty());
    }

    #[tokio::test]
    async fn test_breach_signals_child() {
        let metrics = MockMetrics::new();
        metrics.set_process(100, 1, 0.0, 0);
        metrics.set_process(101, 100, 0.0, 0);
        let executor = MockExecutor::linked(metrics.clone());

        let policy = ChildPolicy {
            conditions: vec![ConditionSpec::new(Arc::new(AlwaysTrue))],
            stop_command: None,
        };
        let mut children = Children::new(policy);
        children.refresh("web", 100, &metrics);
        children.tick(&stopper(&executor, &metrics), Instant::now()).await;
        children.join_stops().await;
        assert_eq!(executor.signals()[0].0, 101);
        assert_eq!(children.pending_stops(), 0);

        children.refresh("web", 100, &metrics);
        assert!(children.pids().is_empty());
    }

    #[tokio::test]
    async fn test_stop_command_substitutes_pid() {
        let metrics = MockMetrics::new();
        metrics.set_process(100, 1, 0.0, 0);
        metrics.set_process(101, 100, 0.0, 0);
        let executor = MockExecutor::new();

        let policy = ChildPolicy {
            conditions: vec![ConditionSpec::new(Arc::new(AlwaysTrue))],
            stop_command: Some("kill -QUIT {{PID}}".to_string()),
        };
        let mut children = Children::new(policy);
        children.refresh("web", 100, &metrics);
        children.tick(&stopper(&executor, &metrics), Instant::now()).await;
        children.join_stops().await;
        assert_eq!(executor.count("kill -QUIT 101"), 1);
    }

    #[tokio::test]
    async fn test_abort_cancels_running_stops() {
        let metrics = MockMetrics::new();
        metrics.set_process(101, 100, 0.0, 0);
        let executor = MockExecutor::new();
        executor.respond_slowly("kill -QUIT 101", 0, Duration::from_secs(30));

        let policy = ChildPolicy {
            conditions: vec![ConditionSpec::new(Arc::new(AlwaysTrue))],
            stop_command: Some("kill -QUIT {{PID}}".to_string()),
        };
        let mut children = Children::new(policy);
        children.refresh("web", 100, &metrics);
        children.tick(&stopper(&executor, &metrics), Instant::now()).await;
        assert_eq!(children.pending_stops(), 1);

        children.abort_stops();
        tokio::time::timeout(Duration::from_secs(1), children.join_stops())
            .await
            .expect("aborted stop should finish promptly");
        assert_eq!(children.pending_stops(), 0);
    }

    #[tokio::test]
    async fn test_unmonitor_drops_child() {
        let metrics = MockMetrics::new();
        metrics.set_process(101, 100, 0.0, 0);
        let executor = MockExecutor::new();

        let policy = ChildPolicy {
            conditions: vec![ConditionSpec::new(Arc::new(AlwaysTrue))
                .action(ConditionAction::Events(vec![Event::Start, Event::Unmonitor]))],
            stop_command: None,
        };
        let mut children = Children::new(policy);
        children.refresh("web", 100, &metrics);
        children.tick(&stopper(&executor, &metrics), Instant::now()).await;
        assert!(children.pids().is_empty());
        assert!(executor.signals().is_empty());
    }
}
