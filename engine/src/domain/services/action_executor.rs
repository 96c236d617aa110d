//! Action Executor
//! Runs the start/stop/restart pipeline:
//! before hook -> command or signal escalation -> after hook,
//! bounded as a whole by the action timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::domain::constants::{MIN_SIGNAL_POLLS, SIGNAL_POLL_INTERVAL};
use crate::domain::ports::{ExecOptions, ProcessExecutor, SystemMetrics};
use crate::domain::{Event, ProcessDefinition, ProcessSignal};

/// Everything needed to run one action, detached from the definition
#[derive(Debug, Clone)]
pub struct ActionPlan {
    pub kind: Event,
    pub before: Option<String>,
    pub command: Option<String>,
    pub after: Option<String>,
    pub signals: Vec<ProcessSignal>,
    pub timeout: Duration,
    /// Options for the main command; hooks run with the same options in the foreground
    pub options: ExecOptions,
}

impl ActionPlan {
    pub fn for_event(definition: &ProcessDefinition, kind: Event) -> Option<Self> {
        let spec = definition.action(kind)?;

        let mut options = definition.exec_options();
        options.env.extend(spec.env.clone());
        if kind == Event::Start {
            options.daemonize = definition.daemonize;
            options.stdin = definition.stdin.clone();
        }

        Some(Self {
            kind,
            before: spec.before.clone(),
            command: spec.command.clone(),
            after: spec.after.clone(),
            signals: spec.signals.clone(),
            timeout: spec.timeout,
            options,
        })
    }

    fn hook_options(&self) -> ExecOptions {
        ExecOptions {
            daemonize: false,
            stdin: None,
            ..self.options.clone()
        }
    }
}

/// Result reported back to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionOutcome {
    pub succeeded: bool,
    /// Pid reported by a daemonized command, 0 otherwise
    pub pid: u32,
    pub elapsed: Duration,
    pub timed_out: bool,
}

impl ActionOutcome {
    /// Whole seconds of the timeout budget left unused
    pub fn time_left(&self, timeout: Duration) -> u64 {
        timeout.as_secs().saturating_sub(self.elapsed.as_secs())
    }
}

#[derive(Clone)]
pub struct ActionExecutor {
    executor: Arc<dyn ProcessExecutor>,
    metrics: Arc<dyn SystemMetrics>,
}

impl ActionExecutor {
    pub fn new(executor: Arc<dyn ProcessExecutor>, metrics: Arc<dyn SystemMetrics>) -> Self {
        Self { executor, metrics }
    }

    /// Run `plan` against `pid`. Never fails: problems are logged and
    /// reported as an unsuccessful outcome.
    pub async fn execute(&self, plan: &ActionPlan, pid: u32) -> ActionOutcome {
        let started = Instant::now();
        let name = plan.options.name.as_str();

        debug!(process = %name, action = %plan.kind, pid, "Executing action");

        match tokio::time::timeout(plan.timeout, self.pipeline(plan, pid)).await {
            Ok((succeeded, spawned_pid)) => {
                let elapsed = started.elapsed();
                if succeeded {
                    info!(process = %name, action = %plan.kind, elapsed_ms = elapsed.as_millis() as u64, "Action succeeded");
                } else {
                    warn!(process = %name, action = %plan.kind, "Action failed");
                }
                ActionOutcome {
                    succeeded,
                    pid: spawned_pid,
                    elapsed,
                    timed_out: false,
                }
            }
            Err(_) => {
                warn!(
                    process = %name,
                    action = %plan.kind,
                    timeout_secs = plan.timeout.as_secs(),
                    "Action timed out"
                );
                ActionOutcome {
                    succeeded: false,
                    pid: 0,
                    elapsed: started.elapsed(),
                    timed_out: true,
                }
            }
        }
    }

    async fn pipeline(&self, plan: &ActionPlan, pid: u32) -> (bool, u32) {
        let name = plan.options.name.as_str();

        if let Some(before) = &plan.before {
            if !self.run_hook(name, "before", before, plan).await {
                return (false, 0);
            }
        }

        let (succeeded, spawned_pid) = if let Some(command) = &plan.command {
            match self.executor.run(command, &plan.options).await {
                Ok(result) => {
                    if !result.succeeded {
                        debug!(
                            process = %name,
                            action = %plan.kind,
                            exit_code = ?result.exit_code,
                            stderr = %result.stderr.trim(),
                            "Action command unsuccessful"
                        );
                    }
                    (result.succeeded, result.pid)
                }
                Err(e) => {
                    warn!(process = %name, action = %plan.kind, error = %e, "Action command failed to run");
                    (false, 0)
                }
            }
        } else if !plan.signals.is_empty() {
            (
                self.stop_with_signals(name, pid, &plan.signals, plan.timeout).await,
                0,
            )
        } else {
            warn!(process = %name, action = %plan.kind, "No command or signals configured");
            (false, 0)
        };

        if succeeded {
            if let Some(after) = &plan.after {
                self.run_hook(name, "after", after, plan).await;
            }
        }

        (succeeded, spawned_pid)
    }

    async fn run_hook(&self, name: &str, stage: &str, command: &str, plan: &ActionPlan) -> bool {
        match self.executor.run(command, &plan.hook_options()).await {
            Ok(result) if result.succeeded => true,
            Ok(result) => {
                warn!(
                    process = %name,
                    action = %plan.kind,
                    hook = stage,
                    exit_code = ?result.exit_code,
                    "Hook command unsuccessful"
                );
                false
            }
            Err(e) => {
                warn!(process = %name, action = %plan.kind, hook = stage, error = %e, "Hook command failed to run");
                false
            }
        }
    }

    /// Send each signal in turn, polling liveness for an even share of
    /// `timeout` (at least two polls) before escalating. True once the pid
    /// is gone; a pid that is not running counts as stopped.
    pub async fn stop_with_signals(
        &self,
        name: &str,
        pid: u32,
        signals: &[ProcessSignal],
        timeout: Duration,
    ) -> bool {
        if pid == 0 || !self.metrics.is_alive(pid) {
            return true;
        }

        let polls = (timeout.as_secs() / signals.len().max(1) as u64).max(MIN_SIGNAL_POLLS);

        for signal in signals {
            debug!(process = %name, pid, signal = %signal, "Sending signal");
            if let Err(e) = self.executor.signal(pid, *signal).await {
                warn!(process = %name, pid, signal = %signal, error = %e, "Failed to send signal");
            }

            for _ in 0..polls {
                if !self.metrics.is_alive(pid) {
                    return true;
                }
                tokio::time::sleep(SIGNAL_POLL_INTERVAL).await;
            }
        }

        !self.metrics.is_alive(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockExecutor, MockMetrics};
    use nix::sys::signal::Signal;

    fn plan(kind: Event) -> ActionPlan {
        ActionPlan {
            kind,
            before: None,
            command: None,
            after: None,
            signals: Vec::new(),
            timeout: Duration::from_secs(5),
            options: ExecOptions {
                name: "web".to_string(),
                ..Default::default()
            },
        }
    }

    fn actions(executor: &MockExecutor, metrics: &MockMetrics) -> ActionExecutor {
        ActionExecutor::new(Arc::new(executor.clone()), Arc::new(metrics.clone()))
    }

    #[tokio::test]
    async fn test_before_hook_failure_aborts() {
        let metrics = MockMetrics::new();
        let executor = MockExecutor::new();
        executor.respond("check", 1, "");

        let mut p = plan(Event::Start);
        p.before = Some("check".to_string());
        p.command = Some("run".to_string());

        let outcome = actions(&executor, &metrics).execute(&p, 0).await;
        assert!(!outcome.succeeded);
        assert_eq!(executor.commands(), vec!["check".to_string()]);
    }

    #[tokio::test]
    async fn test_command_then_after_hook() {
        let metrics = MockMetrics::new();
        let executor = MockExecutor::new();

        let mut p = plan(Event::Start);
        p.command = Some("run".to_string());
        p.after = Some("notify".to_string());
        p.options.daemonize = true;

        let outcome = actions(&executor, &metrics).execute(&p, 0).await;
        assert!(outcome.succeeded);
        assert!(outcome.pid > 0);
        assert_eq!(executor.commands(), vec!["run".to_string(), "notify".to_string()]);
        assert!(!executor.last_options("notify").unwrap().daemonize);
    }

    #[tokio::test]
    async fn test_after_hook_result_ignored_and_skipped_on_failure() {
        let metrics = MockMetrics::new();
        let executor = MockExecutor::new();
        executor.respond("notify", 1, "");
        executor.respond("broken", 2, "");

        let mut p = plan(Event::Stop);
        p.command = Some("run".to_string());
        p.after = Some("notify".to_string());
        assert!(actions(&executor, &metrics).execute(&p, 0).await.succeeded);

        p.command = Some("broken".to_string());
        assert!(!actions(&executor, &metrics).execute(&p, 0).await.succeeded);
        assert_eq!(executor.count("notify"), 1);
    }

    #[tokio::test]
    async fn test_signals_stop_at_first_effective_signal() {
        let metrics = MockMetrics::new();
        metrics.set_alive(321);
        let executor = MockExecutor::linked(metrics.clone());

        let mut p = plan(Event::Stop);
        p.signals = ProcessSignal::default_escalation();

        let outcome = actions(&executor, &metrics).execute(&p, 321).await;
        assert!(outcome.succeeded);
        let sent = executor.signals();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], (321, ProcessSignal::from(Signal::SIGTERM)));
    }

    #[tokio::test]
    async fn test_signals_on_unknown_pid_succeed() {
        let metrics = MockMetrics::new();
        let executor = MockExecutor::new();
        let mut p = plan(Event::Stop);
        p.signals = ProcessSignal::default_escalation();

        assert!(actions(&executor, &metrics).execute(&p, 0).await.succeeded);
        assert!(actions(&executor, &metrics).execute(&p, 404).await.succeeded);
        assert!(executor.signals().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_reports_failure() {
        let metrics = MockMetrics::new();
        let executor = MockExecutor::new();
        executor.respond_slowly("slow", 0, Duration::from_secs(10));

        let mut p = plan(Event::Restart);
        p.command = Some("slow".to_string());
        p.timeout = Duration::from_millis(100);

        let outcome = actions(&executor, &metrics).execute(&p, 0).await;
        assert!(!outcome.succeeded);
        assert!(outcome.timed_out);
    }

    #[tokio::test]
    async fn test_nothing_configured_fails() {
        let metrics = MockMetrics::new();
        let executor = MockExecutor::new();
        assert!(!actions(&executor, &metrics).execute(&plan(Event::Start), 0).await.succeeded);
    }

    #[test]
    fn test_time_left() {
        let outcome = ActionOutcome {
            succeeded: true,
            pid: 0,
            elapsed: Duration::from_millis(1500),
            timed_out: false,
        };
        assert_eq!(outcome.time_left(Duration::from_secs(30)), 29);
        assert_eq!(outcome.time_left(Duration::from_secs(1)), 0);
    }

    #[test]
    fn test_plan_for_start_carries_stdin_and_daemonize() {
        let definition = ProcessDefinition::builder("web")
            .start_command("run")
            .stdin(crate::domain::StdinSource::Literal("port 6000".to_string()))
            .build()
            .unwrap();
        let start = ActionPlan::for_event(&definition, Event::Start).unwrap();
        assert!(start.options.daemonize);
        assert!(start.options.stdin.is_some());

        let stop = ActionPlan::for_event(&definition, Event::Stop).unwrap();
        assert!(!stop.options.daemonize);
        assert!(stop.options.stdin.is_none());
        assert_eq!(stop.signals.len(), 3);
        assert!(ActionPlan::for_event(&definition, Event::Tick).is_none());
    }
}
