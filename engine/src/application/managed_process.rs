//! Managed Process
//! One supervised process: its lifecycle state machine, condition evaluators,
//! triggers, discovered children and the single in-flight action.
//!
//! Every state change goes through [`ManagedProcess::dispatch`] (or the user
//! command variant), which serialises on the process lock. Actions run on a
//! spawned task and report back without holding that lock; events scheduled
//! by triggers are fed through a per-process queue.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::constants::DEFAULT_PROBE_TIMEOUT_SEC;
use crate::domain::ports::{ProcessExecutor, SystemMetrics};
use crate::domain::services::{
    run_due, ActionExecutor, ActionOutcome, ActionPlan, ChildStopper, Children,
    ConditionEvaluator, PidTracker, ProbeContext, TickSkip, TriggerDelegate,
};
use crate::domain::value_objects::edges;
use crate::domain::{
    ConditionAction, Event, ProcessDefinition, ProcessSnapshot, ProcessState, Transition,
};

/// Point-in-time view of a managed process, as reported to clients
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessStatus {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub state: ProcessState,
    pub pid: u32,
    pub autostart: bool,
    /// Unix seconds of the last non-loopback transition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_kb: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<u32>,
}

/// State guarded by the dispatch lock
struct ProcessCore {
    state: ProcessState,
    autostart: bool,
    evaluators: Vec<ConditionEvaluator>,
    triggers: Vec<TriggerDelegate>,
    children: Option<Children>,
}

/// Readable without waiting on the dispatch lock
#[derive(Clone, Copy)]
struct Mirror {
    state: ProcessState,
    autostart: bool,
    since: Option<SystemTime>,
    children: usize,
}

struct InFlightAction {
    generation: u64,
    kind: Event,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Marks a tick in progress; released on drop, including when the tick
/// future is cancelled
struct TickGuard<'a>(&'a AtomicBool);

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ManagedProcess {
    definition: ProcessDefinition,
    core: tokio::sync::Mutex<ProcessCore>,
    mirror: Mutex<Mirror>,
    child_pids: Mutex<Vec<u32>>,
    pids: PidTracker,
    skip: TickSkip,
    actions: ActionExecutor,
    executor: Arc<dyn ProcessExecutor>,
    metrics: Arc<dyn SystemMetrics>,
    action: Mutex<Option<InFlightAction>>,
    generation: AtomicU64,
    last_running: AtomicBool,
    ticking: AtomicBool,
    scheduled: mpsc::UnboundedSender<Event>,
    weak: Weak<ManagedProcess>,
}

impl ManagedProcess {
    /// Build the process in the `unmonitored` state. Must be called from
    /// within a Tokio runtime: the queue for trigger-scheduled events is
    /// drained by a task spawned here, which ends when the process is dropped.
    pub fn new(
        definition: ProcessDefinition,
        executor: Arc<dyn ProcessExecutor>,
        metrics: Arc<dyn SystemMetrics>,
    ) -> Arc<Self> {
        let (scheduled, mut queue) = mpsc::unbounded_channel::<Event>();

        let process = Arc::new_cyclic(|weak| {
            let core = ProcessCore {
                state: ProcessState::Unmonitored,
                autostart: definition.autostart,
                evaluators: definition
                    .conditions
                    .iter()
                    .cloned()
                    .map(ConditionEvaluator::new)
                    .collect(),
                triggers: definition
                    .triggers
                    .iter()
                    .map(TriggerDelegate::from_spec)
                    .collect(),
                children: definition.children.clone().map(Children::new),
            };
            let mirror = Mirror {
                state: core.state,
                autostart: core.autostart,
                since: None,
                children: 0,
            };

            Self {
                pids: PidTracker::new(
                    definition.name.clone(),
                    definition.pidfile.clone(),
                    definition.pid_command.clone(),
                    definition.exec_options(),
                    executor.clone(),
                    metrics.clone(),
                ),
                actions: ActionExecutor::new(executor.clone(), metrics.clone()),
                definition,
                core: tokio::sync::Mutex::new(core),
                mirror: Mutex::new(mirror),
                child_pids: Mutex::new(Vec::new()),
                skip: TickSkip::new(),
                executor,
                metrics,
                action: Mutex::new(None),
                generation: AtomicU64::new(0),
                last_running: AtomicBool::new(false),
                ticking: AtomicBool::new(false),
                scheduled,
                weak: weak.clone(),
            }
        });

        let weak = Arc::downgrade(&process);
        tokio::spawn(async move {
            while let Some(event) = queue.recv().await {
                let Some(process) = weak.upgrade() else {
                    break;
                };
                debug!(process = %process.name(), event = %event, "Dispatching scheduled event");
                process.dispatch(event).await;
            }
        });

        process
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn group(&self) -> Option<&str> {
        self.definition.group.as_deref()
    }

    pub fn definition(&self) -> &ProcessDefinition {
        &self.definition
    }

    pub fn state(&self) -> ProcessState {
        self.mirror().state
    }

    pub fn autostart(&self) -> bool {
        self.mirror().autostart
    }

    pub fn last_transition_at(&self) -> Option<SystemTime> {
        self.mirror().since
    }

    /// Number of actions launched so far
    pub fn actions_launched(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Events scheduled by triggers and not yet fired
    pub async fn pending_events(&self) -> usize {
        let core = self.core.lock().await;
        core.triggers.iter().map(TriggerDelegate::pending_events).sum()
    }

    fn mirror(&self) -> Mirror {
        *self.mirror.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update_mirror(&self, f: impl FnOnce(&mut Mirror)) {
        let mut mirror = self.mirror.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut mirror);
    }

    fn snapshot(&self, state: ProcessState) -> ProcessSnapshot {
        ProcessSnapshot {
            name: self.definition.name.clone(),
            pid: self.pids.cached(),
            state,
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Fire `event` against the state machine. Returns true when a transition
    /// (loopbacks included) was taken.
    pub async fn dispatch(&self, event: Event) -> bool {
        let mut core = self.core.lock().await;
        self.fire_locked(&mut core, event).await.is_some()
    }

    /// Fire an event on behalf of a user. Every trigger is reset first, which
    /// also cancels the events they have scheduled.
    pub async fn handle_user_command(&self, event: Event) -> bool {
        let mut core = self.core.lock().await;
        for trigger in core.triggers.iter_mut() {
            trigger.reset();
        }
        info!(process = %self.name(), command = %event, state = %core.state, "User command");
        self.fire_locked(&mut core, event).await.is_some()
    }

    async fn fire_locked(&self, core: &mut ProcessCore, event: Event) -> Option<Transition> {
        let candidates = edges(event, core.state);
        if candidates.is_empty() {
            debug!(process = %self.name(), event = %event, state = %core.state, "Event not applicable");
            return None;
        }

        let running = if candidates.iter().any(|edge| edge.guard.needs_liveness()) {
            self.process_running().await
        } else {
            false
        };
        let Some(edge) = candidates
            .iter()
            .find(|edge| edge.guard.holds(running, core.autostart))
        else {
            debug!(process = %self.name(), event = %event, state = %core.state, running, "No guard satisfied");
            return None;
        };

        let transition = Transition::new(event, core.state, edge.to);

        let snapshot = self.snapshot(core.state);
        for trigger in core.triggers.iter_mut() {
            let scheduled = self.scheduled.clone();
            let vetoed = trigger.notify(&transition, &snapshot, move |event| {
                let scheduled = scheduled.clone();
                async move {
                    // Receiver gone means the process was dropped
                    let _ = scheduled.send(event);
                }
            });
            if vetoed {
                info!(
                    process = %self.name(),
                    from = %transition.from,
                    to = %transition.to,
                    trigger = trigger.name(),
                    "Transition vetoed"
                );
                return None;
            }
        }

        if let Some(autostart) = transition.to.autostart_on_entry() {
            core.autostart = autostart;
        }
        core.state = transition.to;
        let autostart = core.autostart;
        self.update_mirror(|m| {
            m.state = transition.to;
            m.autostart = autostart;
        });

        match (transition.from, transition.to) {
            (_, ProcessState::Starting) => self.launch_action(Event::Start),
            (ProcessState::Running, ProcessState::Stopping) => self.launch_action(Event::Stop),
            (_, ProcessState::Restarting) => self.launch_action(Event::Restart),
            _ => {}
        }

        if !transition.is_loopback() {
            info!(
                process = %self.name(),
                event = %transition.event,
                from = %transition.from,
                to = %transition.to,
                "State changed"
            );
            for evaluator in core.evaluators.iter_mut() {
                evaluator.clear_history();
            }
            if let Some(children) = core.children.as_mut() {
                children.clear();
            }
            self.set_child_pids(Vec::new());
            self.update_mirror(|m| m.since = Some(SystemTime::now()));
            if self.pids.pidfile().is_some() {
                self.pids.read().await;
            }
        }

        Some(transition)
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    /// Liveness as seen by the state machine. Frozen at the last observation
    /// while an action's tick-skip window is open.
    async fn process_running(&self) -> bool {
        if self.skip.active() {
            return self.last_running.load(Ordering::SeqCst);
        }

        let running = if let Some(ping) = &self.definition.ping_command {
            let mut options = self.definition.exec_options();
            options.timeout = Some(Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SEC));
            match self.executor.run(ping, &options).await {
                Ok(result) => result.succeeded,
                Err(e) => {
                    debug!(process = %self.name(), error = %e, "ping_command failed");
                    false
                }
            }
        } else {
            let pid = self.pids.current().await;
            pid != 0 && self.metrics.is_alive(pid)
        };

        self.last_running.store(running, Ordering::SeqCst);
        running
    }

    // ========================================================================
    // Actions
    // ========================================================================

    /// Start `kind` on a background task, superseding any action in flight
    fn launch_action(&self, kind: Event) {
        let Some(plan) = ActionPlan::for_event(&self.definition, kind) else {
            return;
        };

        // Generation and skip window only change under the slot lock
        let mut slot = self.action.lock().unwrap_or_else(|e| e.into_inner());
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        self.skip.arm(plan.timeout.as_secs());

        if let Some(previous) = slot.take() {
            debug!(
                process = %self.name(),
                superseded = %previous.kind,
                action = %kind,
                "Cancelling in-flight action"
            );
            previous.token.cancel();
        }

        let weak = self.weak.clone();
        let actions = self.actions.clone();
        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            let Some(process) = weak.upgrade() else {
                return;
            };
            let pid = process.pids.current().await;
            let outcome = tokio::select! {
                _ = cancelled.cancelled() => {
                    debug!(process = %process.name(), action = %plan.kind, "Action cancelled");
                    return;
                }
                outcome = actions.execute(&plan, pid) => outcome,
            };
            process.complete_action(generation, &plan, outcome).await;
        });

        *slot = Some(InFlightAction {
            generation,
            kind,
            token,
            handle,
        });
    }

    async fn complete_action(&self, generation: u64, plan: &ActionPlan, outcome: ActionOutcome) {
        let gone = matches!(plan.kind, Event::Stop | Event::Restart)
            && outcome.succeeded
            && self.definition.daemonize
            && self.pids.read().await == 0;

        // Held until the bookkeeping is done so a newer action cannot
        // interleave with a stale result
        let mut slot = self.action.lock().unwrap_or_else(|e| e.into_inner());
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(process = %self.name(), action = %plan.kind, "Ignoring superseded action result");
            return;
        }

        self.skip.rollback(outcome.time_left(plan.timeout));

        let mut keep_cached = false;
        match plan.kind {
            Event::Start => {
                if outcome.succeeded && self.definition.daemonize && outcome.pid != 0 {
                    if let Err(e) = self.pids.write(outcome.pid) {
                        warn!(process = %self.name(), error = %e, "Failed to write PID file");
                    }
                    keep_cached = !self.pids.has_source();
                }
            }
            Event::Stop | Event::Restart if gone => {
                if let Err(e) = self.pids.unlink() {
                    warn!(process = %self.name(), error = %e, "Failed to remove PID file");
                }
            }
            _ => {}
        }
        if !keep_cached {
            self.pids.invalidate();
        }

        if slot.as_ref().map(|a| a.generation) == Some(generation) {
            *slot = None;
        }
    }

    /// Cancel an action still running once its tick-skip window has closed
    fn abandon_stale_action(&self) {
        let mut slot = self.action.lock().unwrap_or_else(|e| e.into_inner());
        let stale = slot.as_ref().is_some_and(|a| !a.handle.is_finished());
        if stale {
            if let Some(action) = slot.take() {
                warn!(process = %self.name(), action = %action.kind, "Abandoning action past its timeout");
                action.token.cancel();
            }
        } else if slot.as_ref().is_some_and(|a| a.handle.is_finished()) {
            *slot = None;
        }
    }

    /// Wait for the action in flight, if any, to finish
    pub async fn join_action(&self) {
        let action = self.action.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(action) = action {
            if let Err(e) = action.handle.await {
                warn!(process = %self.name(), error = %e, "Action task failed");
            }
        }
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// One supervision pass: re-derive the state, then evaluate conditions
    /// and children while running. A tick arriving while the previous one is
    /// still running is dropped.
    pub async fn tick(&self) {
        if self.skip.skip_tick() {
            debug!(process = %self.name(), remaining = self.skip.remaining(), "Skipping tick");
            return;
        }
        let Some(_ticking) = TickGuard::acquire(&self.ticking) else {
            debug!(process = %self.name(), "Previous tick still running");
            return;
        };
        self.abandon_stale_action();

        let mut core = self.core.lock().await;
        self.fire_locked(&mut core, Event::Tick).await;

        if core.state != ProcessState::Running {
            return;
        }
        self.run_conditions(&mut core).await;

        if core.state == ProcessState::Running {
            self.tick_children(&mut core).await;
        }
    }

    fn probe_context(&self, pid: u32) -> ProbeContext {
        ProbeContext {
            pid,
            metrics: self.metrics.clone(),
            executor: self.executor.clone(),
            exec: self.definition.exec_options(),
        }
    }

    /// Evaluate due conditions and apply breach actions in condition order.
    /// Once one of them causes a transition the rest are dropped.
    async fn run_conditions(&self, core: &mut ProcessCore) {
        if core.evaluators.is_empty() {
            return;
        }

        let ctx = self.probe_context(self.pids.current().await);
        let breached = run_due(&mut core.evaluators, &ctx, Instant::now(), self.name()).await;

        let mut transitioned = false;
        'breaches: for (condition, action) in breached {
            let events = match action {
                ConditionAction::Events(events) => events,
                ConditionAction::Callback(callback) => callback(&self.snapshot(core.state)),
            };
            for event in events {
                if transitioned {
                    debug!(process = %self.name(), condition = %condition, event = %event, "Skipping action after transition");
                    break 'breaches;
                }
                info!(process = %self.name(), condition = %condition, event = %event, "Condition triggered");
                if let Some(transition) = self.fire_locked(core, event).await {
                    transitioned = !transition.is_loopback();
                }
            }
        }
    }

    async fn tick_children(&self, core: &mut ProcessCore) {
        let Some(children) = core.children.as_mut() else {
            return;
        };

        let parent_pid = self.pids.current().await;
        children.refresh(self.name(), parent_pid, self.metrics.as_ref());

        let stopper = ChildStopper {
            actions: self.actions.clone(),
            signals: self.definition.stop.signals.clone(),
            timeout: self.definition.stop.timeout,
            ctx: self.probe_context(0),
        };
        children.tick(&stopper, Instant::now()).await;
        self.set_child_pids(children.pids());
    }

    fn set_child_pids(&self, pids: Vec<u32>) {
        let count = pids.len();
        *self.child_pids.lock().unwrap_or_else(|e| e.into_inner()) = pids;
        self.update_mirror(|m| m.children = count);
    }

    // ========================================================================
    // Reporting and teardown
    // ========================================================================

    pub async fn status(&self) -> ProcessStatus {
        let mirror = self.mirror();
        let pid = match mirror.state {
            ProcessState::Unmonitored => self.pids.cached(),
            _ => self.pids.current().await,
        };
        let (cpu_percent, memory_kb) = if pid != 0 {
            (self.metrics.cpu_usage(pid), self.metrics.memory_usage(pid))
        } else {
            (None, None)
        };
        let children = if mirror.children > 0 {
            self.child_pids.lock().unwrap_or_else(|e| e.into_inner()).clone()
        } else {
            Vec::new()
        };

        ProcessStatus {
            name: self.definition.name.clone(),
            group: self.definition.group.clone(),
            state: mirror.state,
            pid,
            autostart: mirror.autostart,
            since: mirror
                .since
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
            cpu_percent,
            memory_kb,
            children,
        }
    }

    /// Cancel scheduled events and any action in flight. The process itself
    /// is left running.
    pub async fn shutdown(&self) {
        let mut core = self.core.lock().await;
        for trigger in core.triggers.iter_mut() {
            trigger.reset();
        }
        if let Some(children) = core.children.as_mut() {
            children.abort_stops();
        }
        drop(core);

        if let Some(action) = self.action.lock().unwrap_or_else(|e| e.into_inner()).take() {
            action.token.cancel();
        }
        self.skip.clear();
        debug!(process = %self.name(), "Supervision stopped");
    }
}
