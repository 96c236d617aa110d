//! Managed process definition
//!
//! The validated, immutable attribute set a managed process is supervised with.
//! Definitions are produced by `ProcessDefinitionBuilder`, which enumerates every
//! recognised option; loaders translate their own formats into builder calls.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::constants::{
    DEFAULT_FLAPPING_RETRY_AFTER_SEC, DEFAULT_FLAPPING_TIMES, DEFAULT_FLAPPING_WITHIN_SEC,
    DEFAULT_RESTART_TIMEOUT_SEC, DEFAULT_START_TIMEOUT_SEC, DEFAULT_STOP_TIMEOUT_SEC,
};
use crate::domain::ports::ExecOptions;
use crate::domain::services::conditions::Condition;
use crate::domain::{
    BreachRule, DomainError, Event, ProcessSignal, ProcessState, StdinSource, Transition,
};

/// Read-only view of a process handed to user callbacks
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSnapshot {
    pub name: String,
    pub pid: u32,
    pub state: ProcessState,
}

pub type ConditionCallback = Arc<dyn Fn(&ProcessSnapshot) -> Vec<Event> + Send + Sync>;
pub type TransitionCallback = Arc<dyn Fn(&ProcessSnapshot, &Transition) -> Option<Event> + Send + Sync>;

/// One start/stop/restart action
#[derive(Debug, Clone, PartialEq)]
pub struct ActionSpec {
    pub before: Option<String>,
    pub command: Option<String>,
    pub after: Option<String>,
    /// Escalation sequence used when no command is set
    pub signals: Vec<ProcessSignal>,
    pub timeout: Duration,
    /// Merged over the process environment
    pub env: HashMap<String, String>,
}

impl ActionSpec {
    pub fn with_timeout(timeout_sec: u64, signals: Vec<ProcessSignal>) -> Self {
        Self {
            before: None,
            command: None,
            after: None,
            signals,
            timeout: Duration::from_secs(timeout_sec),
            env: HashMap::new(),
        }
    }
}

/// What a breached condition asks for
#[derive(Clone)]
pub enum ConditionAction {
    Events(Vec<Event>),
    Callback(ConditionCallback),
}

impl Default for ConditionAction {
    fn default() -> Self {
        ConditionAction::Events(vec![Event::Restart])
    }
}

impl fmt::Debug for ConditionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionAction::Events(events) => f.debug_tuple("Events").field(events).finish(),
            ConditionAction::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// A condition together with its schedule and breach rule
#[derive(Clone)]
pub struct ConditionSpec {
    pub condition: Arc<dyn Condition>,
    pub every: Duration,
    pub rule: BreachRule,
    pub action: ConditionAction,
}

impl ConditionSpec {
    pub fn new(condition: Arc<dyn Condition>) -> Self {
        Self {
            condition,
            every: Duration::ZERO,
            rule: BreachRule::default(),
            action: ConditionAction::default(),
        }
    }

    pub fn every(mut self, every: Duration) -> Self {
        self.every = every;
        self
    }

    pub fn rule(mut self, rule: BreachRule) -> Self {
        self.rule = rule;
        self
    }

    pub fn action(mut self, action: ConditionAction) -> Self {
        self.action = action;
        self
    }
}

impl fmt::Debug for ConditionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionSpec")
            .field("condition", &self.condition.name())
            .field("every", &self.every)
            .field("rule", &self.rule)
            .field("action", &self.action)
            .finish()
    }
}

/// What a transition trigger does on a match
#[derive(Clone)]
pub enum TransitionAction {
    Dispatch(Event),
    Callback(TransitionCallback),
}

impl fmt::Debug for TransitionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionAction::Dispatch(event) => f.debug_tuple("Dispatch").field(event).finish(),
            TransitionAction::Callback(_) => f.write_str("Callback"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TriggerSpec {
    Flapping {
        times: usize,
        within: Duration,
        retry_after: Duration,
        /// 0 means unlimited
        retries: u32,
    },
    Transition {
        from: Vec<ProcessState>,
        to: Vec<ProcessState>,
        action: TransitionAction,
    },
}

impl TriggerSpec {
    pub fn flapping() -> Self {
        TriggerSpec::Flapping {
            times: DEFAULT_FLAPPING_TIMES,
            within: Duration::from_secs(DEFAULT_FLAPPING_WITHIN_SEC),
            retry_after: Duration::from_secs(DEFAULT_FLAPPING_RETRY_AFTER_SEC),
            retries: 0,
        }
    }
}

/// Policy for discovered OS children of a running process
#[derive(Debug, Clone, Default)]
pub struct ChildPolicy {
    pub conditions: Vec<ConditionSpec>,
    /// Run instead of signalling; `{{PID}}` is replaced with the child pid
    pub stop_command: Option<String>,
}

/// Validated attributes of one managed process
#[derive(Debug, Clone)]
pub struct ProcessDefinition {
    pub name: String,
    pub group: Option<String>,
    pub autostart: bool,
    pub daemonize: bool,
    pub start: ActionSpec,
    pub stop: ActionSpec,
    pub restart: ActionSpec,
    pub stdin: Option<StdinSource>,
    pub ping_command: Option<String>,
    pub pid_command: Option<String>,
    pub pidfile: Option<String>,
    pub logfile: Option<String>,
    pub errfile: Option<String>,
    pub env: HashMap<String, String>,
    pub chdir: Option<String>,
    pub chroot: Option<String>,
    pub umask: Option<u32>,
    pub uid: Option<String>,
    pub gid: Option<String>,
    pub groups: Vec<String>,
    pub conditions: Vec<ConditionSpec>,
    pub triggers: Vec<TriggerSpec>,
    pub children: Option<ChildPolicy>,
}

impl ProcessDefinition {
    pub fn builder(name: impl Into<String>) -> ProcessDefinitionBuilder {
        ProcessDefinitionBuilder::new(name)
    }

    pub fn action(&self, event: Event) -> Option<&ActionSpec> {
        match event {
            Event::Start => Some(&self.start),
            Event::Stop => Some(&self.stop),
            Event::Restart => Some(&self.restart),
            _ => None,
        }
    }

    /// Environment, privileges and output files shared by every command
    /// run on behalf of this process. Foreground by default.
    pub fn exec_options(&self) -> ExecOptions {
        ExecOptions {
            name: self.name.clone(),
            env: self.env.clone(),
            cwd: self.chdir.clone(),
            uid: self.uid.clone(),
            gid: self.gid.clone(),
            groups: self.groups.clone(),
            chroot: self.chroot.clone(),
            umask: self.umask,
            stdin: None,
            daemonize: false,
            logfile: self.logfile.clone(),
            errfile: self.errfile.clone().or_else(|| self.logfile.clone()),
            timeout: None,
        }
    }
}

/// Builder enumerating every recognised process option
#[derive(Debug, Clone)]
pub struct ProcessDefinitionBuilder {
    definition: ProcessDefinition,
}

impl ProcessDefinitionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let signals = ProcessSignal::default_escalation();
        Self {
            definition: ProcessDefinition {
                name: name.into(),
                group: None,
                autostart: true,
                daemonize: true,
                start: ActionSpec::with_timeout(DEFAULT_START_TIMEOUT_SEC, Vec::new()),
                stop: ActionSpec::with_timeout(DEFAULT_STOP_TIMEOUT_SEC, signals.clone()),
                restart: ActionSpec::with_timeout(DEFAULT_RESTART_TIMEOUT_SEC, signals),
                stdin: None,
                ping_command: None,
                pid_command: None,
                pidfile: None,
                logfile: None,
                errfile: None,
                env: HashMap::new(),
                chdir: None,
                chroot: None,
                umask: None,
                uid: None,
                gid: None,
                groups: Vec::new(),
                conditions: Vec::new(),
                triggers: Vec::new(),
                children: None,
            },
        }
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.definition.group = Some(group.into());
        self
    }

    pub fn autostart(mut self, autostart: bool) -> Self {
        self.definition.autostart = autostart;
        self
    }

    pub fn daemonize(mut self, daemonize: bool) -> Self {
        self.definition.daemonize = daemonize;
        self
    }

    pub fn start(mut self, action: ActionSpec) -> Self {
        self.definition.start = action;
        self
    }

    pub fn stop(mut self, action: ActionSpec) -> Self {
        self.definition.stop = action;
        self
    }

    pub fn restart(mut self, action: ActionSpec) -> Self {
        self.definition.restart = action;
        self
    }

    pub fn start_command(mut self, command: impl Into<String>) -> Self {
        self.definition.start.command = Some(command.into());
        self
    }

    pub fn stop_command(mut self, command: impl Into<String>) -> Self {
        self.definition.stop.command = Some(command.into());
        self
    }

    pub fn restart_command(mut self, command: impl Into<String>) -> Self {
        self.definition.restart.command = Some(command.into());
        self
    }

    pub fn stdin(mut self, stdin: StdinSource) -> Self {
        self.definition.stdin = Some(stdin);
        self
    }

    pub fn ping_command(mut self, command: impl Into<String>) -> Self {
        self.definition.ping_command = Some(command.into());
        self
    }

    pub fn pid_command(mut self, command: impl Into<String>) -> Self {
        self.definition.pid_command = Some(command.into());
        self
    }

    pub fn pidfile(mut self, path: impl Into<String>) -> Self {
        self.definition.pidfile = Some(path.into());
        self
    }

    pub fn logfile(mut self, path: impl Into<String>) -> Self {
        self.definition.logfile = Some(path.into());
        self
    }

    pub fn errfile(mut self, path: impl Into<String>) -> Self {
        self.definition.errfile = Some(path.into());
        self
    }

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.definition.env = env;
        self
    }

    pub fn chdir(mut self, dir: impl Into<String>) -> Self {
        self.definition.chdir = Some(dir.into());
        self
    }

    pub fn chroot(mut self, dir: impl Into<String>) -> Self {
        self.definition.chroot = Some(dir.into());
        self
    }

    pub fn umask(mut self, umask: u32) -> Self {
        self.definition.umask = Some(umask);
        self
    }

    pub fn uid(mut self, uid: impl Into<String>) -> Self {
        self.definition.uid = Some(uid.into());
        self
    }

    pub fn gid(mut self, gid: impl Into<String>) -> Self {
        self.definition.gid = Some(gid.into());
        self
    }

    pub fn groups(mut self, groups: Vec<String>) -> Self {
        self.definition.groups = groups;
        self
    }

    pub fn condition(mut self, condition: ConditionSpec) -> Self {
        self.definition.conditions.push(condition);
        self
    }

    pub fn trigger(mut self, trigger: TriggerSpec) -> Self {
        self.definition.triggers.push(trigger);
        self
    }

    pub fn monitor_children(mut self, policy: ChildPolicy) -> Self {
        self.definition.children = Some(policy);
        self
    }

    pub fn build(self) -> Result<ProcessDefinition, DomainError> {
        let definition = self.definition;

        if definition.name.trim().is_empty() {
            return Err(DomainError::InvalidName(
                "process name must not be empty".to_string(),
            ));
        }
        if definition.name.contains('/') {
            return Err(DomainError::InvalidName(format!(
                "'{}' must not contain '/'",
                definition.name
            )));
        }

        for (event, action) in [
            (Event::Start, &definition.start),
            (Event::Stop, &definition.stop),
            (Event::Restart, &definition.restart),
        ] {
            if action.timeout.is_zero() {
                return Err(DomainError::InvalidConfiguration(format!(
                    "{}: {}_timeout must be positive",
                    definition.name, event
                )));
            }
        }

        for trigger in &definition.triggers {
            if let TriggerSpec::Flapping { times, .. } = trigger {
                if *times == 0 {
                    return Err(DomainError::InvalidConfiguration(format!(
                        "{}: flapping times must be positive",
                        definition.name
                    )));
                }
            }
        }

        if let Some(umask) = definition.umask {
            if umask > 0o777 {
                return Err(DomainError::InvalidConfiguration(format!(
                    "{}: umask {:o} out of range",
                    definition.name, umask
                )));
            }
        }

        Ok(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::services::conditions::AlwaysTrue;

    #[test]
    fn test_defaults() {
        let def = ProcessDefinition::builder("web").build().unwrap();
        assert!(def.autostart);
        assert!(def.daemonize);
        assert_eq!(def.start.timeout, Duration::from_secs(DEFAULT_START_TIMEOUT_SEC));
        assert!(def.start.signals.is_empty());
        assert_eq!(def.stop.signals, ProcessSignal::default_escalation());
        assert_eq!(def.restart.signals, ProcessSignal::default_escalation());
        assert!(def.conditions.is_empty());
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(matches!(
            ProcessDefinition::builder("  ").build(),
            Err(DomainError::InvalidName(_))
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut stop = ActionSpec::with_timeout(0, Vec::new());
        stop.command = Some("true".to_string());
        assert!(matches!(
            ProcessDefinition::builder("web").stop(stop).build(),
            Err(DomainError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_condition_defaults_to_restart() {
        let def = ProcessDefinition::builder("web")
            .condition(ConditionSpec::new(Arc::new(AlwaysTrue)))
            .build()
            .unwrap();
        match &def.conditions[0].action {
            ConditionAction::Events(events) => assert_eq!(events, &vec![Event::Restart]),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_action_lookup() {
        let def = ProcessDefinition::builder("web")
            .start_command("run")
            .build()
            .unwrap();
        assert_eq!(
            def.action(Event::Start).and_then(|a| a.command.as_deref()),
            Some("run")
        );
        assert!(def.action(Event::Monitor).is_none());
    }
}
