//! Process lifecycle states, events and the transition table

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use crate::domain::DomainError;

/// Lifecycle state of a managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Not supervised; ticks do nothing
    #[default]
    Unmonitored,
    /// Supervised and not running
    Stopped,
    /// Start action in flight
    Starting,
    /// Supervised and alive
    Running,
    /// Stop action in flight
    Stopping,
    /// Restart action in flight
    Restarting,
}

impl ProcessState {
    pub const ALL: [ProcessState; 6] = [
        ProcessState::Unmonitored,
        ProcessState::Stopped,
        ProcessState::Starting,
        ProcessState::Running,
        ProcessState::Stopping,
        ProcessState::Restarting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Unmonitored => "unmonitored",
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Restarting => "restarting",
        }
    }

    /// Autostart value forced when entering this state, if any
    pub fn autostart_on_entry(&self) -> Option<bool> {
        match self {
            ProcessState::Starting | ProcessState::Restarting => Some(true),
            ProcessState::Stopping | ProcessState::Unmonitored => Some(false),
            ProcessState::Stopped | ProcessState::Running => None,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProcessState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DomainError::InvalidConfiguration(format!("Unknown state '{}'", s)))
    }
}

/// Events driving the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    /// Periodic, guarded re-evaluation
    Tick,
    Monitor,
    Start,
    Stop,
    Restart,
    Unmonitor,
}

impl Event {
    /// Events a user may issue through the control channel
    pub const USER_COMMANDS: [Event; 5] = [
        Event::Monitor,
        Event::Unmonitor,
        Event::Start,
        Event::Stop,
        Event::Restart,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Tick => "tick",
            Event::Monitor => "monitor",
            Event::Start => "start",
            Event::Stop => "stop",
            Event::Restart => "restart",
            Event::Unmonitor => "unmonitor",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Event {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tick" => Ok(Event::Tick),
            "monitor" => Ok(Event::Monitor),
            "start" => Ok(Event::Start),
            "stop" => Ok(Event::Stop),
            "restart" => Ok(Event::Restart),
            "unmonitor" => Ok(Event::Unmonitor),
            other => Err(DomainError::UnknownCommand(other.to_string())),
        }
    }
}

/// Predicate an edge requires before it is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    Always,
    Running,
    NotRunning,
    AutostartAndNotRunning,
}

impl Guard {
    pub fn needs_liveness(&self) -> bool {
        !matches!(self, Guard::Always)
    }

    pub fn holds(&self, running: bool, autostart: bool) -> bool {
        match self {
            Guard::Always => true,
            Guard::Running => running,
            Guard::NotRunning => !running,
            Guard::AutostartAndNotRunning => autostart && !running,
        }
    }
}

/// Candidate destination of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub to: ProcessState,
    pub guard: Guard,
}

const fn edge(to: ProcessState, guard: Guard) -> Edge {
    Edge { to, guard }
}

const NONE: &[Edge] = &[];
const TICK_STOPPED: &[Edge] = &[
    edge(ProcessState::Running, Guard::Running),
    edge(ProcessState::Starting, Guard::AutostartAndNotRunning),
];
const TICK_SETTLING: &[Edge] = &[
    edge(ProcessState::Running, Guard::Running),
    edge(ProcessState::Stopped, Guard::NotRunning),
];
const TICK_RUNNING: &[Edge] = &[edge(ProcessState::Stopped, Guard::NotRunning)];
const TO_STOPPED: &[Edge] = &[edge(ProcessState::Stopped, Guard::Always)];
const TO_STARTING: &[Edge] = &[edge(ProcessState::Starting, Guard::Always)];
const TO_STOPPING: &[Edge] = &[edge(ProcessState::Stopping, Guard::Always)];
const TO_RESTARTING: &[Edge] = &[edge(ProcessState::Restarting, Guard::Always)];
const TO_UNMONITORED: &[Edge] = &[edge(ProcessState::Unmonitored, Guard::Always)];

/// Ordered candidate edges for `event` fired in state `from`.
/// The first edge whose guard holds is taken; an empty slice means the
/// event is ignored in that state.
pub fn edges(event: Event, from: ProcessState) -> &'static [Edge] {
    use ProcessState::*;

    match (event, from) {
        (Event::Tick, Unmonitored) => NONE,
        (Event::Tick, Stopped) => TICK_STOPPED,
        (Event::Tick, Starting | Stopping | Restarting) => TICK_SETTLING,
        (Event::Tick, Running) => TICK_RUNNING,

        (Event::Monitor, Unmonitored) => TO_STOPPED,
        (Event::Monitor, Stopped | Starting | Running | Stopping | Restarting) => NONE,

        (Event::Start, Unmonitored | Stopped) => TO_STARTING,
        (Event::Start, Starting | Running | Stopping | Restarting) => NONE,

        (Event::Stop, Running) => TO_STOPPING,
        (Event::Stop, Unmonitored | Stopped | Starting | Stopping | Restarting) => NONE,

        (Event::Restart, Running | Stopped) => TO_RESTARTING,
        (Event::Restart, Unmonitored | Starting | Stopping | Restarting) => NONE,

        (Event::Unmonitor, _) => TO_UNMONITORED,
    }
}

/// An attempted state change, as seen by triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub event: Event,
    pub from: ProcessState,
    pub to: ProcessState,
    pub at: Instant,
}

impl Transition {
    pub fn new(event: Event, from: ProcessState, to: ProcessState) -> Self {
        Self {
            event,
            from,
            to,
            at: Instant::now(),
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.from == self.to
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(event: Event, from: ProcessState, running: bool, autostart: bool) -> Option<ProcessState> {
        edges(event, from)
            .iter()
            .find(|e| e.guard.holds(running, autostart))
            .map(|e| e.to)
    }

    #[test]
    fn test_tick_transitions() {
        use ProcessState::*;
        assert_eq!(resolve(Event::Tick, Starting, true, false), Some(Running));
        assert_eq!(resolve(Event::Tick, Starting, false, false), Some(Stopped));
        assert_eq!(resolve(Event::Tick, Running, false, true), Some(Stopped));
        assert_eq!(resolve(Event::Tick, Running, true, true), None);
        assert_eq!(resolve(Event::Tick, Stopping, true, false), Some(Running));
        assert_eq!(resolve(Event::Tick, Stopping, false, false), Some(Stopped));
        assert_eq!(resolve(Event::Tick, Stopped, true, false), Some(Running));
        assert_eq!(resolve(Event::Tick, Stopped, false, true), Some(Starting));
        assert_eq!(resolve(Event::Tick, Stopped, false, false), None);
        assert_eq!(resolve(Event::Tick, Restarting, true, true), Some(Running));
        assert_eq!(resolve(Event::Tick, Restarting, false, true), Some(Stopped));
        assert_eq!(resolve(Event::Tick, Unmonitored, false, true), None);
    }

    #[test]
    fn test_user_events() {
        use ProcessState::*;
        assert_eq!(resolve(Event::Monitor, Unmonitored, false, false), Some(Stopped));
        assert_eq!(resolve(Event::Monitor, Running, true, false), None);
        assert_eq!(resolve(Event::Start, Unmonitored, false, false), Some(Starting));
        assert_eq!(resolve(Event::Start, Stopped, false, false), Some(Starting));
        assert_eq!(resolve(Event::Start, Running, true, false), None);
        assert_eq!(resolve(Event::Stop, Running, true, false), Some(Stopping));
        assert_eq!(resolve(Event::Stop, Stopping, true, false), None);
        assert_eq!(resolve(Event::Restart, Running, true, false), Some(Restarting));
        assert_eq!(resolve(Event::Restart, Stopped, false, false), Some(Restarting));
        assert_eq!(resolve(Event::Restart, Unmonitored, false, false), None);
        for state in ProcessState::ALL {
            assert_eq!(resolve(Event::Unmonitor, state, false, false), Some(Unmonitored));
        }
    }

    #[test]
    fn test_user_events_are_unguarded() {
        for event in Event::USER_COMMANDS {
            for state in ProcessState::ALL {
                assert!(edges(event, state).iter().all(|e| !e.guard.needs_liveness()));
            }
        }
    }

    #[test]
    fn test_autostart_on_entry() {
        assert_eq!(ProcessState::Starting.autostart_on_entry(), Some(true));
        assert_eq!(ProcessState::Restarting.autostart_on_entry(), Some(true));
        assert_eq!(ProcessState::Stopping.autostart_on_entry(), Some(false));
        assert_eq!(ProcessState::Unmonitored.autostart_on_entry(), Some(false));
        assert_eq!(ProcessState::Running.autostart_on_entry(), None);
    }

    #[test]
    fn test_display_and_parse() {
        for state in ProcessState::ALL {
            assert_eq!(state.to_string().parse::<ProcessState>().unwrap(), state);
        }
        assert_eq!("RESTART".parse::<Event>().unwrap(), Event::Restart);
        assert!(matches!(
            "bounce".parse::<Event>(),
            Err(DomainError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_loopback() {
        let t = Transition::new(Event::Unmonitor, ProcessState::Unmonitored, ProcessState::Unmonitored);
        assert!(t.is_loopback());
        let t = Transition::new(Event::Tick, ProcessState::Stopped, ProcessState::Starting);
        assert!(!t.is_loopback());
    }
}
