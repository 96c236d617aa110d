//! Fires when a transition's (from, to) pair matches configured state sets

use std::time::Duration;

use super::triggers::{ScheduledEvent, Trigger, TriggerResponse};
use crate::domain::{ProcessSnapshot, ProcessState, Transition, TransitionAction};

pub struct TransitionTrigger {
    from: Vec<ProcessState>,
    to: Vec<ProcessState>,
    action: TransitionAction,
}

impl TransitionTrigger {
    /// An empty set matches any state
    pub fn new(from: Vec<ProcessState>, to: Vec<ProcessState>, action: TransitionAction) -> Self {
        Self { from, to, action }
    }

    fn matches(&self, transition: &Transition) -> bool {
        (self.from.is_empty() || self.from.contains(&transition.from))
            && (self.to.is_empty() || self.to.contains(&transition.to))
    }
}

impl Trigger for TransitionTrigger {
    fn name(&self) -> &str {
        "transition"
    }

    fn notify(&mut self, transition: &Transition, process: &ProcessSnapshot) -> TriggerResponse {
        if !self.matches(transition) {
            return TriggerResponse::ignore();
        }

        // Events go through the scheduler: the dispatch lock is held here.
        let event = match &self.action {
            TransitionAction::Dispatch(event) => Some(*event),
            TransitionAction::Callback(callback) => callback(process, transition),
        };

        TriggerResponse {
            veto: false,
            schedule: event
                .map(|event| ScheduledEvent {
                    event,
                    delay: Duration::ZERO,
                })
                .into_iter()
                .collect(),
        }
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Event;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn snapshot() -> ProcessSnapshot {
        ProcessSnapshot {
            name: "web".to_string(),
            pid: 12,
            state: ProcessState::Running,
        }
    }

    #[test]
    fn test_dispatch_on_match_only() {
        let mut trigger = TransitionTrigger::new(
            vec![ProcessState::Running],
            vec![ProcessState::Stopped],
            TransitionAction::Dispatch(Event::Start),
        );

        let hit = Transition::new(Event::Tick, ProcessState::Running, ProcessState::Stopped);
        let response = trigger.notify(&hit, &snapshot());
        assert!(!response.veto);
        assert_eq!(response.schedule.len(), 1);
        assert_eq!(response.schedule[0].event, Event::Start);

        let miss = Transition::new(Event::Tick, ProcessState::Starting, ProcessState::Stopped);
        assert_eq!(trigger.notify(&miss, &snapshot()), TriggerResponse::ignore());
    }

    #[test]
    fn test_callback_runs_exactly_on_match() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let mut trigger = TransitionTrigger::new(
            vec![],
            vec![ProcessState::Stopped],
            TransitionAction::Callback(Arc::new(move |process, transition| {
                assert_eq!(process.name, "web");
                assert_eq!(transition.to, ProcessState::Stopped);
                seen.fetch_add(1, Ordering::SeqCst);
                None
            })),
        );

        let hit = Transition::new(Event::Stop, ProcessState::Stopping, ProcessState::Stopped);
        assert_eq!(trigger.notify(&hit, &snapshot()), TriggerResponse::ignore());
        let miss = Transition::new(Event::Start, ProcessState::Stopped, ProcessState::Starting);
        trigger.notify(&miss, &snapshot());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
