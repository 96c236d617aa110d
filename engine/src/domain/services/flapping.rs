//! Flap detection
//! Counts entries into `starting`/`restarting`; too many inside `within`
//! parks the process in `unmonitored` and optionally retries later.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::warn;

use super::triggers::{ScheduledEvent, Trigger, TriggerResponse};
use crate::domain::{Event, ProcessSnapshot, ProcessState, Transition};

pub struct FlappingTrigger {
    times: usize,
    within: Duration,
    retry_after: Duration,
    /// 0 means unlimited
    retries: u32,
    retried: u32,
    timeline: VecDeque<Instant>,
}

impl FlappingTrigger {
    pub fn new(times: usize, within: Duration, retry_after: Duration, retries: u32) -> Self {
        let times = times.max(1);
        Self {
            times,
            within,
            retry_after,
            retries,
            retried: 0,
            timeline: VecDeque::with_capacity(times),
        }
    }

    pub fn timeline_len(&self) -> usize {
        self.timeline.len()
    }

    fn retries_remain(&self) -> bool {
        self.retries == 0 || self.retried < self.retries
    }

    fn is_flapping(&self) -> bool {
        match (self.timeline.front(), self.timeline.back()) {
            (Some(first), Some(last)) if self.timeline.len() == self.times => {
                last.saturating_duration_since(*first) <= self.within
            }
            _ => false,
        }
    }
}

impl Trigger for FlappingTrigger {
    fn name(&self) -> &str {
        "flapping"
    }

    fn notify(&mut self, transition: &Transition, process: &ProcessSnapshot) -> TriggerResponse {
        if !matches!(transition.to, ProcessState::Starting | ProcessState::Restarting) {
            return TriggerResponse::ignore();
        }

        if self.timeline.len() == self.times {
            self.timeline.pop_front();
        }
        self.timeline.push_back(transition.at);

        if !self.is_flapping() {
            return TriggerResponse::ignore();
        }

        let mut schedule = vec![ScheduledEvent {
            event: Event::Unmonitor,
            delay: Duration::ZERO,
        }];
        let retry = !self.retry_after.is_zero() && self.retries_remain();
        if retry {
            self.retried += 1;
            schedule.push(ScheduledEvent {
                event: Event::Start,
                delay: self.retry_after,
            });
        }

        warn!(
            process = %process.name,
            times = self.times,
            within_secs = self.within.as_secs_f64(),
            retry,
            retry_after_secs = self.retry_after.as_secs(),
            "Flapping detected"
        );

        self.timeline.clear();
        TriggerResponse {
            veto: true,
            schedule,
        }
    }

    fn reset(&mut self) {
        self.timeline.clear();
        self.retried = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> ProcessSnapshot {
        ProcessSnapshot {
            name: "web".to_string(),
            pid: 0,
            state: ProcessState::Stopped,
        }
    }

    fn starting_at(at: Instant) -> Transition {
        Transition {
            event: Event::Tick,
            from: ProcessState::Stopped,
            to: ProcessState::Starting,
            at,
        }
    }

    #[test]
    fn test_three_starts_within_window_flap() {
        let mut trigger =
            FlappingTrigger::new(3, Duration::from_secs(10), Duration::from_secs(5), 0);
        let t0 = Instant::now();

        assert_eq!(trigger.notify(&starting_at(t0), &snapshot()), TriggerResponse::ignore());
        assert_eq!(
            trigger.notify(&starting_at(t0 + Duration::from_secs(4)), &snapshot()),
            TriggerResponse::ignore()
        );
        let response = trigger.notify(&starting_at(t0 + Duration::from_secs(9)), &snapshot());

        assert!(response.veto);
        assert_eq!(
            response.schedule,
            vec![
                ScheduledEvent {
                    event: Event::Unmonitor,
                    delay: Duration::ZERO
                },
                ScheduledEvent {
                    event: Event::Start,
                    delay: Duration::from_secs(5)
                },
            ]
        );
        assert_eq!(trigger.timeline_len(), 0);
    }

    #[test]
    fn test_spread_out_starts_do_not_flap() {
        let mut trigger =
            FlappingTrigger::new(3, Duration::from_secs(10), Duration::from_secs(5), 0);
        let t0 = Instant::now();
        for i in 0..6 {
            let response =
                trigger.notify(&starting_at(t0 + Duration::from_secs(6 * i)), &snapshot());
            assert!(!response.veto);
        }
        assert_eq!(trigger.timeline_len(), 3);
    }

    #[test]
    fn test_other_transitions_ignored() {
        let mut trigger = FlappingTrigger::new(1, Duration::from_secs(10), Duration::ZERO, 0);
        let t = Transition::new(Event::Tick, ProcessState::Starting, ProcessState::Running);
        assert_eq!(trigger.notify(&t, &snapshot()), TriggerResponse::ignore());
        assert_eq!(trigger.timeline_len(), 0);
    }

    #[test]
    fn test_retry_after_zero_never_retries() {
        let mut trigger = FlappingTrigger::new(1, Duration::from_secs(1), Duration::ZERO, 0);
        let response = trigger.notify(&starting_at(Instant::now()), &snapshot());
        assert!(response.veto);
        assert_eq!(response.schedule.len(), 1);
        assert_eq!(response.schedule[0].event, Event::Unmonitor);
    }

    #[test]
    fn test_retries_are_bounded_until_reset() {
        let mut trigger =
            FlappingTrigger::new(1, Duration::from_secs(1), Duration::from_secs(2), 2);
        let t0 = Instant::now();
        let starts = |r: &TriggerResponse| r.schedule.iter().filter(|s| s.event == Event::Start).count();

        assert_eq!(starts(&trigger.notify(&starting_at(t0), &snapshot())), 1);
        assert_eq!(starts(&trigger.notify(&starting_at(t0), &snapshot())), 1);
        let exhausted = trigger.notify(&starting_at(t0), &snapshot());
        assert!(exhausted.veto);
        assert_eq!(starts(&exhausted), 0);

        trigger.reset();
        assert_eq!(starts(&trigger.notify(&starting_at(t0), &snapshot())), 1);
    }
}
