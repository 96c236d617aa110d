//! Transition-driven triggers
//!
//! Triggers are notified of every attempted transition before it is applied.
//! A trigger may veto the transition and may ask for events to be dispatched
//! later; those are armed on the owning delegate's scheduler as cancellable
//! tasks, so `reset` can cancel every pending event at once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::{Event, ProcessSnapshot, Transition, TriggerSpec};

use super::flapping::FlappingTrigger;
use super::transition_trigger::TransitionTrigger;

/// An event to dispatch after `delay`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledEvent {
    pub event: Event,
    pub delay: Duration,
}

/// A trigger's answer to a notification
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerResponse {
    pub veto: bool,
    pub schedule: Vec<ScheduledEvent>,
}

impl TriggerResponse {
    pub fn ignore() -> Self {
        Self::default()
    }
}

pub trait Trigger: Send {
    fn name(&self) -> &str;

    fn notify(&mut self, transition: &Transition, process: &ProcessSnapshot) -> TriggerResponse;

    /// Drop all retained state
    fn reset(&mut self);
}

pub fn build_trigger(spec: &TriggerSpec) -> Box<dyn Trigger> {
    match spec {
        TriggerSpec::Flapping {
            times,
            within,
            retry_after,
            retries,
        } => Box::new(FlappingTrigger::new(*times, *within, *retry_after, *retries)),
        TriggerSpec::Transition { from, to, action } => {
            Box::new(TransitionTrigger::new(from.clone(), to.clone(), action.clone()))
        }
    }
}

/// Cancellable delayed events, keyed by id
#[derive(Default)]
pub struct EventScheduler {
    pending: Arc<Mutex<HashMap<u64, CancellationToken>>>,
    next_id: AtomicU64,
}

impl EventScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `event` to be handed to `dispatch` after `delay`.
    /// The event leaves the pending set right before it is dispatched.
    pub fn schedule<F, Fut>(&self, scheduled: ScheduledEvent, dispatch: F)
    where
        F: FnOnce(Event) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, token.clone());

        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(event = %scheduled.event, "Scheduled event cancelled");
                }
                _ = tokio::time::sleep(scheduled.delay) => {
                    pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                    dispatch(scheduled.event).await;
                }
            }
        });
    }

    pub fn cancel_all(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for (_, token) in pending.drain() {
            token.cancel();
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// A trigger plus the scheduled events it owns
pub struct TriggerDelegate {
    trigger: Box<dyn Trigger>,
    scheduler: EventScheduler,
}

impl TriggerDelegate {
    pub fn new(trigger: Box<dyn Trigger>) -> Self {
        Self {
            trigger,
            scheduler: EventScheduler::new(),
        }
    }

    pub fn from_spec(spec: &TriggerSpec) -> Self {
        Self::new(build_trigger(spec))
    }

    pub fn name(&self) -> &str {
        self.trigger.name()
    }

    /// Notify the trigger and arm whatever it schedules. Returns the veto flag.
    pub fn notify<F, Fut>(
        &mut self,
        transition: &Transition,
        process: &ProcessSnapshot,
        dispatch: F,
    ) -> bool
    where
        F: Fn(Event) -> Fut + Send + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let response = self.trigger.notify(transition, process);
        for scheduled in response.schedule {
            debug!(
                process = %process.name,
                trigger = self.trigger.name(),
                event = %scheduled.event,
                delay_ms = scheduled.delay.as_millis() as u64,
                "Scheduling event"
            );
            self.scheduler.schedule(scheduled, dispatch.clone());
        }
        response.veto
    }

    pub fn reset(&mut self) {
        self.trigger.reset();
        self.scheduler.cancel_all();
    }

    pub fn pending_events(&self) -> usize {
        self.scheduler.pending()
    }
}

impl Drop for TriggerDelegate {
    fn drop(&mut self) {
        self.scheduler.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProcessState;
    use tokio::sync::mpsc;

    struct Scheduling(Vec<ScheduledEvent>, bool);

    impl Trigger for Scheduling {
        fn name(&self) -> &str {
            "scheduling"
        }

        fn notify(&mut self, _t: &Transition, _p: &ProcessSnapshot) -> TriggerResponse {
            TriggerResponse {
                veto: self.1,
                schedule: self.0.clone(),
            }
        }

        fn reset(&mut self) {}
    }

    fn snapshot() -> ProcessSnapshot {
        ProcessSnapshot {
            name: "web".to_string(),
            pid: 0,
            state: ProcessState::Stopped,
        }
    }

    #[tokio::test]
    async fn test_scheduled_event_fires_and_leaves_pending_set() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut delegate = TriggerDelegate::new(Box::new(Scheduling(
            vec![ScheduledEvent {
                event: Event::Start,
                delay: Duration::from_millis(20),
            }],
            true,
        )));

        let transition = Transition::new(Event::Tick, ProcessState::Stopped, ProcessState::Starting);
        let veto = delegate.notify(&transition, &snapshot(), move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
            }
        });

        assert!(veto);
        assert_eq!(delegate.pending_events(), 1);
        let fired = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(fired, Some(Event::Start));
        assert_eq!(delegate.pending_events(), 0);
    }

    #[tokio::test]
    async fn test_reset_cancels_pending_events() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let mut delegate = TriggerDelegate::new(Box::new(Scheduling(
            vec![ScheduledEvent {
                event: Event::Start,
                delay: Duration::from_millis(50),
            }],
            false,
        )));

        let transition = Transition::new(Event::Tick, ProcessState::Stopped, ProcessState::Starting);
        let dispatch = move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
            }
        };
        assert!(!delegate.notify(&transition, &snapshot(), dispatch));
        delegate.reset();
        assert_eq!(delegate.pending_events(), 0);

        let fired = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        // Either the timeout elapsed or the channel closed; nothing was sent
        assert!(!matches!(fired, Ok(Some(_))));
    }
}
