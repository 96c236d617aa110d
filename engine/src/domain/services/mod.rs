pub mod action_executor;
pub mod children;
pub mod condition_evaluator;
pub mod conditions;
pub mod flapping;
pub mod pid_tracker;
pub mod tick_skip;
pub mod transition_trigger;
pub mod triggers;

pub use action_executor::{ActionExecutor, ActionOutcome, ActionPlan};
pub use children::{ChildProcess, ChildStopper, Children};
pub use condition_evaluator::{run_due, ConditionEvaluator, Sample};
pub use conditions::{AlwaysTrue, Condition, CpuUsage, ExecProbe, MemoryUsage, ProbeContext};
pub use flapping::FlappingTrigger;
pub use pid_tracker::PidTracker;
pub use tick_skip::TickSkip;
pub use transition_trigger::TransitionTrigger;
pub use triggers::{
    build_trigger, EventScheduler, ScheduledEvent, Trigger, TriggerDelegate, TriggerResponse,
};
