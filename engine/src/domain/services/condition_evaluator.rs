//! Condition Evaluator
//! Wraps a condition with its sampling schedule, a bounded outcome history and
//! the breach rule deciding when the configured action fires.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::domain::services::conditions::{Condition, ProbeContext};
use crate::domain::{ConditionAction, ConditionSpec};

/// One recorded sample
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub value: String,
    pub critical: bool,
}

pub struct ConditionEvaluator {
    spec: ConditionSpec,
    history: VecDeque<Sample>,
    last_ran_at: Option<Instant>,
}

impl ConditionEvaluator {
    pub fn new(spec: ConditionSpec) -> Self {
        let capacity = spec.rule.window();
        Self {
            spec,
            history: VecDeque::with_capacity(capacity),
            last_ran_at: None,
        }
    }

    pub fn name(&self) -> &str {
        self.spec.condition.name()
    }

    pub fn condition(&self) -> Arc<dyn Condition> {
        Arc::clone(&self.spec.condition)
    }

    /// True when at least `every` has elapsed since the last sample.
    /// Marks the evaluator as ran at `now` when due.
    pub fn claim_run(&mut self, now: Instant) -> bool {
        let due = match self.last_ran_at {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.spec.every,
        };
        if due {
            self.last_ran_at = Some(now);
        }
        due
    }

    /// Record a sampled value and return the action when the breach rule is met
    pub fn record(&mut self, value: f64) -> Option<ConditionAction> {
        let condition = &self.spec.condition;
        let sample = Sample {
            value: condition.format_value(value),
            critical: condition.is_critical(value),
        };

        if self.history.len() == self.spec.rule.window() {
            self.history.pop_front();
        }
        self.history.push_back(sample);

        if self.critical_count() >= self.spec.rule.required() {
            Some(self.spec.action.clone())
        } else {
            None
        }
    }

    pub fn critical_count(&self) -> usize {
        self.history.iter().filter(|s| s.critical).count()
    }

    pub fn history(&self) -> impl Iterator<Item = &Sample> {
        self.history.iter()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}

impl fmt::Display for ConditionEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data: Vec<String> = self
            .history
            .iter()
            .map(|s| format!("{}{}", s.value, if s.critical { "" } else { "*" }))
            .collect();
        write!(f, "{}: [{}]", self.name(), data.join(", "))
    }
}

/// Probe every due evaluator concurrently, join all probes, then record the
/// samples in evaluator order. A failed or panicked probe is logged and its
/// sample is treated as absent. Returns the actions of breached conditions,
/// tagged with the condition name, in evaluator order.
pub async fn run_due(
    evaluators: &mut [ConditionEvaluator],
    ctx: &ProbeContext,
    now: Instant,
    process: &str,
) -> Vec<(String, ConditionAction)> {
    let mut probes = JoinSet::new();
    for (index, evaluator) in evaluators.iter_mut().enumerate() {
        if !evaluator.claim_run(now) {
            continue;
        }
        let condition = evaluator.condition();
        let ctx = ctx.clone();
        probes.spawn(async move { (index, condition.sample(&ctx).await) });
    }

    let mut samples = Vec::new();
    while let Some(joined) = probes.join_next().await {
        match joined {
            Ok((index, Ok(value))) => samples.push((index, value)),
            Ok((index, Err(e))) => warn!(
                process = %process,
                condition = evaluators[index].name(),
                error = %e,
                "Condition probe failed"
            ),
            Err(e) => warn!(process = %process, error = %e, "Condition probe panicked"),
        }
    }
    samples.sort_by_key(|(index, _)| *index);

    let mut actions = Vec::new();
    for (index, value) in samples {
        let evaluator = &mut evaluators[index];
        if let Some(action) = evaluator.record(value) {
            debug!(process = %process, history = %evaluator, "Condition breached");
            actions.push((evaluator.name().to_string(), action));
        }
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::services::conditions::CpuUsage;
    use crate::domain::{BreachRule, DomainError, Event};
    use std::time::Duration;

    fn evaluator(times: usize, window: usize) -> ConditionEvaluator {
        ConditionEvaluator::new(
            ConditionSpec::new(Arc::new(CpuUsage { above: 50.0 }))
                .rule(BreachRule::new(times, window).unwrap()),
        )
    }

    fn fired_at(times: usize, window: usize, samples: &[f64]) -> Vec<usize> {
        let mut eval = evaluator(times, window);
        samples
            .iter()
            .enumerate()
            .filter_map(|(i, v)| eval.record(*v).map(|_| i))
            .collect()
    }

    /// Reference: count of critical samples among the last `window` reaches `times`
    fn expected(times: usize, window: usize, samples: &[f64]) -> Vec<usize> {
        (0..samples.len())
            .filter(|&i| {
                let start = (i + 1).saturating_sub(window);
                samples[start..=i].iter().filter(|v| **v > 50.0).count() >= times
            })
            .collect()
    }

    #[test]
    fn test_fires_when_count_first_reaches_k() {
        let samples = [60.0, 10.0, 70.0, 80.0, 10.0, 10.0, 10.0, 90.0];
        let fired = fired_at(3, 5, &samples);
        assert_eq!(fired.first(), Some(&3));
        assert_eq!(fired, expected(3, 5, &samples));
    }

    #[test]
    fn test_matches_sliding_window_reference() {
        let patterns: [&[f64]; 4] = [
            &[99.0, 99.0, 1.0, 99.0, 1.0, 1.0, 99.0, 99.0, 99.0],
            &[1.0, 1.0, 1.0, 1.0],
            &[99.0; 6],
            &[1.0, 99.0, 1.0, 99.0, 1.0, 99.0, 1.0, 99.0],
        ];
        for samples in patterns {
            for (k, w) in [(1, 1), (2, 3), (3, 3), (2, 5), (4, 4)] {
                assert_eq!(
                    fired_at(k, w, samples),
                    expected(k, w, samples),
                    "k={} w={} samples={:?}",
                    k,
                    w,
                    samples
                );
            }
        }
    }

    #[test]
    fn test_half_full_buffer_can_fire() {
        assert_eq!(fired_at(2, 10, &[99.0, 99.0]), vec![1]);
    }

    #[test]
    fn test_history_bounded_by_window() {
        let mut eval = evaluator(3, 3);
        for _ in 0..10 {
            eval.record(10.0);
        }
        assert_eq!(eval.history().count(), 3);
        eval.clear_history();
        assert_eq!(eval.history().count(), 0);
    }

    #[test]
    fn test_default_action_is_restart() {
        let mut eval = evaluator(1, 1);
        match eval.record(99.0) {
            Some(ConditionAction::Events(events)) => assert_eq!(events, vec![Event::Restart]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_every_schedule() {
        let mut eval = ConditionEvaluator::new(
            ConditionSpec::new(Arc::new(CpuUsage { above: 50.0 })).every(Duration::from_secs(5)),
        );
        let t0 = Instant::now();
        assert!(eval.claim_run(t0));
        assert!(!eval.claim_run(t0 + Duration::from_secs(4)));
        assert!(eval.claim_run(t0 + Duration::from_secs(5)));
        assert!(!eval.claim_run(t0 + Duration::from_secs(6)));
    }

    #[tokio::test]
    async fn test_run_due_isolates_failing_probe() {
        use crate::domain::ports::ExecOptions;
        use crate::domain::services::conditions::{AlwaysTrue, MemoryUsage};
        use crate::testing::{MockExecutor, MockMetrics};

        let metrics = MockMetrics::new();
        metrics.set_process(10, 1, 90.0, 64);
        let ctx = ProbeContext {
            pid: 10,
            metrics: Arc::new(metrics),
            executor: Arc::new(MockExecutor::new()),
            exec: ExecOptions::default(),
        };

        struct Broken;
        #[async_trait::async_trait]
        impl Condition for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            async fn sample(&self, _ctx: &ProbeContext) -> Result<f64, DomainError> {
                Err(DomainError::ProbeFailed("boom".to_string()))
            }
            fn is_critical(&self, _value: f64) -> bool {
                true
            }
        }

        let mut evaluators = vec![
            ConditionEvaluator::new(ConditionSpec::new(Arc::new(Broken))),
            ConditionEvaluator::new(ConditionSpec::new(Arc::new(CpuUsage { above: 50.0 }))),
            ConditionEvaluator::new(ConditionSpec::new(Arc::new(MemoryUsage { above_bytes: 1 << 30 }))),
            ConditionEvaluator::new(
                ConditionSpec::new(Arc::new(AlwaysTrue)).action(ConditionAction::Events(vec![Event::Stop])),
            ),
        ];

        let actions = run_due(&mut evaluators, &ctx, Instant::now(), "web").await;
        let names: Vec<&str> = actions.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["cpu_usage", "always_true"]);
        assert_eq!(evaluators[0].history().count(), 0);
        assert_eq!(evaluators[2].history().count(), 1);
    }

    #[test]
    fn test_display_marks_non_critical() {
        let mut eval = evaluator(2, 2);
        eval.record(60.0);
        eval.record(10.0);
        assert_eq!(eval.to_string(), "cpu_usage: [60%, 10%*]");
    }
}
