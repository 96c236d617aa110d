//! Poll-based health conditions
//!
//! A condition samples one metric for a pid and classifies the sample as
//! within bounds or critical. Scheduling and breach counting live in
//! `ConditionEvaluator`; conditions themselves are stateless.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::constants::{BYTES_PER_KB, DEFAULT_PROBE_TIMEOUT_SEC};
use crate::domain::ports::{ExecOptions, ProcessExecutor, SystemMetrics};
use crate::domain::DomainError;

/// Everything a probe may consult; cloned into each concurrent probe task
#[derive(Clone)]
pub struct ProbeContext {
    pub pid: u32,
    pub metrics: Arc<dyn SystemMetrics>,
    pub executor: Arc<dyn ProcessExecutor>,
    /// Privileges and environment for command-based probes
    pub exec: ExecOptions,
}

#[async_trait]
pub trait Condition: Send + Sync {
    fn name(&self) -> &str;

    async fn sample(&self, ctx: &ProbeContext) -> Result<f64, DomainError>;

    fn is_critical(&self, value: f64) -> bool;

    fn format_value(&self, value: f64) -> String {
        format!("{}", value)
    }
}

fn require_pid(ctx: &ProbeContext, what: &str) -> Result<u32, DomainError> {
    if ctx.pid == 0 {
        return Err(DomainError::ProbeFailed(format!("{}: no pid to sample", what)));
    }
    Ok(ctx.pid)
}

/// Critical when CPU usage exceeds `above` percent
#[derive(Debug, Clone, PartialEq)]
pub struct CpuUsage {
    pub above: f64,
}

#[async_trait]
impl Condition for CpuUsage {
    fn name(&self) -> &str {
        "cpu_usage"
    }

    async fn sample(&self, ctx: &ProbeContext) -> Result<f64, DomainError> {
        let pid = require_pid(ctx, self.name())?;
        ctx.metrics
            .cpu_usage(pid)
            .ok_or_else(|| DomainError::ProbeFailed(format!("cpu_usage: pid {} not in snapshot", pid)))
    }

    fn is_critical(&self, value: f64) -> bool {
        value > self.above
    }

    fn format_value(&self, value: f64) -> String {
        format!("{}%", value)
    }
}

/// Critical when resident memory exceeds `above_bytes`.
/// Samples are in KB.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryUsage {
    pub above_bytes: u64,
}

#[async_trait]
impl Condition for MemoryUsage {
    fn name(&self) -> &str {
        "memory_usage"
    }

    async fn sample(&self, ctx: &ProbeContext) -> Result<f64, DomainError> {
        let pid = require_pid(ctx, self.name())?;
        ctx.metrics
            .memory_usage(pid)
            .map(|kb| kb as f64)
            .ok_or_else(|| {
                DomainError::ProbeFailed(format!("memory_usage: pid {} not in snapshot", pid))
            })
    }

    fn is_critical(&self, value: f64) -> bool {
        value * BYTES_PER_KB as f64 > self.above_bytes as f64
    }

    fn format_value(&self, value: f64) -> String {
        let kb = value.max(0.0) as u64;
        if kb >= BYTES_PER_KB {
            format!("{}MB", kb / BYTES_PER_KB)
        } else {
            format!("{}KB", kb)
        }
    }
}

/// Always critical
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlwaysTrue;

#[async_trait]
impl Condition for AlwaysTrue {
    fn name(&self) -> &str {
        "always_true"
    }

    async fn sample(&self, _ctx: &ProbeContext) -> Result<f64, DomainError> {
        Ok(1.0)
    }

    fn is_critical(&self, _value: f64) -> bool {
        true
    }

    fn format_value(&self, _value: f64) -> String {
        "true".to_string()
    }
}

/// Runs a command that prints a number; critical when it exceeds `above`.
/// The command sees the sampled pid as `PID`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecProbe {
    pub command: String,
    pub above: f64,
}

#[async_trait]
impl Condition for ExecProbe {
    fn name(&self) -> &str {
        "exec"
    }

    async fn sample(&self, ctx: &ProbeContext) -> Result<f64, DomainError> {
        let mut options = ctx.exec.clone();
        options.daemonize = false;
        options.stdin = None;
        options.timeout = Some(Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SEC));
        let mut env: HashMap<String, String> = options.env;
        env.insert("PID".to_string(), ctx.pid.to_string());
        options.env = env;

        let result = ctx.executor.run(&self.command, &options).await?;
        if !result.succeeded {
            return Err(DomainError::ProbeFailed(format!(
                "exec: '{}' exited with {:?}",
                self.command, result.exit_code
            )));
        }
        result.stdout.trim().parse::<f64>().map_err(|_| {
            DomainError::ProbeFailed(format!(
                "exec: '{}' printed non-numeric output '{}'",
                self.command,
                result.stdout.trim()
            ))
        })
    }

    fn is_critical(&self, value: f64) -> bool {
        value > self.above
    }
}
