//! SystemMetrics port
//! Read access to a per-tick snapshot of the OS process table

use crate::domain::DomainError;
use async_trait::async_trait;

#[async_trait]
pub trait SystemMetrics: Send + Sync {
    /// Drop the current snapshot and take a fresh one. Called once per tick.
    async fn reset_cache(&self) -> Result<(), DomainError>;

    /// CPU usage of `pid` in percent
    fn cpu_usage(&self, pid: u32) -> Option<f64>;

    /// Resident memory of `pid` in KB
    fn memory_usage(&self, pid: u32) -> Option<u64>;

    /// Direct children of `pid`
    fn children_of(&self, pid: u32) -> Vec<u32>;

    /// Signal-probe liveness; never served from the snapshot
    fn is_alive(&self, pid: u32) -> bool;
}
