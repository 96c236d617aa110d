pub mod process_executor;
pub mod system_metrics;

pub use process_executor::{ExecOptions, ExecutionResult, ProcessExecutor};
pub use system_metrics::SystemMetrics;
