//! Infrastructure Layer
//!
//! Driven adapters implementing the ports defined in the domain layer.
//!
//! ## Adapters
//!
//! - `TokioProcessExecutor`: real command execution and signalling using tokio
//! - `SysinfoMetrics`: per-tick process table snapshot refreshed with `sysinfo`
//! - `config`: YAML process definitions
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sv_engine::application::Supervisor;
//! use sv_engine::infrastructure::{SysinfoMetrics, TokioProcessExecutor};
//! use std::sync::Arc;
//!
//! let supervisor = Supervisor::new(
//!     Arc::new(TokioProcessExecutor::new()),
//!     Arc::new(SysinfoMetrics::new()),
//! );
//! ```

pub mod config;
pub mod sysinfo_metrics;
pub mod tokio_executor;

pub use config::{load_path, AppDirs, ConfigFile, LoadedProcess, ProcessConfig};
pub use sysinfo_metrics::SysinfoMetrics;
pub use tokio_executor::TokioProcessExecutor;
