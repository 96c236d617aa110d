//! Driving Adapters Layer
//!
//! Adapters that accept external requests and translate them into
//! supervisor commands and queries.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sv_engine::adapters::rest::{build_router, serve_on_unix_socket};
//! use sv_engine::application::Supervisor;
//! use sv_engine::infrastructure::{SysinfoMetrics, TokioProcessExecutor};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let supervisor = Arc::new(Supervisor::new(
//!     Arc::new(TokioProcessExecutor::new()),
//!     Arc::new(SysinfoMetrics::new()),
//! ));
//! let shutdown = supervisor.shutdown_token();
//! let router = build_router(supervisor);
//! serve_on_unix_socket("/tmp/svd.sock", router, async move { shutdown.cancelled().await }).await?;
//! # Ok(())
//! # }
//! ```

pub mod rest;
