//! sv engine
//!
//! A process supervisor: each managed process runs a small state machine
//! driven by a periodic tick and by user commands. Conditions watch resource
//! usage and probes, triggers react to transitions, and a control API served
//! on a Unix socket exposes the supervisor to clients.

pub const DEFAULT_SOCKET: &str = "/var/run/sv/svd.sock";

pub mod adapters;
pub mod application;
pub mod domain;
pub mod infrastructure;

#[cfg(test)]
pub(crate) mod testing;
