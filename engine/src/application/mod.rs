//! Application Layer
//!
//! - `ManagedProcess`: one supervised process, its state machine, actions,
//!   conditions and triggers
//! - `Supervisor`: the set of managed processes, the tick loop and the
//!   user-facing commands

pub mod managed_process;
pub mod supervisor;

pub use managed_process::{ManagedProcess, ProcessStatus};
pub use supervisor::{StatusEntry, Supervisor};
