//! Domain Constants
//!
//! Defaults shared by the state machine, the action pipeline and the loaders

use std::time::Duration;

/// Exit code indicating successful command termination
pub const SUCCESS_EXIT_CODE: i32 = 0;

/// Default start timeout in seconds
pub const DEFAULT_START_TIMEOUT_SEC: u64 = 30;

/// Default stop timeout in seconds
pub const DEFAULT_STOP_TIMEOUT_SEC: u64 = 30;

/// Default restart timeout in seconds
pub const DEFAULT_RESTART_TIMEOUT_SEC: u64 = 30;

/// Timeout for ping_command, pid_command and exec condition probes
pub const DEFAULT_PROBE_TIMEOUT_SEC: u64 = 5;

/// Escalating signal sequence used by stop and restart when no command is set
pub const DEFAULT_SIGNALS: &[&str] = &["TERM", "INT", "KILL"];

/// Minimum number of one-second liveness polls per signal
pub const MIN_SIGNAL_POLLS: u64 = 2;

/// Interval between liveness polls while escalating signals
pub const SIGNAL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Supervision tick interval
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Flapping trigger defaults
pub const DEFAULT_FLAPPING_TIMES: usize = 5;
pub const DEFAULT_FLAPPING_WITHIN_SEC: u64 = 1;
pub const DEFAULT_FLAPPING_RETRY_AFTER_SEC: u64 = 5;

/// Memory unit constants
pub const BYTES_PER_KB: u64 = 1024;
pub const BYTES_PER_MB: u64 = 1024 * 1024;
pub const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;
pub const BYTES_PER_TB: u64 = 1024 * 1024 * 1024 * 1024;
