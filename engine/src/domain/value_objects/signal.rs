//! Signal names accepted in stop/restart signal lists

use nix::sys::signal::Signal;
use std::fmt;
use std::str::FromStr;

use crate::domain::constants::DEFAULT_SIGNALS;
use crate::domain::DomainError;

/// A POSIX signal parsed from `"TERM"`, `"SIGTERM"` or `"15"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessSignal(Signal);

impl ProcessSignal {
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        let trimmed = s.trim();
        if let Ok(number) = trimmed.parse::<i32>() {
            return Signal::try_from(number)
                .map(ProcessSignal)
                .map_err(|_| DomainError::InvalidSignal(s.to_string()));
        }

        let upper = trimmed.to_uppercase();
        let name = if upper.starts_with("SIG") {
            upper
        } else {
            format!("SIG{}", upper)
        };
        Signal::from_str(&name)
            .map(ProcessSignal)
            .map_err(|_| DomainError::InvalidSignal(s.to_string()))
    }

    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Result<Vec<Self>, DomainError> {
        names.iter().map(|n| Self::parse(n.as_ref())).collect()
    }

    /// TERM, INT, KILL
    pub fn default_escalation() -> Vec<Self> {
        DEFAULT_SIGNALS
            .iter()
            .filter_map(|name| Self::parse(name).ok())
            .collect()
    }

    pub fn as_nix(&self) -> Signal {
        self.0
    }
}

impl From<Signal> for ProcessSignal {
    fn from(signal: Signal) -> Self {
        ProcessSignal(signal)
    }
}

impl fmt::Display for ProcessSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.0.as_str();
        f.write_str(name.strip_prefix("SIG").unwrap_or(name))
    }
}
