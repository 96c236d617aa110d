//! Parsing of memory sizes and CPU percentages used by condition thresholds

use crate::domain::constants::{BYTES_PER_GB, BYTES_PER_KB, BYTES_PER_MB, BYTES_PER_TB};
use crate::domain::DomainError;

/// Parse a memory size such as "512", "100K", "100M", "2G" or "1T" into bytes
pub fn parse_memory(s: &str) -> Result<u64, DomainError> {
    let s = s.trim().to_uppercase();
    let s = s.strip_suffix('B').unwrap_or(&s);

    let (number, multiplier) = match s.chars().last() {
        Some('K') => (&s[..s.len() - 1], BYTES_PER_KB),
        Some('M') => (&s[..s.len() - 1], BYTES_PER_MB),
        Some('G') => (&s[..s.len() - 1], BYTES_PER_GB),
        Some('T') => (&s[..s.len() - 1], BYTES_PER_TB),
        _ => (s, 1),
    };

    let value = number
        .trim()
        .parse::<f64>()
        .map_err(|_| DomainError::InvalidConfiguration(format!("Invalid memory size: {}", s)))?;
    if value < 0.0 {
        return Err(DomainError::InvalidConfiguration(format!(
            "Memory size must not be negative: {}",
            s
        )));
    }

    Ok((value * multiplier as f64) as u64)
}

/// Parse a CPU percentage such as "60" or "60%"
pub fn parse_percent(s: &str) -> Result<f64, DomainError> {
    let trimmed = s.trim();
    let number = trimmed.strip_suffix('%').unwrap_or(trimmed);
    let value = number
        .trim()
        .parse::<f64>()
        .map_err(|_| DomainError::InvalidConfiguration(format!("Invalid percentage: {}", s)))?;
    if value < 0.0 {
        return Err(DomainError::InvalidConfiguration(format!(
            "Percentage must not be negative: {}",
            s
        )));
    }
    Ok(value)
}
