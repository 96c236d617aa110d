//! Where a started command reads its standard input from

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdinSource {
    /// Literal payload written to stdin
    Literal(String),
    /// Contents of a file
    File(String),
    /// Stdout of another command
    Command(String),
}
