use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

/// A storage feature a pool (and the flavors built on it) can promise
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Ids are handed out in insertion order
    Fifo,
    /// Claim create/get/update/delete
    Claims,
    /// Messages survive a restart of the backend
    Durability,
    AtLeastOnce,
    HighThroughput,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Fifo,
        Capability::Claims,
        Capability::Durability,
        Capability::AtLeastOnce,
        Capability::HighThroughput,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Fifo => "fifo",
            Self::Claims => "claims",
            Self::Durability => "durability",
            Self::AtLeastOnce => "at_least_once",
            Self::HighThroughput => "high_throughput",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Capability {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| BrokerError::validation(format!("unknown capability: {s}")))
    }
}

/// Set of capabilities, ordered for stable comparisons and output
pub type Capabilities = BTreeSet<Capability>;

/// Render a set for error messages and logs
pub fn describe(caps: &Capabilities) -> String {
    let names: Vec<&str> = caps.iter().map(Capability::name).collect();
    format!("[{}]", names.join(", "))
}
