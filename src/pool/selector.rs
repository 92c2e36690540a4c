use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How the pool picks one credential out of the eligible set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    RoundRobin,
    Random,
    LeastInFlight,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self::RoundRobin
    }
}

impl SelectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::LeastInFlight => "least_in_flight",
        }
    }
}

impl FromStr for SelectionPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "least_in_flight" => Ok(Self::LeastInFlight),
            _ => Err(()),
        }
    }
}
