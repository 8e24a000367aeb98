use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Gateways a webhook can originate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    /// Mobile money.
    EcoCash,
    Card,
}

impl ProviderId {
    pub const ALL: [ProviderId; 2] = [ProviderId::EcoCash, ProviderId::Card];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::EcoCash => "ecocash",
            ProviderId::Card => "card",
        }
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown payment provider: {0}")]
pub struct UnknownProvider(pub String);

impl FromStr for ProviderId {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ecocash" => Ok(ProviderId::EcoCash),
            "card" => Ok(ProviderId::Card),
            _ => Err(UnknownProvider(s.to_string())),
        }
    }
}
