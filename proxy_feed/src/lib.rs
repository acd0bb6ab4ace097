//! Proxy source aggregation.
//!
//! Fetches remote proxy lists, parses them into [`Candidate`]s and
//! deduplicates on the (address, protocol) pair. The heavy lifting lives in
//! [`harvester`]; this module holds the data model shared with consumers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod harvester;

pub use harvester::{Aggregator, HarvestError};

/// Proxy protocol spoken by a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Socks4,
    Socks5,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Socks4 => write!(f, "socks4"),
            Protocol::Socks5 => write!(f, "socks5"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" | "https" => Ok(Protocol::Http),
            "socks4" => Ok(Protocol::Socks4),
            "socks5" => Ok(Protocol::Socks5),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// A prospective proxy awaiting validation. Identity is (address, protocol);
/// the same address may appear once per protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub address: String,
    pub protocol: Protocol,
}

impl Candidate {
    pub fn new(address: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            address: address.into(),
            protocol,
        }
    }

    /// Deduplication key: normalized address plus protocol.
    pub fn key(&self) -> String {
        format!("{}|{}", self.address.trim().to_lowercase(), self.protocol)
    }
}

/// Protocol assigned to a source in configuration. `Auto` defers to line
/// schemes and URL inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolHint {
    #[default]
    Auto,
    Http,
    Socks4,
    Socks5,
}

impl ProtocolHint {
    /// The fixed protocol, if this hint is not `Auto`.
    pub fn fixed(self) -> Option<Protocol> {
        match self {
            ProtocolHint::Auto => None,
            ProtocolHint::Http => Some(Protocol::Http),
            ProtocolHint::Socks4 => Some(Protocol::Socks4),
            ProtocolHint::Socks5 => Some(Protocol::Socks5),
        }
    }
}

/// One configured proxy list source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub url: String,
    #[serde(rename = "type", default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub protocol: ProtocolHint,
    #[serde(default)]
    pub enabled: bool,
}

/// Per-source outcome of one aggregation pass.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SourceReport {
    pub url: String,
    pub proxies_found: usize,
    #[serde(default)]
    pub error: String,
}

/// Aggregator configuration, bound from the `aggregator` section of the
/// service config document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub user_agent: String,
}

fn default_interval() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            sources: Vec::new(),
            user_agent: String::new(),
        }
    }
}
