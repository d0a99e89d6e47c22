//! Router description file.
//!
//! A router is described as JSON: its ports with their addresses, static routes
//! and static ARP entries. [`crate::Router::show`] produces the same structure.
//!
//! ```json
//! {
//!   "name": "r1",
//!   "shadow": false,
//!   "ports": [
//!     { "name": "eth0", "ip": "10.0.0.1", "netmask": "255.255.255.0",
//!       "secondary_ips": [{ "ip": "192.168.1.1", "netmask": "255.255.255.0" }] }
//!   ],
//!   "routes": [
//!     { "network": "172.16.0.0", "netmask": "255.255.0.0", "nexthop": "10.0.0.2", "pathcost": 5 }
//!   ],
//!   "arp_entries": [
//!     { "address": "10.0.0.2", "mac": "52:54:00:12:34:56", "interface": "eth0" }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    pub name: String,
    /// Mirror an OS network namespace
    #[serde(default)]
    pub shadow: bool,
    #[serde(default)]
    pub ports: Vec<PortConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub arp_entries: Vec<ArpEntryConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    pub name: String,
    pub ip: String,
    pub netmask: String,
    /// Generated when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Interface index; resolved from the name when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ifindex: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secondary_ips: Vec<SecondaryIpConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryIpConfig {
    pub ip: String,
    pub netmask: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub network: String,
    pub netmask: String,
    /// Gateway address, or "local" for directly connected networks
    pub nexthop: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pathcost: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArpEntryConfig {
    pub address: String,
    pub mac: String,
    pub interface: String,
}

impl RouterConfig {
    /// Load a router description from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "name": "r1",
        "ports": [
            { "name": "eth0", "ip": "10.0.0.1", "netmask": "255.255.255.0",
              "secondary_ips": [{ "ip": "192.168.1.1", "netmask": "255.255.255.0" }] },
            { "name": "eth1", "ip": "10.1.0.1", "netmask": "255.255.255.0", "mac": "02:00:00:00:00:02" }
        ],
        "routes": [
            { "network": "172.16.0.0", "netmask": "255.255.0.0", "nexthop": "10.0.0.2", "pathcost": 5 }
        ]
    }"#;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = RouterConfig::load(file.path()).unwrap();
        assert_eq!(config.name, "r1");
        assert!(!config.shadow);
        assert_eq!(config.ports.len(), 2);
        assert_eq!(config.ports[0].secondary_ips.len(), 1);
        assert_eq!(config.ports[1].mac.as_deref(), Some("02:00:00:00:00:02"));
        assert_eq!(config.routes[0].pathcost, Some(5));
        assert!(config.arp_entries.is_empty());
    }

    #[test]
    fn test_json_roundtrip() {
        let config = RouterConfig::from_json(SAMPLE).unwrap();
        let again = RouterConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(config, again);
    }

    #[test]
    fn test_missing_file_and_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            RouterConfig::load(&dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
        assert!(matches!(
            RouterConfig::from_json("{ \"ports\": [] }"),
            Err(ConfigError::Json(_))
        ));
    }
}
