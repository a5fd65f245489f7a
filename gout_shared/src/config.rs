//! Configuration for the relay and the agent.
//!
//! Loads from JSON strings/files (file IO left to the binaries).

use serde::{Deserialize, Serialize};

/// Relay-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Public IP to hand out in handshake replies; empty means discover one
    /// at startup.
    #[serde(default)]
    pub return_ip: String,
    /// Control listener address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Control listener port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Password every agent must present when registering.
    #[serde(default = "default_password")]
    pub verify_password: String,
    /// Listen backlog for every TCP listener the relay opens.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Inclusive lower bound of the public-port allocation range.
    #[serde(default = "default_min_port")]
    pub min_port: u16,
    /// Inclusive upper bound of the public-port allocation range.
    #[serde(default = "default_max_port")]
    pub max_port: u16,
}

/// Agent-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Relay host to register with.
    #[serde(default = "default_agent_host")]
    pub host: String,
    /// Relay control port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Password presented when registering.
    #[serde(default = "default_password")]
    pub verify_password: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_agent_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3147
}

fn default_password() -> String {
    "passwd@gout".to_string()
}

fn default_max_connections() -> u32 {
    100
}

fn default_min_port() -> u16 {
    1024
}

fn default_max_port() -> u16 {
    65535
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            return_ip: String::new(),
            host: default_host(),
            port: default_port(),
            verify_password: default_password(),
            max_connections: default_max_connections(),
            min_port: default_min_port(),
            max_port: default_max_port(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: default_agent_host(),
            port: default_port(),
            verify_password: default_password(),
        }
    }
}

impl RelayConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

impl AgentConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_defaults_match_partial_json() {
        let cfg = RelayConfig::from_json_str(r#"{"min_port": 30000, "max_port": 40000}"#).unwrap();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 3147);
        assert_eq!(cfg.verify_password, "passwd@gout");
        assert_eq!(cfg.min_port, 30000);
        assert_eq!(cfg.max_port, 40000);
        assert!(cfg.return_ip.is_empty());
    }

    #[test]
    fn agent_defaults() {
        let cfg = AgentConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 3147);
    }
}
