use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Default path MTU: the IPv6 minimum guaranteed MTU.
pub const DEFAULT_MTU: usize = 1280;
/// Default cap on one reliable message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65536;

/// Which candidate paths the connectivity transport may use.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPolicy {
    /// Any candidate path
    #[default]
    All,
    /// Relayed paths only
    Relay,
}

/// Connection configuration, fixed at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Connectivity server URLs handed to the candidate agent
    pub ice_servers: Vec<String>,
    pub transport_policy: TransportPolicy,
    /// Local address the engine binds its flow to; `None` lets the
    /// embedder decide
    pub bind_address: Option<SocketAddr>,
    /// Inclusive local port range for gathering, zero means automatic
    pub port_range: (u16, u16),
    pub mtu: usize,
    pub max_message_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            transport_policy: TransportPolicy::default(),
            bind_address: None,
            port_range: (0, 0),
            mtu: DEFAULT_MTU,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.config.ice_servers = servers;
        self
    }

    pub fn with_transport_policy(mut self, policy: TransportPolicy) -> Self {
        self.config.transport_policy = policy;
        self
    }

    pub fn with_bind_address(mut self, address: SocketAddr) -> Self {
        self.config.bind_address = Some(address);
        self
    }

    pub fn with_port_range(mut self, begin: u16, end: u16) -> Self {
        self.config.port_range = (begin, end);
        self
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = ConfigBuilder::new().build();
        assert_eq!(config.mtu, DEFAULT_MTU);
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert!(config.ice_servers.is_empty());
    }

    #[test]
    fn test_builder_round_trip_serde() {
        let config = ConfigBuilder::new()
            .with_ice_servers(vec!["stun:stun.example.org:3478".into()])
            .with_mtu(1400)
            .build();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.mtu, 1400);
        assert_eq!(back.ice_servers.len(), 1);
    }
}
