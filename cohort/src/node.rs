//! Node identity and attributes

use crate::config::{AddressMapping, AddressResolverConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Attribute: node is a client (member that owns no partitions)
pub const ATTR_CLIENT: &str = "client";
/// Attribute: node runs the scheduler group
pub const ATTR_SCHEDULER: &str = "scheduler";
/// Attribute: node runs in cloud-runner mode
pub const ATTR_CLOUD_RUNNER: &str = "cloud_runner";
/// Attribute: externally visible host override
pub const ATTR_EXTERNAL_HOST: &str = "external_host";
/// Attribute: externally visible port override
pub const ATTR_EXTERNAL_PORT: &str = "external_port";

/// Cluster-wide node identity, `host:port`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(host: &str, port: u16) -> Self {
        Self(format!("{}:{}", host, port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A cluster member as published by the grid on join
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub attributes: BTreeMap<String, String>,
}

impl Node {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    fn flag(&self, name: &str) -> bool {
        self.attribute(name) == Some("true")
    }

    pub fn is_client(&self) -> bool {
        self.flag(ATTR_CLIENT)
    }

    pub fn is_scheduler(&self) -> bool {
        self.flag(ATTR_SCHEDULER)
    }

    pub fn is_cloud_runner(&self) -> bool {
        self.flag(ATTR_CLOUD_RUNNER)
    }
}

/// Maps local bind addresses to the addresses peers should dial
///
/// Needed behind NAT or in containers where the bound interface is not
/// reachable from other nodes. The discovery port and the data-plane port
/// can be overridden independently.
#[derive(Debug, Clone, Default)]
pub struct AddressResolver {
    mappings: Vec<AddressMapping>,
    discovery_port_override: Option<u16>,
    data_port_override: Option<u16>,
}

impl AddressResolver {
    pub fn new(config: &AddressResolverConfig) -> Self {
        Self {
            mappings: config.mappings.clone(),
            discovery_port_override: config.discovery_port_override,
            data_port_override: config.data_port_override,
        }
    }

    /// External `(host, port)` for the discovery endpoint
    pub fn resolve_discovery(&self, host: &str, port: u16) -> (String, u16) {
        let (host, port) = self.resolve(host, port);
        (host, self.discovery_port_override.unwrap_or(port))
    }

    /// External `(host, port)` for the data-plane endpoint
    pub fn resolve_data(&self, host: &str, port: u16) -> (String, u16) {
        let (host, port) = self.resolve(host, port);
        (host, self.data_port_override.unwrap_or(port))
    }

    fn resolve(&self, host: &str, port: u16) -> (String, u16) {
        let with_port = format!("{}:{}", host, port);
        for mapping in &self.mappings {
            // An exact host:port mapping wins over a bare host mapping
            if mapping.local == with_port {
                return split_host_port(&mapping.external, port);
            }
        }
        for mapping in &self.mappings {
            if mapping.local == host {
                return split_host_port(&mapping.external, port);
            }
        }
        (host.to_string(), port)
    }
}

fn split_host_port(addr: &str, default_port: u16) -> (String, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (addr.to_string(), default_port),
        },
        None => (addr.to_string(), default_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> AddressResolver {
        AddressResolver::new(&AddressResolverConfig {
            discovery_port_override: None,
            data_port_override: Some(31000),
            mappings: vec![
                AddressMapping {
                    local: "10.0.0.5".into(),
                    external: "node-a.example.com".into(),
                },
                AddressMapping {
                    local: "10.0.0.5:47500".into(),
                    external: "203.0.113.9:32000".into(),
                },
            ],
        })
    }

    #[test]
    fn test_exact_mapping_wins() {
        let (host, port) = resolver().resolve_discovery("10.0.0.5", 47500);
        assert_eq!(host, "203.0.113.9");
        assert_eq!(port, 32000);
    }

    #[test]
    fn test_host_mapping_and_data_override() {
        let (host, port) = resolver().resolve_data("10.0.0.5", 41234);
        assert_eq!(host, "node-a.example.com");
        assert_eq!(port, 31000);
    }

    #[test]
    fn test_unmapped_passthrough() {
        let (host, port) = resolver().resolve_discovery("192.168.1.1", 47500);
        assert_eq!(host, "192.168.1.1");
        assert_eq!(port, 47500);
    }

    #[test]
    fn test_node_flags() {
        let node = Node::new(NodeId::new("127.0.0.1", 47500))
            .with_attribute(ATTR_SCHEDULER, "true")
            .with_attribute(ATTR_CLIENT, "false");
        assert!(node.is_scheduler());
        assert!(!node.is_client());
        assert_eq!(node.id.as_str(), "127.0.0.1:47500");
    }
}
