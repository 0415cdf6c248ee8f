//! Node registry: who is a member, who hosts what, who schedules
//!
//! Answers membership questions from the grid's view. Attributes missing
//! from a node's join-time attribute bag are looked up in a distributed map
//! of out-of-band properties, which is where overrides set after joining
//! end up.

use crate::config::ClusterConfig;
use crate::error::Result;
use crate::grid::{CacheSettings, Grid};
use crate::node::{
    AddressResolver, Node, NodeId, ATTR_CLIENT, ATTR_CLOUD_RUNNER, ATTR_EXTERNAL_HOST,
    ATTR_EXTERNAL_PORT, ATTR_SCHEDULER,
};
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// Distributed map of properties set after join
pub const NODE_PROPERTIES_CACHE: &str = "cohort.node_properties";

/// Build the node descriptor this process should join the grid with
pub fn describe_local_node(config: &ClusterConfig) -> Node {
    let resolver = AddressResolver::new(&config.address_resolver);
    let (host, port) = resolver.resolve_discovery(&config.bind_host, config.discovery_port);

    let mut node = Node::new(NodeId::new(&host, port))
        .with_attribute(ATTR_CLIENT, config.client.to_string())
        .with_attribute(ATTR_SCHEDULER, config.scheduler.to_string())
        .with_attribute(ATTR_CLOUD_RUNNER, config.cloud_runner.to_string());

    if host != config.bind_host || port != config.discovery_port {
        node = node
            .with_attribute(ATTR_EXTERNAL_HOST, host)
            .with_attribute(ATTR_EXTERNAL_PORT, port.to_string());
    }
    node
}

pub struct NodeRegistry {
    grid: Arc<dyn Grid>,
    local: Node,
}

impl NodeRegistry {
    /// `settings` applies to the node-properties cache
    pub async fn new(grid: Arc<dyn Grid>, settings: CacheSettings) -> Result<Self> {
        grid.create_cache(NODE_PROPERTIES_CACHE, settings).await?;
        let local = grid.local_node();
        Ok(Self { grid, local })
    }

    /// This process's node
    pub fn local_node(&self) -> &Node {
        &self.local
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local.id
    }

    /// Current members, optionally including client nodes
    pub fn members(&self, include_clients: bool) -> Vec<Node> {
        self.grid
            .members()
            .into_iter()
            .filter(|n| include_clients || !n.is_client())
            .collect()
    }

    /// Members that do real work: neither clients nor schedulers
    pub fn server_nodes(&self) -> Vec<Node> {
        self.members(false)
            .into_iter()
            .filter(|n| !n.is_scheduler())
            .collect()
    }

    /// Members tagged as schedulers
    pub fn scheduler_nodes(&self) -> Vec<Node> {
        self.members(false)
            .into_iter()
            .filter(|n| n.is_scheduler())
            .collect()
    }

    pub fn is_member(&self, id: &NodeId) -> bool {
        self.grid.members().iter().any(|n| &n.id == id)
    }

    /// The master is the first server member in id order. Every node reaches
    /// the same answer from the same membership view.
    pub fn master(&self) -> Option<NodeId> {
        self.members(false).into_iter().map(|n| n.id).min()
    }

    pub fn is_master(&self) -> bool {
        self.master().as_ref() == Some(&self.local.id)
    }

    pub fn is_scheduler_running(&self) -> bool {
        self.grid.members().iter().any(Node::is_scheduler)
    }

    /// Node attribute, falling back to out-of-band properties
    pub async fn node_property(&self, node: &NodeId, name: &str) -> Result<Option<String>> {
        let native = self
            .grid
            .members()
            .into_iter()
            .find(|n| &n.id == node)
            .and_then(|n| n.attribute(name).map(str::to_string));
        if native.is_some() {
            return Ok(native);
        }

        let raw = self
            .grid
            .cache_get(NODE_PROPERTIES_CACHE, property_key(node, name).as_bytes())
            .await?;
        match raw {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Publish a property for this node after join
    pub async fn set_local_node_property(&self, name: &str, value: &str) -> Result<()> {
        let key = property_key(&self.local.id, name);
        let value = bincode::serialize(value)?;
        self.grid
            .cache_put(NODE_PROPERTIES_CACHE, Bytes::from(key), Bytes::from(value))
            .await?;
        debug!(node = %self.local.id, property = name, "Set out-of-band node property");
        Ok(())
    }
}

fn property_key(node: &NodeId, name: &str) -> String {
    format!("{}/{}", node, name)
}
