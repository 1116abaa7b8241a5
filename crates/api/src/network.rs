// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Graph model: nodes with declared ports and validated links between them.
//!
//! The model is plain data. The network executor reads it to decide what to
//! instantiate and wire; nothing here touches running nodes.

use crate::cycles;
use indexmap::IndexMap;
use nodeflow_core::{NodeFlowError, PortCardinality, PortDescriptor, PortDirection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A port as seen by the graph model.
pub type Port = PortDescriptor;

/// Errors raised when the graph model would become inconsistent.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("node '{0}' does not exist")]
    UnknownNode(String),

    #[error("node '{node}' has no port '{port}'")]
    UnknownPort { node: String, port: String },

    #[error("node '{0}' already exists")]
    DuplicateNode(String),

    #[error("link {0} already exists")]
    DuplicateLink(LinkId),

    #[error("link {0} does not exist")]
    UnknownLink(LinkId),

    #[error("link {link} must go from an output to an input")]
    DirectionMismatch { link: LinkId },

    #[error("link {link} connects '{from}' to '{to}'")]
    TypeMismatch { link: LinkId, from: String, to: String },

    #[error("link {0} connects a node to itself")]
    SelfLink(LinkId),

    #[error("input '{port}' on node '{node}' is already linked")]
    InputAlreadyLinked { node: String, port: String },

    #[error("output '{port}' on node '{node}' accepts a single link")]
    OutputAlreadyLinked { node: String, port: String },

    #[error("invalid endpoint '{0}', expected 'node.port'")]
    InvalidEndpoint(String),

    #[error("properties of node '{0}' must be a mapping")]
    InvalidProperties(String),

    #[error("unknown node kind '{kind}' for node '{node}': {reason}")]
    UnknownKind { node: String, kind: String, reason: String },

    #[error("failed to parse network: {0}")]
    Parse(String),
}

impl From<NetworkError> for NodeFlowError {
    fn from(err: NetworkError) -> Self {
        Self::Topology(err.to_string())
    }
}

/// Identifies a link by its four endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkId {
    pub from_node: Arc<str>,
    pub from_port: Arc<str>,
    pub to_node: Arc<str>,
    pub to_port: Arc<str>,
}

impl LinkId {
    pub fn new(
        from_node: impl Into<Arc<str>>,
        from_port: impl Into<Arc<str>>,
        to_node: impl Into<Arc<str>>,
        to_port: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            from_node: from_node.into(),
            from_port: from_port.into(),
            to_node: to_node.into(),
            to_port: to_port.into(),
        }
    }

    /// Whether `node` is either endpoint.
    pub fn touches(&self, node: &str) -> bool {
        &*self.from_node == node || &*self.to_node == node
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} -> {}.{}", self.from_node, self.from_port, self.to_node, self.to_port)
    }
}

/// A validated link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    #[serde(flatten)]
    pub id: LinkId,
    /// Both endpoints lie on one feedback cycle. Set by [`Network::compute_components`].
    #[serde(default)]
    pub in_cycle: bool,
}

/// A node instance in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub kind: String,
    pub ports: Vec<Port>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, ports: Vec<Port>) -> Self {
        Self { id: id.into(), kind: kind.into(), ports, properties: serde_json::Map::new() }
    }

    #[must_use]
    pub fn with_property(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn port(&self, id: &str) -> Option<&Port> {
        self.ports.iter().find(|p| p.id == id)
    }

    /// Properties as the JSON object handed to the node factory.
    pub fn params(&self) -> Option<serde_json::Value> {
        (!self.properties.is_empty()).then(|| serde_json::Value::Object(self.properties.clone()))
    }
}

/// The graph: nodes, links and a per-node link index.
#[derive(Debug, Clone, Default)]
pub struct Network {
    pub name: Option<String>,
    nodes: IndexMap<String, Node>,
    links: IndexMap<LinkId, Link>,
    adjacency: HashMap<String, Vec<LinkId>>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Returns [`NetworkError::DuplicateNode`] if the id is taken.
    pub fn add_node(&mut self, node: Node) -> Result<(), NetworkError> {
        if self.nodes.contains_key(&node.id) {
            return Err(NetworkError::DuplicateNode(node.id));
        }
        self.adjacency.insert(node.id.clone(), Vec::new());
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Removes a node and every link attached to it.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::UnknownNode`] if the node does not exist.
    pub fn remove_node(&mut self, id: &str) -> Result<(Node, Vec<Link>), NetworkError> {
        let node =
            self.nodes.shift_remove(id).ok_or_else(|| NetworkError::UnknownNode(id.into()))?;
        let attached = self.adjacency.remove(id).unwrap_or_default();
        let mut removed = Vec::with_capacity(attached.len());
        for link_id in attached {
            if let Some(link) = self.links.shift_remove(&link_id) {
                let other =
                    if &*link_id.from_node == id { &link_id.to_node } else { &link_id.from_node };
                if let Some(ids) = self.adjacency.get_mut(&**other) {
                    ids.retain(|l| *l != link_id);
                }
                removed.push(link);
            }
        }
        Ok((node, removed))
    }

    /// Validates and adds a link. The new link's `in_cycle` is false until the next
    /// [`Network::compute_components`].
    ///
    /// # Errors
    ///
    /// Returns a [`NetworkError`] if an endpoint is missing, directions or data types
    /// do not match, the link is a self-link or a duplicate, or the target input (or
    /// single-consumer output) is already linked.
    pub fn add_link(&mut self, id: LinkId) -> Result<&Link, NetworkError> {
        self.validate_link(&id)?;
        self.adjacency.entry(id.from_node.to_string()).or_default().push(id.clone());
        self.adjacency.entry(id.to_node.to_string()).or_default().push(id.clone());
        let link = self.links.entry(id.clone()).or_insert(Link { id, in_cycle: false });
        Ok(link)
    }

    fn validate_link(&self, id: &LinkId) -> Result<(), NetworkError> {
        if self.links.contains_key(id) {
            return Err(NetworkError::DuplicateLink(id.clone()));
        }
        if id.from_node == id.to_node {
            return Err(NetworkError::SelfLink(id.clone()));
        }
        let from = self.endpoint(&id.from_node, &id.from_port)?;
        let to = self.endpoint(&id.to_node, &id.to_port)?;
        if from.direction != PortDirection::Output || to.direction != PortDirection::Input {
            return Err(NetworkError::DirectionMismatch { link: id.clone() });
        }
        if from.data_type != to.data_type {
            return Err(NetworkError::TypeMismatch {
                link: id.clone(),
                from: from.data_type.clone(),
                to: to.data_type.clone(),
            });
        }
        if self.links.keys().any(|l| l.to_node == id.to_node && l.to_port == id.to_port) {
            return Err(NetworkError::InputAlreadyLinked {
                node: id.to_node.to_string(),
                port: id.to_port.to_string(),
            });
        }
        if from.cardinality == PortCardinality::One
            && self.links.keys().any(|l| l.from_node == id.from_node && l.from_port == id.from_port)
        {
            return Err(NetworkError::OutputAlreadyLinked {
                node: id.from_node.to_string(),
                port: id.from_port.to_string(),
            });
        }
        Ok(())
    }

    fn endpoint(&self, node: &str, port: &str) -> Result<&Port, NetworkError> {
        let n = self.nodes.get(node).ok_or_else(|| NetworkError::UnknownNode(node.into()))?;
        n.port(port).ok_or_else(|| NetworkError::UnknownPort { node: node.into(), port: port.into() })
    }

    /// # Errors
    ///
    /// Returns [`NetworkError::UnknownLink`] if the link does not exist.
    pub fn remove_link(&mut self, id: &LinkId) -> Result<Link, NetworkError> {
        let link = self.links.shift_remove(id).ok_or_else(|| NetworkError::UnknownLink(id.clone()))?;
        for node in [&id.from_node, &id.to_node] {
            if let Some(ids) = self.adjacency.get_mut(&**node) {
                ids.retain(|l| l != id);
            }
        }
        Ok(link)
    }

    /// Links attached to `node`, in insertion order.
    pub fn links_of(&self, node: &str) -> Vec<&Link> {
        self.adjacency
            .get(node)
            .map(|ids| ids.iter().filter_map(|id| self.links.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn link(&self, id: &LinkId) -> Option<&Link> {
        self.links.get(id)
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Reads and deserializes one property of a node.
    pub fn property<T: serde::de::DeserializeOwned>(&self, node: &str, key: &str) -> Option<T> {
        let value = self.nodes.get(node)?.properties.get(key)?;
        serde_json::from_value(value.clone()).ok()
    }

    /// Recomputes `in_cycle` on every link. Returns the number of cyclic links.
    pub fn compute_components(&mut self) -> usize {
        let cyclic = cycles::cyclic_links(self.nodes.values(), self.links.keys());
        for (id, link) in &mut self.links {
            link.in_cycle = cyclic.contains(id);
        }
        tracing::debug!(links = self.links.len(), cyclic = cyclic.len(), "Computed link cycles");
        cyclic.len()
    }

    /// Links currently marked `in_cycle`.
    pub fn cyclic_links(&self) -> impl Iterator<Item = &Link> {
        self.links.values().filter(|l| l.in_cycle)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn port(id: &str, direction: PortDirection, data_type: &str) -> Port {
        Port {
            id: id.into(),
            direction,
            data_type: data_type.into(),
            cardinality: PortCardinality::Broadcast,
        }
    }

    fn relay(id: &str) -> Node {
        Node::new(
            id,
            "core::relay",
            vec![port("in", PortDirection::Input, "tick"), port("out", PortDirection::Output, "tick")],
        )
    }

    fn chain(ids: &[&str]) -> Network {
        let mut net = Network::new();
        for id in ids {
            net.add_node(relay(id)).unwrap();
        }
        for pair in ids.windows(2) {
            net.add_link(LinkId::new(pair[0], "out", pair[1], "in")).unwrap();
        }
        net
    }

    #[test]
    fn test_link_validation() {
        let mut net = chain(&["a", "b"]);
        let mut text = relay("t");
        text.ports[0].data_type = "text".into();
        net.add_node(text).unwrap();

        let dup = LinkId::new("a", "out", "b", "in");
        assert_eq!(net.add_link(dup.clone()), Err(NetworkError::DuplicateLink(dup)));
        assert!(matches!(
            net.add_link(LinkId::new("a", "out", "a", "in")),
            Err(NetworkError::SelfLink(_))
        ));
        assert!(matches!(
            net.add_link(LinkId::new("a", "in", "t", "in")),
            Err(NetworkError::DirectionMismatch { .. })
        ));
        assert!(matches!(
            net.add_link(LinkId::new("a", "out", "t", "in")),
            Err(NetworkError::TypeMismatch { .. })
        ));
        assert!(matches!(
            net.add_link(LinkId::new("t", "out", "b", "in")),
            Err(NetworkError::InputAlreadyLinked { .. })
        ));
        assert!(matches!(
            net.add_link(LinkId::new("x", "out", "b", "in")),
            Err(NetworkError::UnknownNode(_))
        ));
        assert!(matches!(
            net.add_link(LinkId::new("a", "nope", "t", "in")),
            Err(NetworkError::UnknownPort { .. })
        ));
    }

    #[test]
    fn test_single_output_accepts_one_link() {
        let mut net = chain(&["a", "b"]);
        net.add_node(relay("c")).unwrap();
        net.nodes.get_mut("a").unwrap().ports[1].cardinality = PortCardinality::One;
        assert!(matches!(
            net.add_link(LinkId::new("a", "out", "c", "in")),
            Err(NetworkError::OutputAlreadyLinked { .. })
        ));
    }

    #[test]
    fn test_remove_node_drops_attached_links() {
        let mut net = chain(&["a", "b", "c"]);
        let (node, links) = net.remove_node("b").unwrap();
        assert_eq!(node.id, "b");
        assert_eq!(links.len(), 2);
        assert_eq!(net.link_count(), 0);
        assert!(net.links_of("a").is_empty());
        assert!(net.links_of("c").is_empty());
        assert!(matches!(net.remove_node("b"), Err(NetworkError::UnknownNode(_))));
    }

    #[test]
    fn test_compute_components_replaces_flags() {
        let mut net = chain(&["a", "b", "c"]);
        assert_eq!(net.compute_components(), 0);

        let mut net = chain(&["a", "b"]);
        let back = LinkId::new("b", "out", "a", "in");
        net.add_link(back.clone()).unwrap();
        assert_eq!(net.compute_components(), 2);
        assert!(net.links().all(|l| l.in_cycle));

        net.remove_link(&back).unwrap();
        assert_eq!(net.compute_components(), 0);
        assert!(net.links().all(|l| !l.in_cycle), "stale flags are cleared");
    }

    #[test]
    fn test_properties() {
        let mut net = Network::new();
        net.add_node(relay("a").with_property("interval_ms", 20)).unwrap();
        assert_eq!(net.property::<u64>("a", "interval_ms"), Some(20));
        assert_eq!(net.property::<String>("a", "interval_ms"), None);
        assert_eq!(net.property::<u64>("a", "missing"), None);
        assert!(net.node("a").unwrap().params().is_some());
        assert!(relay("b").params().is_none());
    }

    #[test]
    fn test_link_id_display() {
        let id = LinkId::new("cam", "out", "view", "in");
        assert_eq!(id.to_string(), "cam.out -> view.in");
        assert!(id.touches("cam") && id.touches("view") && !id.touches("x"));
    }
}
