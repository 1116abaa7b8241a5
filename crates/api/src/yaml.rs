// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! YAML network snapshots.
//!
//! The file lists nodes by id with their kind and properties, and links as
//! `node.port` endpoint pairs. Ports are not written in the file; [`compile`] asks
//! a lookup (normally the node registry) for each node's declared ports so links
//! are validated against real node contracts.
//!
//! ```yaml
//! name: loopback
//! nodes:
//!   source:
//!     kind: core::ticker
//!     properties: { interval_ms: 20 }
//!   out:
//!     kind: core::sink
//! links:
//!   - from: source.out
//!     to: out.in
//! ```

use crate::network::{LinkId, Network, NetworkError, Node, Port};
use indexmap::IndexMap;
use serde::Deserialize;

/// One node entry of a snapshot.
#[derive(Debug, Deserialize)]
pub struct UserNode {
    pub kind: String,
    #[serde(default)]
    pub properties: Option<serde_json::Value>,
}

/// One link entry of a snapshot.
#[derive(Debug, Deserialize)]
pub struct UserLink {
    pub from: String,
    pub to: String,
}

/// The top-level structure of a snapshot file.
#[derive(Debug, Deserialize)]
pub struct UserNetwork {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: IndexMap<String, UserNode>,
    #[serde(default)]
    pub links: Vec<UserLink>,
}

/// Parses a snapshot without validating it.
///
/// # Errors
///
/// Returns [`NetworkError::Parse`] for malformed YAML.
pub fn parse(yaml: &str) -> Result<UserNetwork, NetworkError> {
    serde_saphyr::from_str(yaml).map_err(|e| NetworkError::Parse(e.to_string()))
}

fn endpoint(spec: &str) -> Result<(&str, &str), NetworkError> {
    match spec.split_once('.') {
        Some((node, port)) if !node.is_empty() && !port.is_empty() => Ok((node, port)),
        _ => Err(NetworkError::InvalidEndpoint(spec.to_string())),
    }
}

/// Builds a validated [`Network`] with up-to-date `in_cycle` flags.
///
/// `ports_of(kind, properties)` returns the declared ports of a node kind, or a
/// reason why the kind cannot be built.
///
/// # Errors
///
/// Returns a [`NetworkError`] for unknown kinds, non-mapping properties, malformed
/// endpoints, or any link the graph model rejects.
pub fn compile<F>(user: UserNetwork, mut ports_of: F) -> Result<Network, NetworkError>
where
    F: FnMut(&str, Option<&serde_json::Value>) -> Result<Vec<Port>, String>,
{
    let mut network = Network::new();
    network.name = user.name;

    for (id, user_node) in user.nodes {
        let properties = match user_node.properties {
            None | Some(serde_json::Value::Null) => serde_json::Map::new(),
            Some(serde_json::Value::Object(map)) => map,
            Some(_) => return Err(NetworkError::InvalidProperties(id)),
        };
        let params =
            (!properties.is_empty()).then(|| serde_json::Value::Object(properties.clone()));
        let ports = ports_of(&user_node.kind, params.as_ref()).map_err(|reason| {
            NetworkError::UnknownKind { node: id.clone(), kind: user_node.kind.clone(), reason }
        })?;
        network.add_node(Node { id, kind: user_node.kind, ports, properties })?;
    }

    for link in &user.links {
        let (from_node, from_port) = endpoint(&link.from)?;
        let (to_node, to_port) = endpoint(&link.to)?;
        network.add_link(LinkId::new(from_node, from_port, to_node, to_port))?;
    }

    network.compute_components();
    Ok(network)
}

/// [`parse`] followed by [`compile`].
///
/// # Errors
///
/// See [`parse`] and [`compile`].
pub fn load<F>(yaml: &str, ports_of: F) -> Result<Network, NetworkError>
where
    F: FnMut(&str, Option<&serde_json::Value>) -> Result<Vec<Port>, String>,
{
    compile(parse(yaml)?, ports_of)
}
