// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! api: the NodeFlow graph model.
//!
//! - [`network`]: Nodes, ports and validated links
//! - [`cycles`]: Feedback-link detection (Kosaraju–Sharir over ports)
//! - [`yaml`]: Snapshot files compiled into a [`Network`]

pub mod cycles;
pub mod network;
pub mod yaml;

pub use cycles::cyclic_links;
pub use network::{Link, LinkId, Network, NetworkError, Node, Port};

// Re-export types so client crates can use them
pub use nodeflow_core::{NodeDefinition, NodeState, PortCardinality, PortDirection};
