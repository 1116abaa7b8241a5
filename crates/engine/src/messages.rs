// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Mailbox messages of the node and network executors, and the snapshot types
//! they answer with.

use nodeflow_api::{Link, LinkId, Network, Node};
use nodeflow_core::{
    BoxedChannel, ChannelId, NodeLifecycle, NodeState, NodeStateUpdate, Reply, Result,
};
use serde::Serialize;
use tokio::sync::mpsc;

/// Requests handled by a node executor, one at a time.
pub(crate) enum NodeCommand {
    Setup(Reply<Result<()>>),
    Resume(Reply<Result<()>>),
    Pause(Reply<Result<()>>),
    GetConsumer {
        port: String,
        reply: Reply<Result<BoxedChannel>>,
    },
    StartConsumer {
        port: String,
        channel: BoxedChannel,
        reply: Reply<Result<()>>,
    },
    /// Answers whether the output port is still linked.
    StopConsumer {
        port: String,
        channel: ChannelId,
        reply: Reply<Result<bool>>,
    },
    WaitForConsumer {
        port: String,
        reply: Reply<Result<()>>,
    },
    MarkPort {
        port: String,
        linked: Option<bool>,
        cycle: Option<bool>,
        reply: Reply<()>,
    },
    Status(Reply<NodeStatus>),
    Release(Reply<()>),
}

/// Point-in-time view of one node executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub lifecycle: NodeLifecycle,
    pub set_up: bool,
    pub linked_ports: Vec<String>,
    pub running_tasks: usize,
}

/// Requests handled by the network executor, one at a time.
pub(crate) enum NetworkCommand {
    AddNode { node: Node, reply: Reply<Result<()>> },
    RemoveNode { id: String, reply: Reply<Result<()>> },
    AddLink { link: Link, reply: Reply<Result<()>> },
    RemoveLink { id: LinkId, reply: Reply<Result<()>> },
    AddAllNodes { nodes: Vec<Node>, reply: Reply<Result<()>> },
    AddAllLinks { links: Vec<Link>, reply: Reply<Result<()>> },
    RemoveAllLinks(Reply<Result<()>>),
    RemoveAllNodes(Reply<Result<()>>),
    Pause(Reply<Result<()>>),
    Resume(Reply<Result<()>>),
    Load { network: Network, reply: Reply<Result<()>> },
    Sync { network: Network, reply: Reply<Result<()>> },
    Snapshot(Reply<NetworkSnapshot>),
    SubscribeState(Reply<mpsc::Receiver<NodeStateUpdate>>),
    Release(Reply<()>),
}

/// A node as seen by the network executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSnapshot {
    pub id: String,
    pub kind: String,
    #[serde(flatten)]
    pub state: NodeState,
    pub linked_ports: Vec<String>,
}

/// The live topology of a network executor.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkSnapshot {
    pub name: Option<String>,
    pub is_resumed: bool,
    pub nodes: Vec<NodeSnapshot>,
    pub links: Vec<Link>,
}

impl NetworkSnapshot {
    pub fn node(&self, id: &str) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn link(&self, id: &LinkId) -> Option<&Link> {
        self.links.iter().find(|link| &link.id == id)
    }
}
