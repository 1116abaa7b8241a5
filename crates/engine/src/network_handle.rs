// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Public client handle for a running network executor.

use crate::constants::TASK_JOIN_TIMEOUT;
use crate::messages::{NetworkCommand, NetworkSnapshot};
use nodeflow_api::{Link, LinkId, Network, Node};
use nodeflow_core::{ActorRef, NodeFlowError, NodeStateUpdate, Reply, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A handle to communicate with a running network executor.
///
/// Every operation returns once its effects are in place. Clones address the same
/// executor; the network is released when [`NetworkHandle::release`] is called or
/// the last clone is dropped.
#[derive(Clone)]
pub struct NetworkHandle {
    actor: ActorRef<NetworkCommand>,
    network_task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl NetworkHandle {
    pub(crate) fn new(actor: ActorRef<NetworkCommand>, network_task: JoinHandle<()>) -> Self {
        Self { actor, network_task: Arc::new(tokio::sync::Mutex::new(Some(network_task))) }
    }

    async fn request<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(Reply<T>) -> NetworkCommand,
    {
        self.actor.call(build).await.map_err(|e| match e {
            NodeFlowError::ActorClosed(name) => NodeFlowError::Released(name),
            other => other,
        })
    }

    /// Builds, sets up and (if the network is resumed) resumes a node.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::Topology` for a duplicate id, the factory's error for
    /// an unknown kind or bad properties, or the setup failure. A node that fails
    /// setup stays in the graph as unavailable.
    pub async fn add_node(&self, node: Node) -> Result<()> {
        self.request(|reply| NetworkCommand::AddNode { node, reply }).await?
    }

    /// Detaches every link of the node, then pauses and releases it.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::Topology` if no node has this id.
    pub async fn remove_node(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| NetworkCommand::RemoveNode { id, reply }).await?
    }

    /// Wires a link between two live nodes.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::Topology` for a missing endpoint or a duplicate link,
    /// `NodeFlowError::NodeUnavailable` when an endpoint failed setup, or the
    /// failure of either node's `on_connect`.
    pub async fn add_link(&self, link: Link) -> Result<()> {
        self.request(|reply| NetworkCommand::AddLink { link, reply }).await?
    }

    /// Unwires a live link.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::Topology` if the link is not live, or a hook failure
    /// (the link is removed regardless).
    pub async fn remove_link(&self, id: LinkId) -> Result<()> {
        self.request(|reply| NetworkCommand::RemoveLink { id, reply }).await?
    }

    /// Adds `nodes` concurrently.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::FanOut` listing the nodes that failed; the others are live.
    pub async fn add_all_nodes(&self, nodes: Vec<Node>) -> Result<()> {
        self.request(|reply| NetworkCommand::AddAllNodes { nodes, reply }).await?
    }

    /// Adds `links` concurrently.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::FanOut` listing the links that failed; the others are live.
    pub async fn add_all_links(&self, links: Vec<Link>) -> Result<()> {
        self.request(|reply| NetworkCommand::AddAllLinks { links, reply }).await?
    }

    /// Removes every live link.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::FanOut` for hook failures during unwiring.
    pub async fn remove_all_links(&self) -> Result<()> {
        self.request(NetworkCommand::RemoveAllLinks).await?
    }

    /// Removes every node, including unavailable ones.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::FanOut` if any removal failed.
    pub async fn remove_all_nodes(&self) -> Result<()> {
        self.request(NetworkCommand::RemoveAllNodes).await?
    }

    /// Pauses every node.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::FanOut` listing the nodes whose `on_pause` failed.
    pub async fn pause(&self) -> Result<()> {
        self.request(NetworkCommand::Pause).await?
    }

    /// Resumes every node. Nodes added later start resumed.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::FanOut` listing the nodes whose `on_resume` failed.
    pub async fn resume(&self) -> Result<()> {
        self.request(NetworkCommand::Resume).await?
    }

    /// Adds all nodes of `network`, then all its links, with fresh cycle flags.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::FanOut` for every node or link that failed.
    pub async fn load(&self, network: Network) -> Result<()> {
        self.request(|reply| NetworkCommand::Load { network, reply }).await?
    }

    /// Applies the difference between the live topology and `network`.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::FanOut` for every operation of the diff that failed.
    pub async fn sync(&self, network: Network) -> Result<()> {
        self.request(|reply| NetworkCommand::Sync { network, reply }).await?
    }

    /// # Errors
    ///
    /// Returns `NodeFlowError::Released` once the network is gone.
    pub async fn snapshot(&self) -> Result<NetworkSnapshot> {
        self.request(NetworkCommand::Snapshot).await
    }

    /// Subscribes to node state updates.
    /// Returns a receiver that will receive all subsequent state changes.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::Released` once the network is gone.
    pub async fn subscribe_state(&self) -> Result<mpsc::Receiver<NodeStateUpdate>> {
        self.request(NetworkCommand::SubscribeState).await
    }

    /// Pauses, unwires and releases everything, then waits for the executor to stop.
    ///
    /// Idempotent. Node teardown is bounded by the release timeout, so this returns
    /// even when node bodies hang.
    ///
    /// # Errors
    ///
    /// Returns an error if the executor task panicked or did not stop in time.
    pub async fn release(&self) -> Result<()> {
        match self.request(NetworkCommand::Release).await {
            Ok(()) | Err(NodeFlowError::Released(_)) => {},
            Err(e) => return Err(e),
        }

        let join_handle = {
            let mut task_guard = self.network_task.lock().await;
            task_guard.take()
        };
        let Some(handle) = join_handle else {
            tracing::debug!("Network already released");
            return Ok(());
        };

        match tokio::time::timeout(TASK_JOIN_TIMEOUT, handle).await {
            Ok(Ok(())) => {
                tracing::debug!("Network executor shut down gracefully");
                Ok(())
            },
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Network executor panicked during release");
                Err(NodeFlowError::Runtime(format!("network executor panicked: {e}")))
            },
            Err(_) => {
                tracing::warn!("Network executor did not stop within the join timeout");
                Err(NodeFlowError::Timeout("network executor did not stop".to_string()))
            },
        }
    }

    pub fn is_released(&self) -> bool {
        self.actor.is_closed()
    }
}
