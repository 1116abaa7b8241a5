// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Network executor actor (control plane).
//!
//! Owns the live topology of one graph instance: node executors by id, live links
//! with the channel that realizes them, and the graph-wide resources. Topology
//! operations are serialized by the mailbox; inside one operation the per-node work
//! fans out concurrently and is joined before the reply is sent.
//!
//! Ordering rules:
//! - links are added only after both endpoint nodes are set up
//! - links are removed before their endpoint nodes
//! - a removed node leaves the live set before it is paused and released

use crate::constants::DEFAULT_SUBSCRIBER_CHANNEL_CAPACITY;
use crate::messages::{NetworkCommand, NetworkSnapshot, NodeSnapshot};
use crate::network_config::NodeSettings;
use crate::node_handle::NodeHandle;
use futures::future::join_all;
use nodeflow_api::{Link, LinkId, Network, Node};
use nodeflow_core::state::state_helpers;
use nodeflow_core::{
    ChannelId, NodeFlowError, NodeLifecycle, NodeRegistry, NodeState, NodeStateUpdate, Result,
    SharedContext,
};
use opentelemetry::KeyValue;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::mpsc;

/// The wiring behind one live link.
#[derive(Debug, Clone, Copy)]
struct LiveLink {
    channel: ChannelId,
    in_cycle: bool,
}

/// A node whose factory or setup failed.
#[derive(Debug, Clone)]
struct UnavailableNode {
    kind: String,
    reason: String,
}

/// The state of one network executor.
pub(crate) struct NetworkExecutor {
    pub(crate) name: Option<String>,
    pub(crate) registry: NodeRegistry,
    pub(crate) shared: SharedContext,
    pub(crate) settings: NodeSettings,
    pub(crate) live_nodes: HashMap<String, NodeHandle>,
    unavailable: HashMap<String, UnavailableNode>,
    live_links: BTreeMap<LinkId, LiveLink>,
    is_resumed: bool,
    released: bool,
    state_subscribers: Vec<mpsc::Sender<NodeStateUpdate>>,
    // Metrics
    pub(crate) nodes_active_gauge: opentelemetry::metrics::Gauge<u64>,
    pub(crate) operations_counter: opentelemetry::metrics::Counter<u64>,
    pub(crate) hook_failures_counter: opentelemetry::metrics::Counter<u64>,
    pub(crate) teardown_timeouts_counter: opentelemetry::metrics::Counter<u64>,
}

/// Per-link result of the connect phase.
type Connected = (Link, Result<ChannelId>);

impl NetworkExecutor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: Option<String>,
        registry: NodeRegistry,
        shared: SharedContext,
        settings: NodeSettings,
        nodes_active_gauge: opentelemetry::metrics::Gauge<u64>,
        operations_counter: opentelemetry::metrics::Counter<u64>,
        hook_failures_counter: opentelemetry::metrics::Counter<u64>,
        teardown_timeouts_counter: opentelemetry::metrics::Counter<u64>,
    ) -> Self {
        Self {
            name,
            registry,
            shared,
            settings,
            live_nodes: HashMap::new(),
            unavailable: HashMap::new(),
            live_links: BTreeMap::new(),
            is_resumed: false,
            released: false,
            state_subscribers: Vec::new(),
            nodes_active_gauge,
            operations_counter,
            hook_failures_counter,
            teardown_timeouts_counter,
        }
    }

    /// The actor loop. Ends after a release request or once every handle is dropped.
    pub(crate) async fn run(mut self, mut mailbox: mpsc::Receiver<NetworkCommand>) {
        tracing::info!(network = ?self.name, "Network executor started");

        while let Some(command) = mailbox.recv().await {
            if !self.handle_command(command).await {
                break;
            }
        }

        if !self.released {
            tracing::info!("All network handles dropped, releasing");
            self.release().await;
        }
        tracing::info!(network = ?self.name, "Network executor stopped");
    }

    /// Returns false once the network has been released.
    async fn handle_command(&mut self, command: NetworkCommand) -> bool {
        match command {
            NetworkCommand::AddNode { node, reply } => {
                self.count_operation("add_node");
                let result = first_error(self.add_nodes(vec![node]).await);
                let _ = reply.send(result);
            },
            NetworkCommand::RemoveNode { id, reply } => {
                self.count_operation("remove_node");
                let result = first_error(self.remove_nodes(vec![id]).await);
                let _ = reply.send(result);
            },
            NetworkCommand::AddLink { link, reply } => {
                self.count_operation("add_link");
                let result = first_error(self.add_links(vec![link]).await);
                let _ = reply.send(result);
            },
            NetworkCommand::RemoveLink { id, reply } => {
                self.count_operation("remove_link");
                let result = first_error(self.remove_links(vec![id]).await);
                let _ = reply.send(result);
            },
            NetworkCommand::AddAllNodes { nodes, reply } => {
                self.count_operation("add_all_nodes");
                let result = NodeFlowError::collect_fan_out(self.add_nodes(nodes).await);
                let _ = reply.send(result);
            },
            NetworkCommand::AddAllLinks { links, reply } => {
                self.count_operation("add_all_links");
                let result = NodeFlowError::collect_fan_out(self.add_links(links).await);
                let _ = reply.send(result);
            },
            NetworkCommand::RemoveAllLinks(reply) => {
                self.count_operation("remove_all_links");
                let ids = self.live_links.keys().cloned().collect();
                let result = NodeFlowError::collect_fan_out(self.remove_links(ids).await);
                let _ = reply.send(result);
            },
            NetworkCommand::RemoveAllNodes(reply) => {
                self.count_operation("remove_all_nodes");
                let ids = self.all_node_ids();
                let result = NodeFlowError::collect_fan_out(self.remove_nodes(ids).await);
                let _ = reply.send(result);
            },
            NetworkCommand::Pause(reply) => {
                self.count_operation("pause");
                let _ = reply.send(self.set_resumed(false).await);
            },
            NetworkCommand::Resume(reply) => {
                self.count_operation("resume");
                let _ = reply.send(self.set_resumed(true).await);
            },
            NetworkCommand::Load { network, reply } => {
                self.count_operation("load");
                let _ = reply.send(self.load(network).await);
            },
            NetworkCommand::Sync { network, reply } => {
                self.count_operation("sync");
                let _ = reply.send(self.sync(network).await);
            },
            NetworkCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot().await);
            },
            NetworkCommand::SubscribeState(reply) => {
                let (tx, rx) = mpsc::channel(DEFAULT_SUBSCRIBER_CHANNEL_CAPACITY);
                self.state_subscribers.push(tx);
                let _ = reply.send(rx);
            },
            NetworkCommand::Release(reply) => {
                self.count_operation("release");
                self.release().await;
                let _ = reply.send(());
                return false;
            },
        }
        true
    }

    fn count_operation(&self, operation: &'static str) {
        self.operations_counter.add(1, &[KeyValue::new("operation", operation)]);
    }

    fn note_failure(&self, err: &NodeFlowError) {
        let class = match err {
            NodeFlowError::Hook { hook, .. } => hook.to_string(),
            NodeFlowError::Resource(_) => "resource".to_string(),
            _ => return,
        };
        self.hook_failures_counter.add(1, &[KeyValue::new("hook", class)]);
    }

    fn record_active(&self) {
        self.nodes_active_gauge.record(self.live_nodes.len() as u64, &[]);
    }

    fn emit(&mut self, node_id: &str, state: NodeState) {
        self.state_subscribers.retain(|tx| !tx.is_closed());
        for tx in &self.state_subscribers {
            state_helpers::emit_state(tx, node_id, state.clone());
        }
    }

    fn all_node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> =
            self.live_nodes.keys().chain(self.unavailable.keys()).cloned().collect();
        ids.sort();
        ids
    }

    fn mark_unavailable(&mut self, id: &str, kind: &str, err: &NodeFlowError) {
        let reason = err.to_string();
        let entry = UnavailableNode { kind: kind.to_string(), reason: reason.clone() };
        self.unavailable.insert(id.to_string(), entry);
        self.emit(id, NodeState::Unavailable { reason });
    }

    /// Builds, sets up and (if the network is resumed) resumes `nodes` concurrently.
    ///
    /// A node whose factory or setup fails is released and kept as unavailable.
    async fn add_nodes(&mut self, nodes: Vec<Node>) -> Vec<Result<()>> {
        let mut results = Vec::with_capacity(nodes.len());
        let mut pending = Vec::new();

        for node in nodes {
            if self.live_nodes.contains_key(&node.id)
                || self.unavailable.contains_key(&node.id)
                || pending.iter().any(|handle: &NodeHandle| handle.id() == node.id)
            {
                let err = NodeFlowError::Topology(format!("node '{}' already exists", node.id));
                tracing::error!(node_id = %node.id, error = %err, "Cannot add node");
                results.push(Err(err));
                continue;
            }

            let params = node.params();
            match self.registry.create(&node.kind, &self.shared, params.as_ref()) {
                Ok(body) => pending.push(NodeHandle::spawn(
                    &node.id,
                    &node.kind,
                    body,
                    self.shared.clone(),
                    self.settings,
                    self.teardown_timeouts_counter.clone(),
                )),
                Err(e) => {
                    tracing::error!(
                        node_id = %node.id,
                        kind = %node.kind,
                        error = %e,
                        "Failed to create node"
                    );
                    self.mark_unavailable(&node.id, &node.kind, &e);
                    results.push(Err(e));
                },
            }
        }

        let resume = self.is_resumed;
        let outcomes = join_all(pending.into_iter().map(|handle| async move {
            let outcome = match handle.setup().await {
                Err(e) => Err((e, true)),
                Ok(()) if resume => handle.resume().await.map_err(|e| (e, false)),
                Ok(()) => Ok(()),
            };
            (handle, outcome)
        }))
        .await;

        let mut failed = Vec::new();
        for (handle, outcome) in outcomes {
            let id = handle.id().to_string();
            match outcome {
                Ok(()) => {
                    tracing::info!(node_id = %id, kind = %handle.kind(), "Node added");
                    let lifecycle =
                        if resume { NodeLifecycle::Resumed } else { NodeLifecycle::Paused };
                    self.emit(&id, lifecycle.into());
                    self.live_nodes.insert(id, handle);
                    results.push(Ok(()));
                },
                Err((e, true)) => {
                    tracing::error!(
                        node_id = %id,
                        error = %e,
                        "Node setup failed, marking unavailable"
                    );
                    self.note_failure(&e);
                    self.mark_unavailable(&id, handle.kind(), &e);
                    failed.push(handle);
                    results.push(Err(e));
                },
                Err((e, false)) => {
                    tracing::warn!(node_id = %id, error = %e, "Node added but failed to resume");
                    self.note_failure(&e);
                    self.emit(&id, NodeState::Paused);
                    self.live_nodes.insert(id, handle);
                    results.push(Err(e));
                },
            }
        }

        join_all(failed.iter().map(NodeHandle::release)).await;
        self.record_active();
        results
    }

    /// Detaches the links of `ids`, then pauses and releases the nodes concurrently.
    async fn remove_nodes(&mut self, ids: Vec<String>) -> Vec<Result<()>> {
        let mut results = Vec::with_capacity(ids.len());

        let attached: Vec<LinkId> = self
            .live_links
            .keys()
            .filter(|link| ids.iter().any(|id| link.touches(id)))
            .cloned()
            .collect();
        if !attached.is_empty() {
            tracing::debug!(count = attached.len(), "Removing links of removed nodes");
            for result in self.remove_links(attached).await {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Link teardown failed during node removal");
                }
            }
        }

        let mut removing = Vec::new();
        for id in ids {
            if let Some(handle) = self.live_nodes.remove(&id) {
                removing.push(handle);
            } else if self.unavailable.remove(&id).is_some() {
                tracing::info!(node_id = %id, "Unavailable node removed");
                self.emit(&id, NodeState::Released);
                results.push(Ok(()));
            } else {
                let err = NodeFlowError::Topology(format!("node '{id}' not found"));
                tracing::error!(node_id = %id, error = %err, "Cannot remove node");
                results.push(Err(err));
            }
        }
        self.record_active();

        let outcomes = join_all(removing.into_iter().map(|handle| async move {
            let paused =
                if handle.is_released() { Ok(()) } else { handle.pause_for_teardown().await };
            handle.release().await;
            (handle, paused)
        }))
        .await;

        for (handle, paused) in outcomes {
            if let Err(e) = paused {
                tracing::warn!(
                    node_id = %handle.id(),
                    error = %e,
                    "Node failed to pause before release"
                );
                self.note_failure(&e);
            }
            tracing::info!(node_id = %handle.id(), "Node removed");
            self.emit(handle.id(), NodeState::Released);
            results.push(Ok(()));
        }
        results
    }

    fn endpoint(&self, node: &str) -> Result<NodeHandle> {
        if let Some(handle) = self.live_nodes.get(node) {
            return Ok(handle.clone());
        }
        if self.unavailable.contains_key(node) {
            tracing::warn!(node_id = %node, "Skipping link to unavailable node");
            return Err(NodeFlowError::NodeUnavailable(node.to_string()));
        }
        let err = NodeFlowError::Topology(format!("node '{node}' not found"));
        tracing::error!(error = %err, "Cannot link node");
        Err(err)
    }

    /// Whether any live link on `node.port` is on a cycle.
    fn port_in_cycle(&self, node: &str, port: &str) -> bool {
        self.live_links.iter().any(|(id, live)| {
            live.in_cycle
                && ((&*id.from_node == node && &*id.from_port == port)
                    || (&*id.to_node == node && &*id.to_port == port))
        })
    }

    /// Re-derives the cycle flag of each port from the live links.
    async fn refresh_cycle_flags(&mut self, ports: BTreeSet<(String, String)>) {
        let marks = ports.into_iter().filter_map(|(node, port)| {
            let handle = self.live_nodes.get(&node)?.clone();
            let cycle = self.port_in_cycle(&node, &port);
            Some(async move {
                if let Err(e) = handle.mark_port(&port, None, Some(cycle)).await {
                    tracing::debug!(node_id = %node, port, error = %e, "Could not mark port");
                }
            })
        });
        join_all(marks.collect::<Vec<_>>()).await;
    }

    /// Wires `links` concurrently: producer `get_consumer`, then consumer `start_consumer`.
    async fn add_links(&mut self, links: Vec<Link>) -> Vec<Result<()>> {
        let mut results = Vec::with_capacity(links.len());
        let mut pending: Vec<(Link, NodeHandle, NodeHandle)> = Vec::new();

        for link in links {
            if self.live_links.contains_key(&link.id)
                || pending.iter().any(|(other, _, _)| other.id == link.id)
            {
                let err = NodeFlowError::Topology(format!("link {} already exists", link.id));
                tracing::error!(error = %err, "Cannot add link");
                results.push(Err(err));
                continue;
            }
            let endpoints = self
                .endpoint(&link.id.from_node)
                .and_then(|producer| Ok((producer, self.endpoint(&link.id.to_node)?)));
            match endpoints {
                Ok((producer, consumer)) => pending.push((link, producer, consumer)),
                Err(e) => results.push(Err(e)),
            }
        }

        // Cycle flags must be in place before on_connect runs.
        let mut cyclic_ports = BTreeSet::new();
        for (link, _, _) in pending.iter().filter(|(link, _, _)| link.in_cycle) {
            cyclic_ports.insert((link.id.from_node.to_string(), link.id.from_port.to_string()));
            cyclic_ports.insert((link.id.to_node.to_string(), link.id.to_port.to_string()));
        }
        let mut touched = BTreeSet::new();
        let connects = pending.into_iter().map(|(link, producer, consumer)| {
            let from = (link.id.from_node.to_string(), link.id.from_port.to_string());
            let to = (link.id.to_node.to_string(), link.id.to_port.to_string());
            let from_cycle = cyclic_ports.contains(&from) || self.port_in_cycle(&from.0, &from.1);
            let to_cycle = cyclic_ports.contains(&to) || self.port_in_cycle(&to.0, &to.1);
            touched.insert(from);
            touched.insert(to);
            async move {
                let outcome = connect(&link, &producer, &consumer, from_cycle, to_cycle).await;
                (link, outcome)
            }
        });
        let outcomes: Vec<Connected> = join_all(connects.collect::<Vec<_>>()).await;

        for (link, outcome) in outcomes {
            match outcome {
                Ok(channel) => {
                    tracing::info!(
                        link = %link.id,
                        in_cycle = link.in_cycle,
                        channel = %channel,
                        "Link added"
                    );
                    self.live_links.insert(link.id, LiveLink { channel, in_cycle: link.in_cycle });
                    results.push(Ok(()));
                },
                Err(e) => {
                    tracing::error!(link = %link.id, error = %e, "Failed to add link");
                    self.note_failure(&e);
                    results.push(Err(e));
                },
            }
        }

        self.refresh_cycle_flags(touched).await;
        results
    }

    /// Unwires `ids` concurrently: producer `stop_consumer`, consumer `wait_for_consumer`.
    async fn remove_links(&mut self, ids: Vec<LinkId>) -> Vec<Result<()>> {
        let mut results = Vec::with_capacity(ids.len());
        let mut pending = Vec::new();
        let mut touched = BTreeSet::new();

        for id in ids {
            let Some(live) = self.live_links.remove(&id) else {
                let err = NodeFlowError::Topology(format!("link {id} not found"));
                tracing::error!(error = %err, "Cannot remove link");
                results.push(Err(err));
                continue;
            };
            touched.insert((id.from_node.to_string(), id.from_port.to_string()));
            touched.insert((id.to_node.to_string(), id.to_port.to_string()));
            let producer = self.live_nodes.get(&*id.from_node).cloned();
            let consumer = self.live_nodes.get(&*id.to_node).cloned();
            pending.push((id, live, producer, consumer));
        }

        let disconnects = pending.into_iter().map(|(id, live, producer, consumer)| async move {
            let outcome = disconnect(&id, &live, producer.as_ref(), consumer.as_ref()).await;
            (id, outcome)
        });
        let outcomes = join_all(disconnects.collect::<Vec<_>>()).await;

        // Re-derive the flags from the links that remain.
        self.refresh_cycle_flags(touched).await;

        for (id, outcome) in outcomes {
            match &outcome {
                Ok(()) => tracing::info!(link = %id, "Link removed"),
                Err(e) => {
                    tracing::warn!(link = %id, error = %e, "Link removed with errors");
                    self.note_failure(e);
                },
            }
            results.push(outcome);
        }
        results
    }

    async fn set_resumed(&mut self, resumed: bool) -> Result<()> {
        self.is_resumed = resumed;
        let handles: Vec<NodeHandle> = self.live_nodes.values().cloned().collect();
        let results = join_all(handles.iter().map(|handle| async move {
            if resumed {
                handle.resume().await
            } else {
                handle.pause().await
            }
        }))
        .await;

        let lifecycle = if resumed { NodeLifecycle::Resumed } else { NodeLifecycle::Paused };
        for (handle, result) in handles.iter().zip(&results) {
            match result {
                Ok(()) => self.emit(handle.id(), lifecycle.into()),
                Err(e) => self.note_failure(e),
            }
        }
        tracing::info!(resumed, nodes = handles.len(), "Network state changed");
        NodeFlowError::collect_fan_out(results)
    }

    /// Pauses every node with each pause bounded by the release timeout.
    ///
    /// A node that does not pause in time is released right away, which aborts
    /// its executor, so link and node teardown never wait on it.
    async fn pause_for_teardown(&mut self) -> Result<()> {
        self.is_resumed = false;
        let handles: Vec<NodeHandle> = self.live_nodes.values().cloned().collect();
        let results = join_all(handles.iter().map(|handle| async move {
            let result = handle.pause_for_teardown().await;
            if matches!(result, Err(NodeFlowError::Timeout(_))) {
                handle.release().await;
            }
            result
        }))
        .await;

        for (handle, result) in handles.iter().zip(&results) {
            match result {
                Ok(()) => self.emit(handle.id(), NodeLifecycle::Paused.into()),
                Err(e) => self.note_failure(e),
            }
        }
        NodeFlowError::collect_fan_out(results)
    }

    async fn load(&mut self, mut network: Network) -> Result<()> {
        let cycles = network.compute_components();
        if network.name.is_some() {
            self.name.clone_from(&network.name);
        }
        tracing::info!(
            network = ?self.name,
            nodes = network.node_count(),
            links = network.link_count(),
            cycle_links = cycles,
            "Loading network"
        );

        let nodes = network.nodes().cloned().collect();
        let links = network.links().cloned().collect();
        let mut results = self.add_nodes(nodes).await;
        results.extend(self.add_links(links).await);
        NodeFlowError::collect_fan_out(results)
    }

    /// Moves the live topology to `network` by applying only the difference.
    ///
    /// Nodes whose kind changed are replaced. Unavailable nodes are retried.
    async fn sync(&mut self, mut network: Network) -> Result<()> {
        network.compute_components();

        let mut vanished_nodes: Vec<String> = self
            .live_nodes
            .iter()
            .filter(|(id, handle)| network.node(id).is_none_or(|node| node.kind != handle.kind()))
            .map(|(id, _)| id.clone())
            .collect();
        vanished_nodes.extend(self.unavailable.keys().cloned());
        vanished_nodes.sort();

        let vanished_links: Vec<LinkId> = self
            .live_links
            .keys()
            .filter(|id| {
                network.link(id).is_none()
                    || vanished_nodes.iter().any(|node| id.touches(node))
            })
            .cloned()
            .collect();

        tracing::info!(
            remove_links = vanished_links.len(),
            remove_nodes = vanished_nodes.len(),
            "Syncing network"
        );

        let mut results = self.remove_links(vanished_links).await;
        results.extend(self.remove_nodes(vanished_nodes).await);

        let new_nodes: Vec<Node> = network
            .nodes()
            .filter(|node| !self.live_nodes.contains_key(&node.id))
            .cloned()
            .collect();
        results.extend(self.add_nodes(new_nodes).await);

        let new_links: Vec<Link> = network
            .links()
            .filter(|link| !self.live_links.contains_key(&link.id))
            .cloned()
            .collect();
        results.extend(self.add_links(new_links).await);

        let mut touched = BTreeSet::new();
        for link in network.links() {
            if let Some(live) = self.live_links.get_mut(&link.id) {
                if live.in_cycle != link.in_cycle {
                    live.in_cycle = link.in_cycle;
                    touched.insert((link.id.from_node.to_string(), link.id.from_port.to_string()));
                    touched.insert((link.id.to_node.to_string(), link.id.to_port.to_string()));
                }
            }
        }
        self.refresh_cycle_flags(touched).await;

        NodeFlowError::collect_fan_out(results)
    }

    async fn snapshot(&mut self) -> NetworkSnapshot {
        let handles: Vec<NodeHandle> = self.live_nodes.values().cloned().collect();
        let statuses = join_all(handles.iter().map(NodeHandle::status)).await;

        let mut nodes: Vec<NodeSnapshot> = handles
            .iter()
            .zip(statuses)
            .map(|(handle, status)| {
                let (state, linked_ports) = match status {
                    Ok(status) => (status.lifecycle.into(), status.linked_ports),
                    Err(_) => (NodeState::Released, Vec::new()),
                };
                NodeSnapshot {
                    id: handle.id().to_string(),
                    kind: handle.kind().to_string(),
                    state,
                    linked_ports,
                }
            })
            .collect();
        nodes.extend(self.unavailable.iter().map(|(id, node)| NodeSnapshot {
            id: id.clone(),
            kind: node.kind.clone(),
            state: NodeState::Unavailable { reason: node.reason.clone() },
            linked_ports: Vec::new(),
        }));
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        NetworkSnapshot {
            name: self.name.clone(),
            is_resumed: self.is_resumed,
            nodes,
            links: self
                .live_links
                .iter()
                .map(|(id, live)| Link { id: id.clone(), in_cycle: live.in_cycle })
                .collect(),
        }
    }

    /// Pause, remove all links, remove all nodes, then free graph-wide resources.
    async fn release(&mut self) {
        tracing::info!(network = ?self.name, "Releasing network");

        if let Err(e) = self.pause_for_teardown().await {
            tracing::warn!(error = %e, "Some nodes failed to pause during release");
        }

        let links = self.live_links.keys().cloned().collect();
        if let Err(e) = NodeFlowError::collect_fan_out(self.remove_links(links).await) {
            tracing::warn!(error = %e, "Link teardown reported errors during release");
        }

        let ids = self.all_node_ids();
        if let Err(e) = NodeFlowError::collect_fan_out(self.remove_nodes(ids).await) {
            tracing::warn!(error = %e, "Node teardown reported errors during release");
        }

        self.shared.affinity().shutdown().await;
        self.shared.devices().release_all();
        self.released = true;
        self.record_active();
        self.state_subscribers.clear();
        tracing::info!(network = ?self.name, "Network released");
    }
}

/// The single error of a one-item operation, or `Ok`.
fn first_error(results: Vec<Result<()>>) -> Result<()> {
    results.into_iter().find(Result::is_err).unwrap_or(Ok(()))
}

async fn connect(
    link: &Link,
    producer: &NodeHandle,
    consumer: &NodeHandle,
    from_cycle: bool,
    to_cycle: bool,
) -> Result<ChannelId> {
    let id = &link.id;
    producer.mark_port(&id.from_port, Some(true), Some(from_cycle)).await?;
    consumer.mark_port(&id.to_port, Some(true), Some(to_cycle)).await?;

    let channel = match producer.get_consumer(&id.from_port).await {
        Ok(channel) => channel,
        Err(e) => {
            unmark_ports(id, producer, consumer).await;
            return Err(e);
        },
    };
    let channel_id = channel.id();
    if let Err(e) = consumer.start_consumer(&id.to_port, channel).await {
        if let Err(rollback) = producer.stop_consumer(&id.from_port, channel_id).await {
            tracing::warn!(link = %id, error = %rollback, "Rollback of producer side failed");
        }
        unmark_ports(id, producer, consumer).await;
        return Err(e);
    }
    Ok(channel_id)
}

/// Clears the linked flag of both endpoints unless another link still holds them.
async fn unmark_ports(id: &LinkId, producer: &NodeHandle, consumer: &NodeHandle) {
    for (handle, port) in [(producer, &*id.from_port), (consumer, &*id.to_port)] {
        if let Err(e) = handle.mark_port(port, Some(false), None).await {
            tracing::debug!(
                link = %id,
                node_id = %handle.id(),
                error = %e,
                "Could not unmark port"
            );
        }
    }
}

async fn disconnect(
    id: &LinkId,
    live: &LiveLink,
    producer: Option<&NodeHandle>,
    consumer: Option<&NodeHandle>,
) -> Result<()> {
    // on_disconnect sees the cycle flag of the link being removed.
    let ends = [(producer, &*id.from_port), (consumer, &*id.to_port)];
    for (handle, port) in ends {
        if let Some(handle) = handle {
            if let Err(e) = handle.mark_port(port, None, Some(live.in_cycle)).await {
                tracing::debug!(
                    link = %id,
                    node_id = %handle.id(),
                    error = %e,
                    "Could not mark port"
                );
            }
        }
    }

    let mut outcome = Ok(());
    if let Some(producer) = producer {
        if let Err(e) = producer.stop_consumer(&id.from_port, live.channel).await {
            outcome = Err(e);
        }
    }
    if let Some(consumer) = consumer {
        if let Err(e) = consumer.wait_for_consumer(&id.to_port).await {
            outcome = outcome.and(Err(e));
        }
    }
    outcome
}
