// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Node-body contract and the per-node context.
//!
//! - [`NodeBody`]: Hooks a node implementation provides; the engine calls them
//!   one at a time from the node's executor
//! - [`NodeContext`]: Owned connections, inbound channels and link flags of one node
//! - [`SharedContext`]: Graph-wide resources (affinity worker, device registry)
//! - [`NodeFactory`]: Builds a body from its properties

use crate::affinity::AffinityWorker;
use crate::connection::{BoxedChannel, Channel, ChannelId, Connection, ErasedConnection};
use crate::devices::DeviceRegistry;
use crate::error::{NodeFlowError, Result};
use crate::ports::{Key, PortDirection, PortSpec};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Resources shared by every node of one graph instance.
#[derive(Clone, Debug, Default)]
pub struct SharedContext {
    affinity: AffinityWorker,
    devices: DeviceRegistry,
}

impl SharedContext {
    pub const fn new(affinity: AffinityWorker, devices: DeviceRegistry) -> Self {
        Self { affinity, devices }
    }

    /// The dedicated thread for thread-affine resources such as rendering contexts.
    pub const fn affinity(&self) -> &AffinityWorker {
        &self.affinity
    }

    pub const fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }
}

/// A node implementation.
///
/// Hooks run under the executor's actor guarantee: at most one hook of a node runs
/// at a time. They must not block; long-running work goes into tasks started with
/// [`NodeContext::spawn`].
#[async_trait]
pub trait NodeBody: Send {
    /// Port declarations. Called once, before `on_setup`.
    fn ports(&self) -> Vec<PortSpec>;

    /// One-time initialization: acquire resources, prime pools.
    async fn on_setup(&mut self, _ctx: &mut NodeContext) -> Result<()> {
        Ok(())
    }

    /// A link was attached to `port`. `is_producer` is true on the output side.
    async fn on_connect(
        &mut self,
        _ctx: &mut NodeContext,
        _port: &str,
        _is_producer: bool,
    ) -> Result<()> {
        Ok(())
    }

    /// A link was detached from `port`.
    async fn on_disconnect(
        &mut self,
        _ctx: &mut NodeContext,
        _port: &str,
        _is_producer: bool,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_pause(&mut self, _ctx: &mut NodeContext) -> Result<()> {
        Ok(())
    }

    async fn on_resume(&mut self, _ctx: &mut NodeContext) -> Result<()> {
        Ok(())
    }

    /// Free everything acquired in `on_setup`. Bounded by the release timeout.
    async fn on_release(&mut self, _ctx: &mut NodeContext) -> Result<()> {
        Ok(())
    }
}

/// Builds a node body from its properties.
pub type NodeFactory = Arc<
    dyn Fn(&SharedContext, Option<&serde_json::Value>) -> Result<Box<dyn NodeBody>>
        + Send
        + Sync,
>;

/// Per-node state owned by the executor and lent to every hook.
pub struct NodeContext {
    node_id: Arc<str>,
    kind: String,
    shared: SharedContext,
    ports: HashMap<String, PortSpec>,
    delivery_capacity: usize,
    outputs: HashMap<String, Box<dyn ErasedConnection>>,
    inputs: HashMap<String, BoxedChannel>,
    consumer_ids: HashMap<String, Vec<ChannelId>>,
    linked: HashSet<String>,
    cycle: HashSet<String>,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
}

impl NodeContext {
    pub fn new(
        node_id: impl Into<Arc<str>>,
        kind: impl Into<String>,
        shared: SharedContext,
        ports: Vec<PortSpec>,
        delivery_capacity: usize,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            kind: kind.into(),
            shared,
            ports: ports.into_iter().map(|spec| (spec.id.to_string(), spec)).collect(),
            delivery_capacity,
            outputs: HashMap::new(),
            inputs: HashMap::new(),
            consumer_ids: HashMap::new(),
            linked: HashSet::new(),
            cycle: HashSet::new(),
            tasks: JoinSet::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub const fn shared(&self) -> &SharedContext {
        &self.shared
    }

    pub fn port(&self, port: &str) -> Option<&PortSpec> {
        self.ports.get(port)
    }

    /// Typed handle to the connection behind an output port, created on first use.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::Topology` if `key` is not an output of this node or
    /// names a different payload type than the port declaration.
    pub fn connection<T: Send + Sync + 'static>(&mut self, key: &Key<T>) -> Result<Connection<T>> {
        let node_id = Arc::clone(&self.node_id);
        self.ensure_output(key.id())?.as_any().downcast_ref::<Connection<T>>().cloned().ok_or_else(
            || {
                NodeFlowError::Topology(format!(
                    "output '{}' on node '{node_id}' does not carry {}",
                    key.id(),
                    std::any::type_name::<T>()
                ))
            },
        )
    }

    /// Typed handle to the channel feeding an input port, if it is linked.
    pub fn channel<T: Send + Sync + 'static>(&self, key: &Key<T>) -> Option<Channel<T>> {
        self.inputs.get(key.id())?.as_any().downcast_ref::<Channel<T>>().cloned()
    }

    /// Whether `port` currently has at least one link.
    pub fn linked(&self, port: &str) -> bool {
        self.linked.contains(port)
    }

    /// Whether `port` is an endpoint of a link on a feedback cycle.
    pub fn cycle(&self, port: &str) -> bool {
        self.cycle.contains(port)
    }

    /// Token cancelled when the node is released.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// A token cancelled on release or when the caller cancels it, e.g. on pause.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Runs `task` until it finishes or the node is released.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        while self.tasks.try_join_next().is_some() {}
        self.tasks.spawn(task);
    }

    pub fn running_tasks(&self) -> usize {
        self.tasks.len()
    }

    fn ensure_output(&mut self, port: &str) -> Result<&dyn ErasedConnection> {
        let spec = self.ports.get(port).ok_or_else(|| {
            NodeFlowError::Topology(format!("node '{}' has no port '{port}'", self.node_id))
        })?;
        if spec.direction != PortDirection::Output {
            return Err(NodeFlowError::Topology(format!(
                "port '{port}' on node '{}' is not an output",
                self.node_id
            )));
        }
        if !self.outputs.contains_key(port) {
            let connection = spec.build_connection(self.delivery_capacity).ok_or_else(|| {
                NodeFlowError::Topology(format!("output '{port}' declares no connection type"))
            })?;
            self.outputs.insert(port.to_string(), connection);
        }
        self.outputs
            .get(port)
            .map(AsRef::as_ref)
            .ok_or_else(|| NodeFlowError::Runtime(format!("output '{port}' vanished")))
    }

    /// Registers a consumer on an output port and marks it linked.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::Topology` for unknown or non-output ports, or when a
    /// single-consumer port is already linked.
    pub fn attach_consumer(&mut self, port: &str) -> Result<BoxedChannel> {
        let channel = self.ensure_output(port)?.add_consumer()?;
        self.consumer_ids.entry(port.to_string()).or_default().push(channel.id());
        self.linked.insert(port.to_string());
        Ok(channel)
    }

    /// Removes one consumer registration from an output port.
    ///
    /// The connection stays so the body keeps producing into it; with no consumers
    /// left its events retire straight back to the pool. Returns whether the port
    /// is still linked.
    pub fn detach_consumer(&mut self, port: &str, id: ChannelId) -> bool {
        if let Some(connection) = self.outputs.get(port) {
            connection.remove_consumer(id);
        }
        let remaining = self.consumer_ids.get_mut(port).map_or(0, |ids| {
            ids.retain(|existing| *existing != id);
            ids.len()
        });
        if remaining == 0 {
            self.consumer_ids.remove(port);
            self.linked.remove(port);
        }
        remaining > 0
    }

    /// Records the channel feeding an input port.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::Topology` for unknown or non-input ports, a payload
    /// type mismatch, or an input that is already fed.
    pub fn attach_input(&mut self, port: &str, channel: BoxedChannel) -> Result<()> {
        let spec = self.ports.get(port).ok_or_else(|| {
            NodeFlowError::Topology(format!("node '{}' has no port '{port}'", self.node_id))
        })?;
        if spec.direction != PortDirection::Input {
            return Err(NodeFlowError::Topology(format!(
                "port '{port}' on node '{}' is not an input",
                self.node_id
            )));
        }
        if spec.payload_type() != channel.payload_type() {
            return Err(NodeFlowError::Topology(format!(
                "input '{port}' on node '{}' expects {}",
                self.node_id,
                spec.payload_name()
            )));
        }
        if self.inputs.contains_key(port) {
            return Err(NodeFlowError::Topology(format!(
                "input '{port}' on node '{}' is already linked",
                self.node_id
            )));
        }
        self.inputs.insert(port.to_string(), channel);
        self.linked.insert(port.to_string());
        Ok(())
    }

    /// Forgets and closes the channel feeding an input port.
    pub fn detach_input(&mut self, port: &str) -> Option<BoxedChannel> {
        self.linked.remove(port);
        let channel = self.inputs.remove(port)?;
        channel.close();
        Some(channel)
    }

    /// Whether a consumer registration or an inbound channel exists on `port`.
    pub fn is_attached(&self, port: &str) -> bool {
        self.inputs.contains_key(port)
            || self.consumer_ids.get(port).is_some_and(|ids| !ids.is_empty())
    }

    pub fn set_linked(&mut self, port: &str, linked: bool) {
        if linked {
            self.linked.insert(port.to_string());
        } else {
            self.linked.remove(port);
        }
    }

    pub fn set_cycle(&mut self, port: &str, cycle: bool) {
        if cycle {
            self.cycle.insert(port.to_string());
        } else {
            self.cycle.remove(port);
        }
    }

    /// Ports with at least one link, sorted.
    pub fn linked_ports(&self) -> Vec<String> {
        let mut ports: Vec<_> = self.linked.iter().cloned().collect();
        ports.sort();
        ports
    }

    /// Cancels the node token and aborts every task started with [`NodeContext::spawn`].
    pub async fn shutdown_tasks(&mut self) {
        self.cancel.cancel();
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
    }

    /// Closes all owned connections and inbound channels.
    pub fn close_all(&mut self) {
        for (_, connection) in self.outputs.drain() {
            connection.close();
        }
        for (_, channel) in self.inputs.drain() {
            channel.close();
        }
        self.consumer_ids.clear();
        self.linked.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::ports::PortCardinality;

    const OUT: Key<u32> = Key::new("out");
    const IN: Key<u32> = Key::new("in");
    const WRONG: Key<String> = Key::new("out");

    fn context(cardinality: PortCardinality) -> NodeContext {
        NodeContext::new(
            "n1",
            "test::node",
            SharedContext::default(),
            vec![PortSpec::output(OUT, "number", cardinality), PortSpec::input(IN, "number")],
            4,
        )
    }

    #[tokio::test]
    async fn test_connection_created_lazily() {
        let mut ctx = context(PortCardinality::Broadcast);
        let first = ctx.connection(&OUT).unwrap();
        first.prime(Event::new(1));
        let again = ctx.connection(&OUT).unwrap();
        assert!(again.poll().is_some(), "both handles share one connection");

        assert!(matches!(ctx.connection(&WRONG), Err(NodeFlowError::Topology(_))));
        assert!(matches!(ctx.connection(&IN), Err(NodeFlowError::Topology(_))));
    }

    #[tokio::test]
    async fn test_consumer_bookkeeping() {
        let mut ctx = context(PortCardinality::Broadcast);
        let a = ctx.attach_consumer("out").unwrap();
        let b = ctx.attach_consumer("out").unwrap();
        assert!(ctx.linked("out"));
        assert!(ctx.is_attached("out"));
        assert_eq!(ctx.connection(&OUT).unwrap().consumer_count(), 2);

        assert!(ctx.detach_consumer("out", a.id()));
        assert!(!ctx.detach_consumer("out", b.id()));
        assert!(!ctx.linked("out"));
        assert!(!ctx.is_attached("out"));
        assert_eq!(ctx.connection(&OUT).unwrap().consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_single_output_rejects_second_link() {
        let mut ctx = context(PortCardinality::One);
        let _a = ctx.attach_consumer("out").unwrap();
        assert!(ctx.attach_consumer("out").is_err());
    }

    #[tokio::test]
    async fn test_input_attach_and_detach() {
        let mut producer = context(PortCardinality::Broadcast);
        let mut consumer = context(PortCardinality::Broadcast);

        let channel = producer.attach_consumer("out").unwrap();
        consumer.attach_input("in", channel).unwrap();
        assert!(consumer.linked("in"));
        let typed = consumer.channel(&IN).unwrap();

        let extra = producer.attach_consumer("out").unwrap();
        assert!(consumer.attach_input("in", extra).is_err(), "input accepts one link");

        let wrong = Connection::<String>::broadcast(1).consumer().unwrap();
        let mut fresh = context(PortCardinality::Broadcast);
        assert!(fresh.attach_input("in", Box::new(wrong)).is_err());

        assert!(consumer.detach_input("in").is_some());
        assert!(!consumer.linked("in"));
        assert!(typed.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_stops_tasks() {
        let mut ctx = context(PortCardinality::Broadcast);
        let token = ctx.cancellation_token();
        ctx.spawn(async move { token.cancelled().await });
        ctx.spawn(std::future::pending());
        assert_eq!(ctx.running_tasks(), 2);

        ctx.set_cycle("out", true);
        assert!(ctx.cycle("out"));

        ctx.shutdown_tasks().await;
        ctx.close_all();
        assert_eq!(ctx.running_tasks(), 0);
        assert!(ctx.cancellation_token().is_cancelled());
    }
}
