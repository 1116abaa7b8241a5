// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Unit tests for the engine crate.
//!
//! The fixtures register a single `test::recording` kind whose hooks append to a
//! shared log and whose behaviour is driven by node properties.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod node_lifecycle;

use crate::{Engine, NetworkExecutorConfig, NetworkHandle};
use nodeflow_api::{Link, LinkId, Network, Node};
use nodeflow_core::{
    async_trait, config_helpers, pool_helpers, DeviceLease, Key, NodeBody, NodeContext,
    NodeFlowError, NodeRegistry, PortCardinality, PortSpec, Result,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(super) const NUMBER: &str = "number";
const IN: Key<u32> = Key::new("in");
const OUT: Key<u32> = Key::new("out");

/// Hook calls and received payloads of every recording node, by node id.
#[derive(Clone, Default)]
pub(super) struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
    received: Arc<Mutex<HashMap<String, Vec<u32>>>>,
}

impl Recorder {
    fn push(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    pub(super) fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub(super) fn count(&self, entry: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|e| *e == entry).count()
    }

    pub(super) fn received(&self, node: &str) -> Vec<u32> {
        self.received.lock().unwrap().get(node).cloned().unwrap_or_default()
    }

    /// Polls until `node` has received `count` payloads or a second has passed.
    pub(super) async fn wait_for(&self, node: &str, count: usize) -> Vec<u32> {
        for _ in 0..100 {
            let received = self.received(node);
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.received(node)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RecordingConfig {
    /// Device leased in `on_setup`.
    device: Option<String>,
    /// Emit payloads 1..=emit on `out` when first resumed.
    emit: u32,
    fail_connect: bool,
    fail_resume: bool,
    hang_pause: bool,
    hang_release: bool,
}

struct RecordingNode {
    config: RecordingConfig,
    recorder: Recorder,
    lease: Option<DeviceLease>,
    emitted: bool,
}

impl RecordingNode {
    fn log(&self, ctx: &NodeContext, entry: &str) {
        self.recorder.push(format!("{}:{entry}", ctx.node_id()));
    }

    fn ports() -> Vec<PortSpec> {
        vec![PortSpec::input(IN, NUMBER), PortSpec::output(OUT, NUMBER, PortCardinality::Broadcast)]
    }
}

#[async_trait]
impl NodeBody for RecordingNode {
    fn ports(&self) -> Vec<PortSpec> {
        Self::ports()
    }

    async fn on_setup(&mut self, ctx: &mut NodeContext) -> Result<()> {
        self.log(ctx, "setup");
        if let Some(device) = &self.config.device {
            self.lease = Some(ctx.shared().devices().acquire(device, ctx.node_id())?);
        }
        pool_helpers::prime_default(&ctx.connection(&OUT)?, 8);
        Ok(())
    }

    async fn on_connect(
        &mut self,
        ctx: &mut NodeContext,
        port: &str,
        is_producer: bool,
    ) -> Result<()> {
        let side = if is_producer { "producer" } else { "consumer" };
        self.log(ctx, &format!("connect:{port}:{side}:cycle={}", ctx.cycle(port)));
        if self.config.fail_connect {
            return Err(NodeFlowError::Runtime("refusing link".to_string()));
        }

        if !is_producer {
            if let Some(channel) = ctx.channel(&IN) {
                let node = ctx.node_id().to_string();
                let received = Arc::clone(&self.recorder.received);
                ctx.spawn(async move {
                    while let Some(share) = channel.recv().await {
                        let mut received = received.lock().unwrap();
                        received.entry(node.clone()).or_default().push(share.payload);
                        drop(received);
                        share.release();
                    }
                });
            }
        }
        Ok(())
    }

    async fn on_disconnect(
        &mut self,
        ctx: &mut NodeContext,
        port: &str,
        is_producer: bool,
    ) -> Result<()> {
        let side = if is_producer { "producer" } else { "consumer" };
        self.log(ctx, &format!("disconnect:{port}:{side}:cycle={}", ctx.cycle(port)));
        Ok(())
    }

    async fn on_resume(&mut self, ctx: &mut NodeContext) -> Result<()> {
        self.log(ctx, "resume");
        if self.config.fail_resume {
            return Err(NodeFlowError::Runtime("cannot resume".to_string()));
        }
        if self.config.emit > 0 && !self.emitted {
            self.emitted = true;
            let out = ctx.connection(&OUT)?;
            let count = self.config.emit;
            ctx.spawn(async move {
                for n in 1..=count {
                    let Some(mut event) = out.dequeue().await else {
                        return;
                    };
                    event.payload = n;
                    event.stamp(u64::from(n), 0);
                    out.queue(event).await;
                }
            });
        }
        Ok(())
    }

    async fn on_pause(&mut self, ctx: &mut NodeContext) -> Result<()> {
        self.log(ctx, "pause");
        if self.config.hang_pause {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn on_release(&mut self, ctx: &mut NodeContext) -> Result<()> {
        self.log(ctx, "release");
        self.lease.take();
        if self.config.hang_release {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

pub(super) const RECORDING: &str = "test::recording";

pub(super) fn registry(recorder: &Recorder) -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    let recorder = recorder.clone();
    registry.register_static(
        RECORDING,
        move |_shared, params| {
            let config: RecordingConfig = config_helpers::parse_config_optional(params)?;
            Ok(Box::new(RecordingNode {
                config,
                recorder: recorder.clone(),
                lease: None,
                emitted: false,
            }) as Box<dyn NodeBody>)
        },
        serde_json::json!({}),
        RecordingNode::ports(),
        vec!["test".to_string()],
        "Records hook calls",
    );
    registry
}

pub(super) fn node(id: &str) -> Node {
    let ports = RecordingNode::ports().iter().map(PortSpec::descriptor).collect();
    Node::new(id, RECORDING, ports)
}

pub(super) fn link_id(from: &str, to: &str) -> LinkId {
    LinkId::new(from, "out", to, "in")
}

pub(super) fn link(from: &str, to: &str) -> Link {
    Link { id: link_id(from, to), in_cycle: false }
}

/// A network of recording nodes wired `out -> in` along `edges`.
pub(super) fn network(nodes: &[Node], edges: &[(&str, &str)]) -> Network {
    let mut network = Network::new();
    for node in nodes {
        network.add_node(node.clone()).unwrap();
    }
    for (from, to) in edges {
        network.add_link(link_id(from, to)).unwrap();
    }
    network
}

pub(super) fn test_config() -> NetworkExecutorConfig {
    NetworkExecutorConfig {
        name: Some("test".to_string()),
        release_timeout: Duration::from_millis(300),
        hook_grace_timeout: Duration::from_millis(100),
        ..NetworkExecutorConfig::default()
    }
}

pub(super) fn start(recorder: &Recorder) -> NetworkHandle {
    start_with(recorder, test_config())
}

pub(super) fn start_with(recorder: &Recorder, config: NetworkExecutorConfig) -> NetworkHandle {
    Engine::with_registry(registry(recorder)).start_network(config)
}
