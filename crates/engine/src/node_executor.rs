// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Node executor actor.
//!
//! Owns one node body, its context and its lifecycle state. Requests arrive through
//! the mailbox and run one at a time, so hooks never overlap and every reply is sent
//! after the request's effects are in place.

use crate::messages::{NodeCommand, NodeStatus};
use nodeflow_core::{
    BoxedChannel, ChannelId, Hook, NodeBody, NodeContext, NodeFlowError, NodeLifecycle, Result,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub(crate) struct NodeExecutor {
    node_id: Arc<str>,
    body: Box<dyn NodeBody>,
    ctx: NodeContext,
    lifecycle: NodeLifecycle,
    set_up: bool,
    hook_grace_timeout: Duration,
}

impl NodeExecutor {
    pub(crate) fn new(
        body: Box<dyn NodeBody>,
        ctx: NodeContext,
        hook_grace_timeout: Duration,
    ) -> Self {
        Self {
            node_id: Arc::from(ctx.node_id()),
            body,
            ctx,
            lifecycle: NodeLifecycle::Paused,
            set_up: false,
            hook_grace_timeout,
        }
    }

    /// The actor loop. Ends after a release request or once every handle is dropped.
    pub(crate) async fn run(mut self, mut mailbox: mpsc::Receiver<NodeCommand>) {
        tracing::debug!("Node executor started");

        while let Some(command) = mailbox.recv().await {
            match command {
                NodeCommand::Setup(reply) => {
                    let _ = reply.send(self.setup().await);
                },
                NodeCommand::Resume(reply) => {
                    let _ = reply.send(self.resume().await);
                },
                NodeCommand::Pause(reply) => {
                    let _ = reply.send(self.pause().await);
                },
                NodeCommand::GetConsumer { port, reply } => {
                    let _ = reply.send(self.get_consumer(&port).await);
                },
                NodeCommand::StartConsumer { port, channel, reply } => {
                    let _ = reply.send(self.start_consumer(&port, channel).await);
                },
                NodeCommand::StopConsumer { port, channel, reply } => {
                    let _ = reply.send(self.stop_consumer(&port, channel).await);
                },
                NodeCommand::WaitForConsumer { port, reply } => {
                    let _ = reply.send(self.wait_for_consumer(&port).await);
                },
                NodeCommand::MarkPort { port, linked, cycle, reply } => {
                    // A port with a live registration stays linked.
                    if let Some(linked) = linked {
                        let linked = linked || self.ctx.is_attached(&port);
                        self.ctx.set_linked(&port, linked);
                    }
                    if let Some(cycle) = cycle {
                        self.ctx.set_cycle(&port, cycle);
                    }
                    let _ = reply.send(());
                },
                NodeCommand::Status(reply) => {
                    let _ = reply.send(self.status());
                },
                NodeCommand::Release(reply) => {
                    self.release().await;
                    let _ = reply.send(());
                    break;
                },
            }
        }

        // Every handle went away without releasing the node.
        if !self.lifecycle.is_released() {
            self.release().await;
        }
        tracing::debug!("Node executor stopped");
    }

    fn hook_error(&self, hook: Hook, err: NodeFlowError) -> NodeFlowError {
        let err = NodeFlowError::hook(&self.node_id, hook, err);
        tracing::error!(hook = %hook, error = %err, "Node hook failed");
        err
    }

    fn ensure_live(&self) -> Result<()> {
        if self.lifecycle.is_released() {
            return Err(NodeFlowError::Released(self.node_id.to_string()));
        }
        Ok(())
    }

    fn ensure_set_up(&self) -> Result<()> {
        self.ensure_live()?;
        if !self.set_up {
            return Err(NodeFlowError::Topology(format!(
                "node '{}' has not been set up",
                self.node_id
            )));
        }
        Ok(())
    }

    async fn setup(&mut self) -> Result<()> {
        self.ensure_live()?;
        if self.set_up {
            return Ok(());
        }
        if let Err(e) = self.body.on_setup(&mut self.ctx).await {
            return Err(self.hook_error(Hook::Setup, e));
        }
        self.set_up = true;
        tracing::info!("Node set up");
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        self.ensure_set_up()?;
        if self.lifecycle == NodeLifecycle::Resumed {
            return Ok(());
        }
        if let Err(e) = self.body.on_resume(&mut self.ctx).await {
            return Err(self.hook_error(Hook::Resume, e));
        }
        self.lifecycle.transition(NodeLifecycle::Resumed, &self.node_id)?;
        tracing::debug!("Node resumed");
        Ok(())
    }

    async fn pause(&mut self) -> Result<()> {
        self.ensure_live()?;
        if self.lifecycle == NodeLifecycle::Paused {
            return Ok(());
        }
        if let Err(e) = self.body.on_pause(&mut self.ctx).await {
            return Err(self.hook_error(Hook::Pause, e));
        }
        self.lifecycle.transition(NodeLifecycle::Paused, &self.node_id)?;
        tracing::debug!("Node paused");
        Ok(())
    }

    async fn get_consumer(&mut self, port: &str) -> Result<BoxedChannel> {
        self.ensure_set_up()?;
        let channel = self.ctx.attach_consumer(port)?;
        let id = channel.id();
        tracing::debug!(port, channel = %id, "Consumer attached to output");

        if let Err(e) = self.body.on_connect(&mut self.ctx, port, true).await {
            self.ctx.detach_consumer(port, id);
            return Err(self.hook_error(Hook::Connect, e));
        }
        Ok(channel)
    }

    async fn start_consumer(&mut self, port: &str, channel: BoxedChannel) -> Result<()> {
        self.ensure_set_up()?;
        let id = channel.id();
        self.ctx.attach_input(port, channel)?;
        tracing::debug!(port, channel = %id, "Input linked");

        if let Err(e) = self.body.on_connect(&mut self.ctx, port, false).await {
            self.ctx.detach_input(port);
            return Err(self.hook_error(Hook::Connect, e));
        }
        Ok(())
    }

    async fn stop_consumer(&mut self, port: &str, channel: ChannelId) -> Result<bool> {
        self.ensure_live()?;
        let still_linked = self.ctx.detach_consumer(port, channel);
        tracing::debug!(port, channel = %channel, still_linked, "Consumer detached from output");

        if let Err(e) = self.body.on_disconnect(&mut self.ctx, port, true).await {
            return Err(self.hook_error(Hook::Disconnect, e));
        }
        Ok(still_linked)
    }

    async fn wait_for_consumer(&mut self, port: &str) -> Result<()> {
        self.ensure_live()?;
        if self.ctx.detach_input(port).is_none() {
            tracing::debug!(port, "Input was not linked");
        }

        if let Err(e) = self.body.on_disconnect(&mut self.ctx, port, false).await {
            return Err(self.hook_error(Hook::Disconnect, e));
        }
        Ok(())
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            lifecycle: self.lifecycle,
            set_up: self.set_up,
            linked_ports: self.ctx.linked_ports(),
            running_tasks: self.ctx.running_tasks(),
        }
    }

    /// Runs `on_release` within the grace timeout, then force-stops body tasks and
    /// closes every connection. Never fails.
    async fn release(&mut self) {
        if self.lifecycle.is_released() {
            return;
        }

        if self.set_up {
            let grace = self.hook_grace_timeout;
            match tokio::time::timeout(grace, self.body.on_release(&mut self.ctx)).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => {
                    let _ = self.hook_error(Hook::Release, e);
                },
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = grace.as_millis(),
                        "on_release did not finish in time, forcing teardown"
                    );
                },
            }
        }

        self.ctx.shutdown_tasks().await;
        self.ctx.close_all();
        self.lifecycle = NodeLifecycle::Released;
        tracing::info!("Node released");
    }
}
