// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Client handle for a running node executor.

use crate::constants::TASK_JOIN_TIMEOUT;
use crate::messages::{NodeCommand, NodeStatus};
use crate::network_config::NodeSettings;
use crate::node_executor::NodeExecutor;
use nodeflow_core::{
    mailbox, ActorRef, BoxedChannel, ChannelId, NodeBody, NodeContext, NodeFlowError, Reply,
    Result, SharedContext,
};
use opentelemetry::metrics::Counter;
use opentelemetry::KeyValue;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// A handle to one node executor. Cheap to clone.
#[derive(Clone)]
pub struct NodeHandle {
    id: Arc<str>,
    kind: Arc<str>,
    actor: ActorRef<NodeCommand>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
    release_timeout: Duration,
    teardown_timeouts: Counter<u64>,
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl NodeHandle {
    /// Spawns the executor for `body` on the current runtime.
    pub(crate) fn spawn(
        id: &str,
        kind: &str,
        body: Box<dyn NodeBody>,
        shared: SharedContext,
        settings: NodeSettings,
        teardown_timeouts: Counter<u64>,
    ) -> Self {
        let ctx = NodeContext::new(id, kind, shared, body.ports(), settings.delivery_capacity);
        let executor = NodeExecutor::new(body, ctx, settings.hook_grace_timeout);
        let (actor, rx) = mailbox(format!("node '{id}'"), settings.mailbox_capacity);

        let span = tracing::info_span!("node", node.id = %id, node.kind = %kind);
        let task = tokio::spawn(executor.run(rx).instrument(span));

        Self {
            id: Arc::from(id),
            kind: Arc::from(kind),
            actor,
            task: Arc::new(Mutex::new(Some(task))),
            release_timeout: settings.release_timeout,
            teardown_timeouts,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    async fn request<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(Reply<T>) -> NodeCommand,
    {
        self.actor.call(build).await.map_err(|e| match e {
            NodeFlowError::ActorClosed(_) => NodeFlowError::Released(self.id.to_string()),
            other => other,
        })
    }

    /// Runs `on_setup` once. Must succeed before any link is made.
    ///
    /// # Errors
    ///
    /// Returns the hook failure, or `NodeFlowError::Released`.
    pub async fn setup(&self) -> Result<()> {
        self.request(NodeCommand::Setup).await?
    }

    /// Resumes the node. A no-op when already resumed.
    ///
    /// # Errors
    ///
    /// Returns the hook failure, or an error if the node is not set up or released.
    pub async fn resume(&self) -> Result<()> {
        self.request(NodeCommand::Resume).await?
    }

    /// Pauses the node. A no-op when already paused.
    ///
    /// # Errors
    ///
    /// Returns the hook failure, or `NodeFlowError::Released`.
    pub async fn pause(&self) -> Result<()> {
        self.request(NodeCommand::Pause).await?
    }

    /// Pauses the node ahead of its release, bounded by the release timeout.
    ///
    /// A timeout is logged and counted; the caller goes on to [`NodeHandle::release`],
    /// which aborts the stuck executor.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::Timeout` when `on_pause` does not finish in time, or
    /// as [`NodeHandle::pause`].
    pub async fn pause_for_teardown(&self) -> Result<()> {
        match self.actor.call_with_timeout(self.release_timeout, NodeCommand::Pause).await {
            Ok(result) => result,
            Err(NodeFlowError::ActorClosed(_)) => Err(NodeFlowError::Released(self.id.to_string())),
            Err(e) => {
                tracing::warn!(
                    node_id = %self.id,
                    kind = %self.kind,
                    error = %e,
                    "Node did not pause in time, releasing it"
                );
                self.teardown_timeouts.add(1, &[KeyValue::new("kind", self.kind.to_string())]);
                Err(e)
            },
        }
    }

    /// Registers a new consumer on an output port and returns its channel.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::Topology` for a bad port or a second consumer on a
    /// single-consumer port, or the `on_connect` failure.
    pub async fn get_consumer(&self, port: &str) -> Result<BoxedChannel> {
        let port = port.to_string();
        self.request(|reply| NodeCommand::GetConsumer { port, reply }).await?
    }

    /// Feeds an input port from `channel`.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::Topology` for a bad port, a payload mismatch or an
    /// input that is already linked, or the `on_connect` failure.
    pub async fn start_consumer(&self, port: &str, channel: BoxedChannel) -> Result<()> {
        let port = port.to_string();
        self.request(|reply| NodeCommand::StartConsumer { port, channel, reply }).await?
    }

    /// Removes one consumer from an output port. Returns whether the port is still linked.
    ///
    /// # Errors
    ///
    /// Returns the `on_disconnect` failure (the consumer is removed regardless), or
    /// `NodeFlowError::Released`.
    pub async fn stop_consumer(&self, port: &str, channel: ChannelId) -> Result<bool> {
        let port = port.to_string();
        self.request(|reply| NodeCommand::StopConsumer { port, channel, reply }).await?
    }

    /// Forgets and closes the channel feeding an input port.
    ///
    /// # Errors
    ///
    /// Returns the `on_disconnect` failure (the channel is closed regardless), or
    /// `NodeFlowError::Released`.
    pub async fn wait_for_consumer(&self, port: &str) -> Result<()> {
        let port = port.to_string();
        self.request(|reply| NodeCommand::WaitForConsumer { port, reply }).await?
    }

    /// Updates the linked and cycle flags of a port. `None` leaves a flag unchanged.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::Released` if the node is gone.
    pub async fn mark_port(
        &self,
        port: &str,
        linked: Option<bool>,
        cycle: Option<bool>,
    ) -> Result<()> {
        let port = port.to_string();
        self.request(|reply| NodeCommand::MarkPort { port, linked, cycle, reply }).await
    }

    /// # Errors
    ///
    /// Returns `NodeFlowError::Released` if the node is gone.
    pub async fn status(&self) -> Result<NodeStatus> {
        self.request(NodeCommand::Status).await
    }

    /// Releases the node, bounded by the release timeout.
    ///
    /// An unresponsive executor is aborted. Idempotent and never fails.
    pub async fn release(&self) {
        let timed_out = match self
            .actor
            .call_with_timeout(self.release_timeout, NodeCommand::Release)
            .await
        {
            Ok(()) | Err(NodeFlowError::ActorClosed(_)) => false,
            Err(e) => {
                tracing::warn!(
                    node_id = %self.id,
                    kind = %self.kind,
                    error = %e,
                    "Node did not release in time, aborting its executor"
                );
                self.teardown_timeouts.add(1, &[KeyValue::new("kind", self.kind.to_string())]);
                true
            },
        };

        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(task) = task else {
            return;
        };
        if timed_out {
            task.abort();
        }
        match tokio::time::timeout(TASK_JOIN_TIMEOUT, task).await {
            Ok(Ok(())) => tracing::debug!(node_id = %self.id, "Node executor finished"),
            Ok(Err(e)) if e.is_cancelled() => {},
            Ok(Err(e)) => tracing::error!(node_id = %self.id, error = %e, "Node executor panicked"),
            Err(_) => tracing::warn!(node_id = %self.id, "Node executor did not stop"),
        }
    }

    pub fn is_released(&self) -> bool {
        self.actor.is_closed()
    }
}
