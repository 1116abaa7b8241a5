// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

use super::{Tick, TICK};
use crate::streaming_utils::{queue_or_cancel, recv_or_cancel, Pump};
use async_trait::async_trait;
use nodeflow_core::{
    config_helpers, pool_helpers, Channel, Connection, Event, Key, NodeBody, NodeContext,
    NodeFlowError, PortCardinality, PortSpec, Result,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const IN: Key<Tick> = Key::new("in");
const OUT: Key<Tick> = Key::new("out");

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Events primed into the output pool when `out` is on a feedback cycle
    #[schemars(range(min = 1))]
    pub pool_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { pool_size: 4 }
    }
}

/// Copies every input event into an event from its own pool and queues it on `out`,
/// incrementing [`Tick::hops`].
///
/// Outside of cycles the pool fills lazily: when no pooled event is free, a new one
/// is allocated. On a cycle the pool is primed when `out` is linked, since the
/// events it emits may have to come back around before any is returned.
pub struct RelayNode {
    config: RelayConfig,
    pump: Pump,
    resumed: bool,
    primed: bool,
    forwarded: Arc<AtomicU64>,
}

impl RelayNode {
    /// # Errors
    ///
    /// Returns an error if the properties cannot be parsed or `pool_size` is 0.
    pub fn new(params: Option<&serde_json::Value>) -> Result<Self> {
        let config: RelayConfig = config_helpers::parse_config_optional(params)?;
        if config.pool_size == 0 {
            return Err(NodeFlowError::Configuration(
                "pool_size must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            config,
            pump: Pump::default(),
            resumed: false,
            primed: false,
            forwarded: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn ports() -> Vec<PortSpec> {
        vec![
            PortSpec::input(IN, TICK),
            PortSpec::output(OUT, TICK, PortCardinality::Broadcast),
        ]
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    fn restart(&mut self, ctx: &mut NodeContext) -> Result<()> {
        let Some(input) = ctx.channel(&IN) else {
            self.pump.stop();
            return Ok(());
        };
        let out = ctx.connection(&OUT)?;
        let forwarded = Arc::clone(&self.forwarded);
        self.pump.start(ctx, move |token| relay_loop(input, out, forwarded, token));
        Ok(())
    }
}

#[async_trait]
impl NodeBody for RelayNode {
    fn ports(&self) -> Vec<PortSpec> {
        Self::ports()
    }

    async fn on_connect(
        &mut self,
        ctx: &mut NodeContext,
        port: &str,
        is_producer: bool,
    ) -> Result<()> {
        if is_producer && port == OUT.id() && ctx.cycle(port) && !self.primed {
            let out = ctx.connection(&OUT)?;
            pool_helpers::prime_default(&out, self.config.pool_size);
            self.primed = true;
            tracing::debug!(pool_size = self.config.pool_size, "Primed pool for feedback cycle");
        }
        if !is_producer && port == IN.id() && self.resumed {
            self.restart(ctx)?;
        }
        Ok(())
    }

    async fn on_disconnect(
        &mut self,
        _ctx: &mut NodeContext,
        port: &str,
        is_producer: bool,
    ) -> Result<()> {
        if !is_producer && port == IN.id() {
            self.pump.stop();
        }
        Ok(())
    }

    async fn on_resume(&mut self, ctx: &mut NodeContext) -> Result<()> {
        self.resumed = true;
        self.restart(ctx)
    }

    async fn on_pause(&mut self, _ctx: &mut NodeContext) -> Result<()> {
        self.resumed = false;
        self.pump.stop();
        Ok(())
    }

    async fn on_release(&mut self, _ctx: &mut NodeContext) -> Result<()> {
        self.pump.stop();
        tracing::debug!(forwarded = self.forwarded(), "Relay released");
        Ok(())
    }
}

async fn relay_loop(
    input: Channel<Tick>,
    out: Connection<Tick>,
    forwarded: Arc<AtomicU64>,
    token: CancellationToken,
) {
    while let Some(share) = recv_or_cancel(&input, &token).await {
        let mut event = out.poll().unwrap_or_else(|| Event::new(Tick::default()));
        event.copy_header_from(&*share);
        event.payload = Tick { hops: share.payload.hops.saturating_add(1) };
        share.release();

        if !queue_or_cancel(&out, event, &token).await {
            break;
        }
        forwarded.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use nodeflow_core::SharedContext;
    use std::time::Duration;

    fn context() -> NodeContext {
        NodeContext::new("relay", "core::relay", SharedContext::default(), RelayNode::ports(), 4)
    }

    #[tokio::test]
    async fn test_forwards_in_order_and_counts_hops() {
        let mut node = RelayNode::new(None).unwrap();
        let mut ctx = context();
        node.on_setup(&mut ctx).await.unwrap();

        let upstream = Connection::<Tick>::single(4);
        ctx.attach_input("in", Box::new(upstream.consumer().unwrap())).unwrap();
        let downstream = ctx.attach_consumer("out").unwrap();
        let Some(downstream) = downstream.as_any().downcast_ref::<Channel<Tick>>().cloned() else {
            panic!("out carries Tick");
        };
        node.on_connect(&mut ctx, "in", false).await.unwrap();
        node.on_resume(&mut ctx).await.unwrap();

        for sequence in 1..=3 {
            let mut event = Event::new(Tick { hops: 1 });
            event.stamp(sequence, 0);
            upstream.queue(event).await;
        }

        for sequence in 1..=3 {
            let share = tokio::time::timeout(Duration::from_secs(1), downstream.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(share.sequence_count, sequence);
            assert_eq!(share.payload.hops, 2);
            share.release();
        }

        // Inputs are handed back once forwarded.
        let returned = tokio::time::timeout(Duration::from_secs(1), upstream.dequeue())
            .await
            .unwrap();
        assert!(returned.is_some());

        node.on_release(&mut ctx).await.unwrap();
        ctx.shutdown_tasks().await;
        assert_eq!(node.forwarded(), 3);
    }

    #[tokio::test]
    async fn test_primes_pool_only_on_cycle() {
        let mut node = RelayNode::new(Some(&serde_json::json!({ "pool_size": 2 }))).unwrap();
        let mut ctx = context();

        node.on_connect(&mut ctx, "out", true).await.unwrap();
        assert!(ctx.connection(&OUT).unwrap().poll().is_none());

        ctx.set_cycle("out", true);
        node.on_connect(&mut ctx, "out", true).await.unwrap();
        node.on_connect(&mut ctx, "out", true).await.unwrap();
        let out = ctx.connection(&OUT).unwrap();
        assert!(out.poll().is_some());
        assert!(out.poll().is_some());
        assert!(out.poll().is_none(), "pool is primed once");
    }
}
