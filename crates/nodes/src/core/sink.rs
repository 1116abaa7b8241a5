// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

use super::{Tick, TICK};
use crate::streaming_utils::{recv_or_cancel, Pump};
use async_trait::async_trait;
use nodeflow_core::{
    config_helpers, Channel, EventShare, Key, NodeBody, NodeContext, PortSpec, Result,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const IN: Key<Tick> = Key::new("in");

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct SinkConfig {
    /// Milliseconds to hold each event before releasing it; simulates a slow consumer
    pub hold_ms: u64,
    /// Log progress every N events (0 disables)
    pub log_every: u64,
}

/// Counters shared between a [`SinkNode`] and whoever observes it.
#[derive(Debug, Clone, Default)]
pub struct SinkProbe {
    received: Arc<AtomicU64>,
    last_sequence: Arc<AtomicU64>,
    out_of_order: Arc<AtomicU64>,
    end_of_stream: Arc<AtomicBool>,
}

impl SinkProbe {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Acquire)
    }

    /// Events whose sequence number was lower than the one before.
    pub fn out_of_order(&self) -> u64 {
        self.out_of_order.load(Ordering::Acquire)
    }

    pub fn saw_end_of_stream(&self) -> bool {
        self.end_of_stream.load(Ordering::Acquire)
    }

    fn record(&self, share: &EventShare<Tick>) -> u64 {
        let previous = self.last_sequence.swap(share.sequence_count, Ordering::AcqRel);
        let count = self.received.fetch_add(1, Ordering::AcqRel) + 1;
        if count > 1 && share.sequence_count < previous {
            self.out_of_order.fetch_add(1, Ordering::AcqRel);
        }
        if share.end_of_stream {
            self.end_of_stream.store(true, Ordering::Release);
        }
        count
    }
}

/// Terminates a branch: counts every event and releases it.
pub struct SinkNode {
    config: SinkConfig,
    probe: SinkProbe,
    pump: Pump,
    resumed: bool,
}

impl SinkNode {
    /// # Errors
    ///
    /// Returns an error if the properties cannot be parsed.
    pub fn new(params: Option<&serde_json::Value>) -> Result<Self> {
        Self::with_probe(params, SinkProbe::default())
    }

    /// Like [`SinkNode::new`], reporting into an existing probe.
    ///
    /// # Errors
    ///
    /// Returns an error if the properties cannot be parsed.
    pub fn with_probe(params: Option<&serde_json::Value>, probe: SinkProbe) -> Result<Self> {
        let config: SinkConfig = config_helpers::parse_config_optional(params)?;
        Ok(Self { config, probe, pump: Pump::default(), resumed: false })
    }

    pub fn probe(&self) -> SinkProbe {
        self.probe.clone()
    }

    pub fn ports() -> Vec<PortSpec> {
        vec![PortSpec::input(IN, TICK)]
    }

    fn restart(&mut self, ctx: &mut NodeContext) {
        let Some(input) = ctx.channel(&IN) else {
            self.pump.stop();
            return;
        };
        let probe = self.probe.clone();
        let hold = Duration::from_millis(self.config.hold_ms);
        let log_every = self.config.log_every;
        self.pump.start(ctx, move |token| sink_loop(input, probe, hold, log_every, token));
    }
}

#[async_trait]
impl NodeBody for SinkNode {
    fn ports(&self) -> Vec<PortSpec> {
        Self::ports()
    }

    async fn on_connect(
        &mut self,
        ctx: &mut NodeContext,
        port: &str,
        is_producer: bool,
    ) -> Result<()> {
        if !is_producer && port == IN.id() && self.resumed {
            self.restart(ctx);
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
        self.restart(ctx);
        Ok(())
    }

    async fn on_pause(&mut self, _ctx: &mut NodeContext) -> Result<()> {
        self.resumed = false;
        self.pump.stop();
        Ok(())
    }

    async fn on_release(&mut self, _ctx: &mut NodeContext) -> Result<()> {
        self.pump.stop();
        tracing::info!(
            received = self.probe.received(),
            out_of_order = self.probe.out_of_order(),
            "Sink released"
        );
        Ok(())
    }
}

async fn sink_loop(
    input: Channel<Tick>,
    probe: SinkProbe,
    hold: Duration,
    log_every: u64,
    token: CancellationToken,
) {
    while let Some(share) = recv_or_cancel(&input, &token).await {
        if !hold.is_zero() {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                () = tokio::time::sleep(hold) => {},
            }
        }

        let count = probe.record(&share);
        if share.end_of_stream {
            tracing::debug!(sequence = share.sequence_count, "End of stream");
        }
        share.release();

        if log_every > 0 && count % log_every == 0 {
            tracing::info!(received = count, "Sink progress");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use nodeflow_core::{Connection, Event, SharedContext};

    #[tokio::test]
    async fn test_counts_and_releases() {
        let mut node = SinkNode::new(None).unwrap();
        let probe = node.probe();
        let mut ctx =
            NodeContext::new("sink", "core::sink", SharedContext::default(), SinkNode::ports(), 4);

        let upstream = Connection::<Tick>::single(2);
        ctx.attach_input("in", Box::new(upstream.consumer().unwrap())).unwrap();
        node.on_resume(&mut ctx).await.unwrap();

        for sequence in 0..4 {
            let mut event = Event::new(Tick::default());
            event.stamp(sequence, 0);
            if sequence == 3 {
                event.mark_end_of_stream();
            }
            upstream.queue(event).await;
        }

        // Every event comes back to the producer's pool.
        for _ in 0..4 {
            let returned = tokio::time::timeout(Duration::from_secs(1), upstream.dequeue())
                .await
                .unwrap();
            assert!(returned.is_some());
        }

        assert_eq!(probe.received(), 4);
        assert_eq!(probe.last_sequence(), 3);
        assert_eq!(probe.out_of_order(), 0);
        assert!(probe.saw_end_of_stream());

        node.on_release(&mut ctx).await.unwrap();
        ctx.shutdown_tasks().await;
    }

    #[tokio::test]
    async fn test_connect_while_paused_does_not_start() {
        let mut node = SinkNode::new(Some(&serde_json::json!({ "hold_ms": 5 }))).unwrap();
        let mut ctx =
            NodeContext::new("sink", "core::sink", SharedContext::default(), SinkNode::ports(), 4);
        let upstream = Connection::<Tick>::single(2);
        ctx.attach_input("in", Box::new(upstream.consumer().unwrap())).unwrap();

        node.on_connect(&mut ctx, "in", false).await.unwrap();
        assert_eq!(ctx.running_tasks(), 0);

        node.on_resume(&mut ctx).await.unwrap();
        assert_eq!(ctx.running_tasks(), 1);
        node.on_pause(&mut ctx).await.unwrap();
        ctx.shutdown_tasks().await;
    }
}
