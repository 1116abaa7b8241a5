// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Ticker node - emits pooled tick events at a fixed interval

use super::{Tick, TICK};
use crate::streaming_utils::{dequeue_or_cancel, queue_or_cancel, Pump};
use async_trait::async_trait;
use nodeflow_core::{
    config_helpers, pool_helpers, Connection, Key, NodeBody, NodeContext, NodeFlowError,
    PortCardinality, PortSpec, Result,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const OUT: Key<Tick> = Key::new("out");

/// Configuration for the TickerNode
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct TickerConfig {
    /// Time between ticks in milliseconds
    #[schemars(range(min = 1))]
    pub interval_ms: u64,
    /// Events primed into the output pool during setup.
    /// The ticker only ever emits pooled events, so this bounds how many ticks can
    /// be in flight at once.
    #[schemars(range(min = 1))]
    pub pool_size: usize,
    /// Stop after this many ticks; the last one is marked end of stream
    pub limit: Option<u64>,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self { interval_ms: 20, pool_size: 4, limit: None }
    }
}

/// A source that stamps free events from its pool and queues them on `out`.
///
/// The sequence number keeps counting across pause/resume. Uses
/// `MissedTickBehavior::Skip`, so a stalled consumer does not cause a burst once it
/// catches up.
pub struct TickerNode {
    config: TickerConfig,
    next_sequence: Arc<AtomicU64>,
    pump: Pump,
}

impl TickerNode {
    /// Creates a new ticker node.
    ///
    /// # Errors
    ///
    /// Returns an error if the properties cannot be parsed or are out of range.
    pub fn new(params: Option<&serde_json::Value>) -> Result<Self> {
        let config: TickerConfig = config_helpers::parse_config_optional(params)?;

        if config.interval_ms == 0 {
            return Err(NodeFlowError::Configuration(
                "interval_ms must be greater than 0".to_string(),
            ));
        }
        if config.pool_size == 0 {
            return Err(NodeFlowError::Configuration(
                "pool_size must be greater than 0".to_string(),
            ));
        }

        Ok(Self { config, next_sequence: Arc::new(AtomicU64::new(0)), pump: Pump::default() })
    }

    pub fn ports() -> Vec<PortSpec> {
        vec![PortSpec::output(OUT, TICK, PortCardinality::Broadcast)]
    }

    /// Number of ticks emitted so far.
    pub fn emitted(&self) -> u64 {
        self.next_sequence.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl NodeBody for TickerNode {
    fn ports(&self) -> Vec<PortSpec> {
        Self::ports()
    }

    async fn on_setup(&mut self, ctx: &mut NodeContext) -> Result<()> {
        let out = ctx.connection(&OUT)?;
        pool_helpers::prime_default(&out, self.config.pool_size);
        tracing::debug!(pool_size = self.config.pool_size, "Ticker pool primed");
        Ok(())
    }

    async fn on_resume(&mut self, ctx: &mut NodeContext) -> Result<()> {
        let out = ctx.connection(&OUT)?;
        let period = Duration::from_millis(self.config.interval_ms);
        let limit = self.config.limit;
        let next_sequence = Arc::clone(&self.next_sequence);

        tracing::info!(
            interval_ms = self.config.interval_ms,
            limit = ?limit,
            "Ticker starting"
        );
        self.pump.start(ctx, move |token| tick_loop(out, period, limit, next_sequence, token));
        Ok(())
    }

    async fn on_pause(&mut self, _ctx: &mut NodeContext) -> Result<()> {
        self.pump.stop();
        Ok(())
    }

    async fn on_release(&mut self, _ctx: &mut NodeContext) -> Result<()> {
        self.pump.stop();
        tracing::debug!(emitted = self.emitted(), "Ticker released");
        Ok(())
    }
}

async fn tick_loop(
    out: Connection<Tick>,
    period: Duration,
    limit: Option<u64>,
    next_sequence: Arc<AtomicU64>,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => return,
            _ = interval.tick() => {},
        }

        let Some(mut event) = dequeue_or_cancel(&out, &token).await else {
            return;
        };

        let sequence = next_sequence.load(Ordering::Relaxed);
        if limit.is_some_and(|limit| sequence >= limit) {
            tracing::debug!(sequence, "Tick limit reached");
            out.prime(event);
            return;
        }
        next_sequence.store(sequence + 1, Ordering::Relaxed);

        event.reset();
        event.payload = Tick::default();
        event.stamp_now(sequence);
        if limit.is_some_and(|limit| sequence + 1 >= limit) {
            event.mark_end_of_stream();
        }

        if !queue_or_cancel(&out, event, &token).await {
            return;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use nodeflow_core::SharedContext;

    fn context() -> NodeContext {
        NodeContext::new("ticker", "core::ticker", SharedContext::default(), TickerNode::ports(), 4)
    }

    #[test]
    fn test_rejects_bad_properties() {
        let zero = serde_json::json!({ "interval_ms": 0 });
        assert!(TickerNode::new(Some(&zero)).is_err());
        let unknown = serde_json::json!({ "rate": 5 });
        assert!(TickerNode::new(Some(&unknown)).is_err());
        assert!(TickerNode::new(None).is_ok());
    }

    #[tokio::test]
    async fn test_emits_sequenced_ticks_until_limit() {
        let params = serde_json::json!({ "interval_ms": 1, "pool_size": 2, "limit": 5 });
        let mut node = TickerNode::new(Some(&params)).unwrap();
        let mut ctx = context();
        node.on_setup(&mut ctx).await.unwrap();

        let channel = ctx.connection(&OUT).unwrap().consumer().unwrap();
        node.on_resume(&mut ctx).await.unwrap();

        let mut sequences = Vec::new();
        loop {
            let share = tokio::time::timeout(Duration::from_secs(2), channel.recv())
                .await
                .unwrap()
                .unwrap();
            sequences.push(share.sequence_count);
            let done = share.end_of_stream;
            share.release();
            if done {
                break;
            }
        }
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
        assert_eq!(node.emitted(), 5);

        node.on_release(&mut ctx).await.unwrap();
        ctx.shutdown_tasks().await;
    }

    #[tokio::test]
    async fn test_pause_stops_the_loop() {
        let params = serde_json::json!({ "interval_ms": 1 });
        let mut node = TickerNode::new(Some(&params)).unwrap();
        let mut ctx = context();
        node.on_setup(&mut ctx).await.unwrap();
        node.on_resume(&mut ctx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        node.on_pause(&mut ctx).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let after_pause = node.emitted();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(node.emitted(), after_pause);
        assert!(after_pause > 0, "no consumer means ticks retire straight to the pool");
    }
}
