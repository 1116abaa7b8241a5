// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Payload-agnostic utility nodes.
//!
//! - `core::ticker`: paced source of [`Tick`] events from a primed pool
//! - `core::relay`: forwards events into its own pool; usable on feedback cycles
//! - `core::sink`: counts and releases events

use nodeflow_core::NodeRegistry;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};

pub mod relay;
pub mod sink;
pub mod ticker;

/// Data-type tag of ports carrying [`Tick`].
pub const TICK: &str = "tick";

/// The payload moved by the utility nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    /// Number of times this event passed through a relay.
    pub hops: u32,
}

fn schema_of<T: JsonSchema>(kind: &str) -> serde_json::Value {
    match serde_json::to_value(schema_for!(T)) {
        Ok(schema) => schema,
        Err(e) => {
            tracing::error!(kind, error = %e, "Failed to serialize properties schema");
            serde_json::Value::Null
        },
    }
}

/// Registers the utility nodes with the engine's registry.
pub fn register_core_nodes(registry: &mut NodeRegistry) {
    registry.register_static(
        "core::ticker",
        |_shared, params| Ok(Box::new(ticker::TickerNode::new(params)?)),
        schema_of::<ticker::TickerConfig>("core::ticker"),
        ticker::TickerNode::ports(),
        vec!["core".to_string(), "source".to_string()],
        "Emits tick events at a fixed interval from a primed event pool. \
         Useful as a test source and for driving graphs without capture devices.",
    );

    registry.register_static(
        "core::relay",
        |_shared, params| Ok(Box::new(relay::RelayNode::new(params)?)),
        schema_of::<relay::RelayConfig>("core::relay"),
        relay::RelayNode::ports(),
        vec!["core".to_string()],
        "Forwards events from its input into its own pooled output events. \
         Primes its pool when its output closes a feedback cycle.",
    );

    registry.register_static(
        "core::sink",
        |_shared, params| Ok(Box::new(sink::SinkNode::new(params)?)),
        schema_of::<sink::SinkConfig>("core::sink"),
        sink::SinkNode::ports(),
        vec!["core".to_string(), "observability".to_string()],
        "Counts and releases incoming events. Useful for terminating branches.",
    );
}
