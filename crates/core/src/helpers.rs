// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Utility functions for node bodies.
//!
//! - [`config_helpers`]: Parse node properties from JSON
//! - [`pool_helpers`]: Size and seed an output's free-event pool

use crate::error::NodeFlowError;

/// Helper functions for parsing node properties from JSON values.
pub mod config_helpers {
    use super::NodeFlowError;
    use serde::Deserialize;

    /// Parses properties from an optional JSON value, using defaults if not provided.
    ///
    /// Malformed properties are rejected rather than silently replaced by defaults.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::Configuration` if `params` is present but does not
    /// deserialize into `T`.
    pub fn parse_config_optional<T>(params: Option<&serde_json::Value>) -> Result<T, NodeFlowError>
    where
        T: for<'de> Deserialize<'de> + Default,
    {
        match params {
            None | Some(serde_json::Value::Null) => Ok(T::default()),
            Some(value) => T::deserialize(value).map_err(|e| {
                NodeFlowError::Configuration(format!("Failed to parse properties: {e}"))
            }),
        }
    }

    /// Parses properties from an optional JSON value, returning an error if not provided.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::Configuration` if `params` is `None` or if deserialization fails.
    pub fn parse_config_required<T>(params: Option<&serde_json::Value>) -> Result<T, NodeFlowError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let value = params
            .ok_or_else(|| NodeFlowError::Configuration("Properties required".to_string()))?;
        T::deserialize(value)
            .map_err(|e| NodeFlowError::Configuration(format!("Failed to parse properties: {e}")))
    }

    /// Parses properties with the node kind in the error message.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::Configuration` if `params` is `None` or if deserialization fails.
    pub fn parse_config_with_context<T>(
        params: Option<&serde_json::Value>,
        context: &str,
    ) -> Result<T, NodeFlowError>
    where
        T: for<'de> Deserialize<'de>,
    {
        params.map_or_else(
            || Err(NodeFlowError::Configuration(format!("{context} properties required"))),
            |p| {
                T::deserialize(p).map_err(|e| {
                    NodeFlowError::Configuration(format!("Failed to parse {context}: {e}"))
                })
            },
        )
    }
}

/// Free-pool sizing for output connections.
pub mod pool_helpers {
    use crate::connection::Connection;
    use crate::event::Event;

    /// Events a producer needs so that every consumer can hold one while one more is
    /// in the delivery queue.
    pub const fn pool_size_for(consumers: usize, delivery_capacity: usize) -> usize {
        consumers.saturating_mul(delivery_capacity).saturating_add(1)
    }

    /// Primes `connection` with `count` default events.
    pub fn prime_default<T>(connection: &Connection<T>, count: usize)
    where
        T: Default + Send + Sync + 'static,
    {
        connection.prime_with(count, || Event::new(T::default()));
    }
}
