// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Configuration for the network executor.

use crate::constants::{
    DEFAULT_DELIVERY_CAPACITY, DEFAULT_HOOK_GRACE_TIMEOUT, DEFAULT_NETWORK_MAILBOX_CAPACITY,
    DEFAULT_NODE_MAILBOX_CAPACITY, DEFAULT_RELEASE_TIMEOUT,
};
use nodeflow_core::SharedContext;
use std::time::Duration;

/// Configuration for one network executor.
#[derive(Debug, Clone)]
pub struct NetworkExecutorConfig {
    /// Name used in logs (default: "network")
    pub name: Option<String>,
    /// Per-consumer delivery queue capacity (default: 4 events)
    /// Lower = earlier backpressure, higher = more buffered latency
    pub delivery_capacity: Option<usize>,
    /// Mailbox capacity of each node executor (default: 32)
    pub mailbox_capacity: Option<usize>,
    /// Bound on a whole node release before its task is aborted (default: 5s)
    pub release_timeout: Duration,
    /// Bound on a node's `on_release` hook (default: 2s)
    pub hook_grace_timeout: Duration,
    /// Affinity worker and device registry shared by the graph's nodes.
    /// A fresh context is created when `None`.
    pub shared: Option<SharedContext>,
}

impl Default for NetworkExecutorConfig {
    fn default() -> Self {
        Self {
            name: None,
            delivery_capacity: None, // Uses DEFAULT_DELIVERY_CAPACITY when None
            mailbox_capacity: None,  // Uses DEFAULT_NODE_MAILBOX_CAPACITY when None
            release_timeout: DEFAULT_RELEASE_TIMEOUT,
            hook_grace_timeout: DEFAULT_HOOK_GRACE_TIMEOUT,
            shared: None,
        }
    }
}

/// Settings every node executor of one network is spawned with.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeSettings {
    pub delivery_capacity: usize,
    pub mailbox_capacity: usize,
    pub release_timeout: Duration,
    pub hook_grace_timeout: Duration,
}

impl NetworkExecutorConfig {
    pub(crate) fn node_settings(&self) -> NodeSettings {
        let release_timeout = self.release_timeout.max(Duration::from_millis(1));
        NodeSettings {
            delivery_capacity: self.delivery_capacity.unwrap_or(DEFAULT_DELIVERY_CAPACITY).max(1),
            mailbox_capacity: self.mailbox_capacity.unwrap_or(DEFAULT_NODE_MAILBOX_CAPACITY).max(1),
            release_timeout,
            hook_grace_timeout: self.hook_grace_timeout.min(release_timeout),
        }
    }

    pub(crate) const fn network_mailbox_capacity() -> usize {
        DEFAULT_NETWORK_MAILBOX_CAPACITY
    }
}
