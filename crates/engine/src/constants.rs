// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Default capacities and deadlines for the executors.
//!
//! Engine configs and the CLI config reference these so defaults stay consistent.
//!
//! # Capacity Guidelines
//!
//! Capacities are measured in events, not bytes. A delivery queue holds events that
//! were queued but not yet received by a consumer; the producer suspends once it is
//! full. Together with the size of the producer's primed pool this bounds the
//! latency a slow consumer can add.
//!
//! - **Higher capacity** = more buffering, higher latency, smoother throughput
//! - **Lower capacity** = less buffering, lower latency, earlier backpressure

use std::time::Duration;

// === Transport ===

/// Default per-consumer delivery queue capacity.
///
/// At 30 fps video, 4 queued frames is roughly 133ms of latency per hop.
///
/// Recommended:
/// - Low-latency capture: 1-2
/// - Balanced: 4
/// - Offline processing: 16+
pub const DEFAULT_DELIVERY_CAPACITY: usize = 4;

// === Actor Mailboxes ===

/// Default mailbox capacity of each node executor.
///
/// Node mailboxes only carry lifecycle and wiring requests, never events.
pub const DEFAULT_NODE_MAILBOX_CAPACITY: usize = 32;

/// Default mailbox capacity of the network executor.
///
/// Larger than node mailboxes because editors may batch topology changes.
pub const DEFAULT_NETWORK_MAILBOX_CAPACITY: usize = 128;

/// Default buffer size for state subscriber channels.
pub const DEFAULT_SUBSCRIBER_CHANNEL_CAPACITY: usize = 128;

// === Deadlines ===

/// Upper bound for a whole node release, measured by the caller.
///
/// When it elapses the node's actor task is aborted.
pub const DEFAULT_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for a node's `on_release` hook inside its executor.
///
/// Kept below [`DEFAULT_RELEASE_TIMEOUT`] so body tasks still get cancelled and
/// connections closed after a hook hangs.
pub const DEFAULT_HOOK_GRACE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait for an actor task to finish after it acknowledged shutdown.
pub const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
