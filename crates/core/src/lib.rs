// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! NodeFlow Core - transport, node contract and lifecycle types for dataflow graphs.
//!
//! ## Core Modules
//!
//! - [`event`]: Pooled events with stream bookkeeping
//! - [`connection`]: Producer-owned connections, consumer channels, event shares
//! - [`ports`]: Typed port keys and port declarations
//! - [`node`]: NodeBody trait and the per-node context
//! - [`registry`]: Node factory and discovery
//! - [`state`]: Lifecycle state machine and state updates
//! - [`actor`]: Mailbox helpers for serialized actors
//! - [`affinity`]: Dedicated thread for thread-affine resources
//! - [`devices`]: Exclusive device leases
//! - [`error`]: Error types
//! - [`helpers`]: Property parsing and pool sizing
//!
//! ## Quick Start
//!
//! ```ignore
//! use nodeflow_core::{async_trait, Key, NodeBody, NodeContext, PortSpec, PortCardinality};
//!
//! const OUT: Key<u64> = Key::new("out");
//!
//! struct Counter;
//!
//! #[async_trait]
//! impl NodeBody for Counter {
//!     fn ports(&self) -> Vec<PortSpec> {
//!         vec![PortSpec::output(OUT, "count", PortCardinality::Broadcast)]
//!     }
//!
//!     async fn on_setup(&mut self, ctx: &mut NodeContext) -> nodeflow_core::Result<()> {
//!         ctx.connection(&OUT)?.prime_with(4, || Event::new(0));
//!         Ok(())
//!     }
//! }
//! ```

// Re-export async_trait for use in node implementations
pub use async_trait::async_trait;

pub mod actor;
pub mod affinity;
pub mod connection;
pub mod devices;
pub mod error;
pub mod event;
pub mod helpers;
pub mod node;
pub mod ports;
pub mod registry;
pub mod state;

// Error handling
pub use error::{Hook, NodeFlowError, Result};

// Transport
pub use connection::{
    BoxedChannel, Channel, ChannelId, Connection, ErasedChannel, ErasedConnection, EventShare,
};
pub use event::Event;
pub use ports::{Key, PortCardinality, PortDescriptor, PortDirection, PortSpec};

// Node abstractions
pub use node::{NodeBody, NodeContext, NodeFactory, SharedContext};

// Registry and factory
pub use registry::{NodeDefinition, NodeRegistry};

// State tracking
pub use state::{NodeLifecycle, NodeState, NodeStateUpdate};

// Shared resources
pub use affinity::{AffinityWorker, ThreadResources};
pub use devices::{DeviceError, DeviceLease, DeviceRegistry};

pub use actor::{mailbox, ActorRef, Reply};

pub use helpers::{config_helpers, pool_helpers};
pub use state::state_helpers;
