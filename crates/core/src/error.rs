// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for NodeFlow.
//!
//! The variants follow the failure classes the engine distinguishes at runtime:
//! topology-consistency violations are fatal to the operation that hit them,
//! hook failures are isolated per node, resource failures keep a node out of the
//! usable set, and teardown timeouts are reported but never fail a release.

use std::fmt;
use thiserror::Error;

/// Lifecycle hook a node body failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    Setup,
    Connect,
    Disconnect,
    Pause,
    Resume,
    Release,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Setup => "on_setup",
            Self::Connect => "on_connect",
            Self::Disconnect => "on_disconnect",
            Self::Pause => "on_pause",
            Self::Resume => "on_resume",
            Self::Release => "on_release",
        };
        f.write_str(name)
    }
}

/// Main error type for NodeFlow operations.
#[derive(Debug, Error)]
pub enum NodeFlowError {
    /// A reference to a node, port or link that does not exist, or a wiring that
    /// breaks a graph invariant.
    ///
    /// This signals a consistency bug in the caller and is never retried.
    #[error("Topology error: {0}")]
    Topology(String),

    /// The node exists in the graph but failed setup and is not usable.
    #[error("Node '{0}' is unavailable")]
    NodeUnavailable(String),

    /// A node body hook returned an error.
    #[error("Node '{node_id}' failed in {hook}: {message}")]
    Hook { node_id: String, hook: Hook, message: String },

    /// A resource could not be acquired (device busy, rendering context lost).
    #[error("Resource error: {0}")]
    Resource(String),

    /// An operation did not finish within its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The target has been released and accepts no further operations.
    #[error("'{0}' has been released")]
    Released(String),

    /// The actor mailbox behind a handle is gone.
    #[error("Actor '{0}' is no longer running")]
    ActorClosed(String),

    /// Invalid node properties or engine settings.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Runtime failure inside a node body.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Some members of a scatter-gather operation failed.
    ///
    /// The remaining members completed; `errors` holds one entry per failure.
    #[error("{failed} of {total} operations failed: {}", summarize(.errors))]
    FanOut { failed: usize, total: usize, errors: Vec<NodeFlowError> },

    /// I/O error (graph files, device handles).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn summarize(errors: &[NodeFlowError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

impl NodeFlowError {
    /// Wraps a hook failure, keeping resource errors in their own class so that a
    /// failed `on_setup` caused by a busy device is still reported as a resource error.
    pub fn hook(node_id: &str, hook: Hook, err: Self) -> Self {
        match err {
            Self::Resource(_) | Self::Hook { .. } => err,
            other => Self::Hook { node_id: node_id.to_string(), hook, message: other.to_string() },
        }
    }

    /// Collapses per-item results of a fan-out into a single result.
    ///
    /// # Errors
    ///
    /// Returns [`NodeFlowError::FanOut`] when at least one item failed.
    pub fn collect_fan_out<I>(results: I) -> Result<()>
    where
        I: IntoIterator<Item = Result<()>>,
    {
        let mut total = 0;
        let mut errors = Vec::new();
        for result in results {
            total += 1;
            if let Err(e) = result {
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self::FanOut { failed: errors.len(), total, errors })
        }
    }

    pub const fn is_topology(&self) -> bool {
        matches!(self, Self::Topology(_))
    }
}

/// Convenience type alias for Results using `NodeFlowError`.
pub type Result<T> = std::result::Result<T, NodeFlowError>;

impl From<NodeFlowError> for String {
    fn from(err: NodeFlowError) -> Self {
        err.to_string()
    }
}

// Plain string errors from node bodies default to runtime errors.
impl From<String> for NodeFlowError {
    fn from(s: String) -> Self {
        Self::Runtime(s)
    }
}

impl From<&str> for NodeFlowError {
    fn from(s: &str) -> Self {
        Self::Runtime(s.to_string())
    }
}
