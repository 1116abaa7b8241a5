// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Node lifecycle state machine and state-update records.
//!
//! ## State Machine
//!
//! ```text
//!   (setup) ──▶ Paused ◀──────▶ Resumed
//!                 │                │
//!                 └──▶ Released ◀──┘
//! ```
//!
//! `pause` and `resume` are idempotent. `Released` is terminal.

use crate::error::{NodeFlowError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Execution state of a node executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum NodeLifecycle {
    #[default]
    Paused,
    Resumed,
    Released,
}

impl NodeLifecycle {
    /// Moves to `target`.
    ///
    /// Returns `Ok(false)` when already in `target` so callers can skip the hook.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::Released` when leaving the terminal state.
    pub fn transition(&mut self, target: Self, node_id: &str) -> Result<bool> {
        match (*self, target) {
            (current, target) if current == target => Ok(false),
            (Self::Released, _) => Err(NodeFlowError::Released(node_id.to_string())),
            (_, target) => {
                *self = target;
                Ok(true)
            },
        }
    }

    pub const fn is_released(self) -> bool {
        matches!(self, Self::Released)
    }
}

/// Reported state of a graph node, including nodes that never became usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NodeState {
    Paused,
    Resumed,
    Released,
    /// Setup failed; the node is kept out of the usable set.
    Unavailable { reason: String },
}

impl From<NodeLifecycle> for NodeState {
    fn from(lifecycle: NodeLifecycle) -> Self {
        match lifecycle {
            NodeLifecycle::Paused => Self::Paused,
            NodeLifecycle::Resumed => Self::Resumed,
            NodeLifecycle::Released => Self::Released,
        }
    }
}

/// A state change reported by the network executor.
#[derive(Debug, Clone)]
pub struct NodeStateUpdate {
    pub node_id: String,
    pub state: NodeState,
    pub timestamp: SystemTime,
}

impl NodeStateUpdate {
    #[inline]
    pub fn new(node_id: String, state: NodeState) -> Self {
        Self { node_id, state, timestamp: SystemTime::now() }
    }
}

/// Helpers for emitting state updates to subscribers.
pub mod state_helpers {
    use super::{NodeLifecycle, NodeState, NodeStateUpdate};
    use tokio::sync::mpsc;

    /// Emits a state update. Best-effort: a full or closed channel drops the update.
    #[inline]
    pub fn emit_state(state_tx: &mpsc::Sender<NodeStateUpdate>, node_id: &str, state: NodeState) {
        let _ = state_tx.try_send(NodeStateUpdate::new(node_id.to_string(), state));
    }

    #[inline]
    pub fn emit_lifecycle(
        state_tx: &mpsc::Sender<NodeStateUpdate>,
        node_id: &str,
        lifecycle: NodeLifecycle,
    ) {
        emit_state(state_tx, node_id, lifecycle.into());
    }

    #[inline]
    pub fn emit_unavailable(
        state_tx: &mpsc::Sender<NodeStateUpdate>,
        node_id: &str,
        reason: impl Into<String>,
    ) {
        emit_state(state_tx, node_id, NodeState::Unavailable { reason: reason.into() });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_idempotent() {
        let mut state = NodeLifecycle::default();
        assert!(!state.transition(NodeLifecycle::Paused, "n").unwrap());
        assert!(state.transition(NodeLifecycle::Resumed, "n").unwrap());
        assert!(!state.transition(NodeLifecycle::Resumed, "n").unwrap());
        assert!(state.transition(NodeLifecycle::Paused, "n").unwrap());
    }

    #[test]
    fn test_released_is_terminal() {
        let mut state = NodeLifecycle::Resumed;
        assert!(state.transition(NodeLifecycle::Released, "n").unwrap());
        assert!(!state.transition(NodeLifecycle::Released, "n").unwrap());
        assert!(matches!(
            state.transition(NodeLifecycle::Resumed, "n"),
            Err(NodeFlowError::Released(id)) if id == "n"
        ));
        assert!(state.is_released());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&NodeState::Unavailable { reason: "busy".into() }).unwrap();
        assert_eq!(json, r#"{"state":"unavailable","reason":"busy"}"#);
        assert_eq!(NodeState::from(NodeLifecycle::Resumed), NodeState::Resumed);
    }
}
