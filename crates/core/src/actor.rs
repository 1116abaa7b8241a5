// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Mailbox-based actor plumbing shared by the node and network executors.
//!
//! An actor is a task that owns its state and processes one message at a time
//! from a bounded mailbox. Requests carry a `oneshot` reply sender; the caller of
//! [`ActorRef::call`] resumes only after the actor has finished the operation, so
//! its effects are visible on return. Different actors run in parallel.

use crate::error::{NodeFlowError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Reply half carried inside a request message.
pub type Reply<T> = oneshot::Sender<T>;

/// Cloneable sender side of an actor's mailbox.
pub struct ActorRef<M> {
    tx: mpsc::Sender<M>,
    name: Arc<str>,
}

impl<M> Clone for ActorRef<M> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone(), name: Arc::clone(&self.name) }
    }
}

impl<M> std::fmt::Debug for ActorRef<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorRef").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Creates a mailbox for an actor named `name`.
///
/// The receiver goes to the actor task; the [`ActorRef`] to its clients.
pub fn mailbox<M>(name: impl Into<Arc<str>>, capacity: usize) -> (ActorRef<M>, mpsc::Receiver<M>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ActorRef { tx, name: name.into() }, rx)
}

impl<M: Send + 'static> ActorRef<M> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends a request built around a reply sender and waits for the answer.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::ActorClosed` if the mailbox is closed or the actor
    /// dropped the reply without answering.
    pub async fn call<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(Reply<T>) -> M,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(build(reply_tx)).await.map_err(|_| self.closed())?;
        reply_rx.await.map_err(|_| self.closed())
    }

    /// [`ActorRef::call`] bounded by `limit`, covering both the mailbox wait and the reply.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::Timeout` when `limit` elapses, otherwise as [`ActorRef::call`].
    pub async fn call_with_timeout<T, F>(&self, limit: Duration, build: F) -> Result<T>
    where
        F: FnOnce(Reply<T>) -> M,
    {
        match tokio::time::timeout(limit, self.call(build)).await {
            Ok(result) => result,
            Err(_) => Err(NodeFlowError::Timeout(format!(
                "{} did not answer within {}ms",
                self.name,
                limit.as_millis()
            ))),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn closed(&self) -> NodeFlowError {
        NodeFlowError::ActorClosed(self.name.to_string())
    }
}
