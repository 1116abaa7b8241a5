// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Cancellation-aware transport helpers shared by the built-in nodes.

use nodeflow_core::{Channel, Connection, Event, EventShare, NodeContext};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// The body task of a node that moves events while it is resumed.
///
/// Starting a pump cancels the previous one, so a node never runs two loops over
/// the same ports. Pumps are children of the node token and stop on release.
#[derive(Debug, Default)]
pub struct Pump {
    token: Option<CancellationToken>,
}

impl Pump {
    /// Restarts the loop built by `task` with a fresh cancellation token.
    pub fn start<F, Fut>(&mut self, ctx: &mut NodeContext, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stop();
        let token = ctx.child_token();
        self.token = Some(token.clone());
        ctx.spawn(task(token));
    }

    pub fn stop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.token.as_ref().is_some_and(|token| !token.is_cancelled())
    }
}

/// Waits for the next event, or `None` once the channel closes or `token` fires.
pub async fn recv_or_cancel<T>(
    channel: &Channel<T>,
    token: &CancellationToken,
) -> Option<EventShare<T>>
where
    T: Send + Sync + 'static,
{
    tokio::select! {
        biased;
        () = token.cancelled() => None,
        share = channel.recv() => share,
    }
}

/// Waits for a free event from the producer's pool, or `None` on close or cancellation.
pub async fn dequeue_or_cancel<T>(
    connection: &Connection<T>,
    token: &CancellationToken,
) -> Option<Event<T>>
where
    T: Send + Sync + 'static,
{
    tokio::select! {
        biased;
        () = token.cancelled() => None,
        event = connection.dequeue() => event,
    }
}

/// Queues `event`; returns false if `token` fired first.
///
/// A cancelled queue still returns the event to the pool once every share that was
/// handed out has been released.
pub async fn queue_or_cancel<T>(
    connection: &Connection<T>,
    event: Event<T>,
    token: &CancellationToken,
) -> bool
where
    T: Send + Sync + 'static,
{
    tokio::select! {
        biased;
        () = token.cancelled() => false,
        () = connection.queue(event) => true,
    }
}
