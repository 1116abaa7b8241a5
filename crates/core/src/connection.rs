// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Event transport between one producer and its consumers.
//!
//! A [`Connection`] is owned by the producing node. Every consumer registered
//! through [`Connection::consumer`] gets its own bounded delivery queue and a
//! return path into the producer's single fan-in return queue, so the producer
//! waits on one receiver no matter how the set of consumers changes.
//!
//! ## Event accounting
//!
//! `queue` hands each consumer registered at that moment an [`EventShare`]. The
//! shares of one dispatch hold clones of a single `Arc<Event<T>>`; dropping or
//! releasing a share gives up its reference, and the share that drops the last
//! reference takes the event back out with `Arc::into_inner` and pushes it onto the
//! return queue. Ownership makes the release happen exactly once per share: a share
//! cannot be released twice, and one that is never consumed (closed channel, removed
//! consumer, dropped delivery buffer) is released by its destructor.
//!
//! With zero consumers the event goes straight back to the return queue, which is
//! how a producer whose last link was removed keeps running without deadlock.

use crate::error::{NodeFlowError, Result};
use crate::event::Event;
use crate::ports::PortCardinality;
use futures::future::join_all;
use std::any::{Any, TypeId};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one consumer registration on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch#{}", self.0)
    }
}

/// One consumer's hold on a dispatched event.
///
/// Read the event through `Deref`. Call [`EventShare::release`] (or drop the share)
/// when done; the last release returns the event to the producer's pool.
pub struct EventShare<T> {
    event: Option<Arc<Event<T>>>,
    returns: mpsc::UnboundedSender<Event<T>>,
}

impl<T> EventShare<T> {
    pub fn release(self) {
        drop(self);
    }

    /// Number of consumers still holding this dispatch, including this one.
    pub fn holders(&self) -> usize {
        self.event.as_ref().map_or(0, Arc::strong_count)
    }
}

impl<T> Deref for EventShare<T> {
    type Target = Event<T>;

    fn deref(&self) -> &Event<T> {
        match self.event.as_deref() {
            Some(event) => event,
            // Only `Drop` takes the event out.
            None => unreachable!("event share accessed after release"),
        }
    }
}

impl<T> Drop for EventShare<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.event.take() {
            if let Some(event) = Arc::into_inner(shared) {
                // A closed return queue means the producer is gone; the event is dropped.
                let _ = self.returns.send(event);
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for EventShare<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventShare").field("event", &self.event).finish_non_exhaustive()
    }
}

struct ChannelShared<T> {
    id: ChannelId,
    rx: tokio::sync::Mutex<mpsc::Receiver<EventShare<T>>>,
    closed: CancellationToken,
}

impl<T> ChannelShared<T> {
    fn close(&self) {
        self.closed.cancel();
        // A receiver holding the lock drains once it lets go of it.
        if let Ok(mut rx) = self.rx.try_lock() {
            Self::drain(&mut rx);
        }
    }

    /// Called by receivers after releasing the lock, so a `close` that raced
    /// with them still retires the buffered shares.
    fn drain_if_closed(&self) -> bool {
        if !self.closed.is_cancelled() {
            return false;
        }
        if let Ok(mut rx) = self.rx.try_lock() {
            Self::drain(&mut rx);
        }
        true
    }

    fn drain(rx: &mut mpsc::Receiver<EventShare<T>>) {
        rx.close();
        while let Ok(share) = rx.try_recv() {
            share.release();
        }
    }
}

/// Receive handle for one consumer registration.
///
/// Cloneable so the consuming node's executor and its body tasks can both hold it;
/// all clones observe the same queue.
pub struct Channel<T> {
    shared: Arc<ChannelShared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T> Channel<T> {
    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once the channel is closed or its producer is gone. Closing
    /// retires every share still buffered for this consumer.
    pub async fn recv(&self) -> Option<EventShare<T>> {
        let closed = &self.shared.closed;
        let mut rx = tokio::select! {
            guard = self.shared.rx.lock() => guard,
            () = closed.cancelled() => {
                self.shared.drain_if_closed();
                return None;
            },
        };
        let share = tokio::select! {
            biased;
            () = closed.cancelled() => {
                ChannelShared::drain(&mut rx);
                return None;
            },
            share = rx.recv() => share,
        };
        drop(rx);
        self.checked(share)
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<EventShare<T>> {
        if self.shared.drain_if_closed() {
            return None;
        }
        let share = self.shared.rx.try_lock().ok()?.try_recv().ok();
        self.checked(share)
    }

    /// Drops `share` and drains the queue if the channel was closed meanwhile.
    fn checked(&self, share: Option<EventShare<T>>) -> Option<EventShare<T>> {
        if self.shared.drain_if_closed() {
            if let Some(share) = share {
                share.release();
            }
            return None;
        }
        share
    }

    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }
}

struct Consumer<T> {
    delivery: mpsc::Sender<EventShare<T>>,
    channel: Arc<ChannelShared<T>>,
}

struct ConnectionInner<T> {
    cardinality: PortCardinality,
    delivery_capacity: usize,
    consumers: Mutex<Vec<Consumer<T>>>,
    returns_tx: mpsc::UnboundedSender<Event<T>>,
    returns_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Event<T>>>,
    closed: CancellationToken,
}

/// Producer side of a port: delivery to consumers plus the free-event pool.
pub struct Connection<T> {
    inner: Arc<ConnectionInner<T>>,
}

impl<T> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Send + Sync + 'static> Connection<T> {
    /// Creates a connection whose delivery queues hold at most `delivery_capacity` events.
    pub fn new(cardinality: PortCardinality, delivery_capacity: usize) -> Self {
        let (returns_tx, returns_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ConnectionInner {
                cardinality,
                delivery_capacity: delivery_capacity.max(1),
                consumers: Mutex::new(Vec::new()),
                returns_tx,
                returns_rx: tokio::sync::Mutex::new(returns_rx),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn single(delivery_capacity: usize) -> Self {
        Self::new(PortCardinality::One, delivery_capacity)
    }

    pub fn broadcast(delivery_capacity: usize) -> Self {
        Self::new(PortCardinality::Broadcast, delivery_capacity)
    }

    pub fn cardinality(&self) -> PortCardinality {
        self.inner.cardinality
    }

    /// Registers a new consumer and returns its receive handle.
    ///
    /// Events queued before this call are never delivered to the new consumer.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::Topology` if the connection only accepts one consumer
    /// and already has it, or `NodeFlowError::Released` if it has been closed.
    pub fn consumer(&self) -> Result<Channel<T>> {
        if self.inner.closed.is_cancelled() {
            return Err(NodeFlowError::Released("connection".to_string()));
        }
        let Ok(mut consumers) = self.inner.consumers.lock() else {
            return Err(NodeFlowError::Runtime("connection consumer list poisoned".to_string()));
        };
        if self.inner.cardinality == PortCardinality::One && !consumers.is_empty() {
            return Err(NodeFlowError::Topology(
                "port accepts a single consumer and is already linked".to_string(),
            ));
        }

        let (delivery, rx) = mpsc::channel(self.inner.delivery_capacity);
        let channel = Arc::new(ChannelShared {
            id: ChannelId::next(),
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
        });
        consumers.push(Consumer { delivery, channel: Arc::clone(&channel) });
        drop(consumers);

        Ok(Channel { shared: channel })
    }

    /// Detaches a consumer registration.
    ///
    /// Shares still buffered for it are retired; shares it already holds return
    /// to the pool when it releases them. Returns `false` if `id` was not registered.
    pub fn remove_consumer(&self, id: ChannelId) -> bool {
        let removed = {
            let Ok(mut consumers) = self.inner.consumers.lock() else {
                return false;
            };
            consumers.iter().position(|c| c.channel.id == id).map(|pos| consumers.remove(pos))
        };
        removed.is_some_and(|consumer| {
            consumer.channel.close();
            true
        })
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.consumers.lock().map_or(0, |consumers| consumers.len())
    }

    /// Dispatches an event to every consumer registered right now.
    ///
    /// Suspends while a consumer's delivery queue is full. A consumer whose channel
    /// closes while the producer waits on it has its share retired instead.
    pub async fn queue(&self, event: Event<T>) {
        let targets: Vec<(mpsc::Sender<EventShare<T>>, CancellationToken)> =
            self.inner.consumers.lock().map_or_else(
                |_| Vec::new(),
                |consumers| {
                    consumers
                        .iter()
                        .map(|c| (c.delivery.clone(), c.channel.closed.clone()))
                        .collect()
                },
            );

        if targets.is_empty() {
            self.retire(event);
            return;
        }

        // All shares exist before any is sent, so the in-flight count starts at the
        // number of targets and no early release can see a stale count.
        let shared = Arc::new(event);
        let shares: Vec<EventShare<T>> = targets
            .iter()
            .map(|_| EventShare {
                event: Some(Arc::clone(&shared)),
                returns: self.inner.returns_tx.clone(),
            })
            .collect();
        drop(shared);

        let mut pending = Vec::new();
        for ((delivery, closed), share) in targets.into_iter().zip(shares) {
            if closed.is_cancelled() {
                share.release();
                continue;
            }
            match delivery.try_send(share) {
                Ok(()) => {},
                Err(TrySendError::Closed(share)) => share.release(),
                Err(TrySendError::Full(share)) => pending.push(async move {
                    tokio::select! {
                        // A failed send hands the share back inside the error; dropping it releases.
                        result = delivery.send(share) => drop(result),
                        () = closed.cancelled() => {},
                    }
                }),
            }
        }

        if !pending.is_empty() {
            join_all(pending).await;
        }
    }

    /// Waits for a fully released event.
    ///
    /// Returns `None` once the connection is closed.
    pub async fn dequeue(&self) -> Option<Event<T>> {
        let closed = &self.inner.closed;
        let mut rx = tokio::select! {
            guard = self.inner.returns_rx.lock() => guard,
            () = closed.cancelled() => return None,
        };
        tokio::select! {
            biased;
            () = closed.cancelled() => None,
            event = rx.recv() => event,
        }
    }

    /// Alias of [`Connection::dequeue`].
    pub async fn receive(&self) -> Option<Event<T>> {
        self.dequeue().await
    }

    /// Non-blocking [`Connection::dequeue`].
    pub fn poll(&self) -> Option<Event<T>> {
        if self.inner.closed.is_cancelled() {
            return None;
        }
        self.inner.returns_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Seeds the free pool so the producer can dequeue before anything was returned.
    pub fn prime(&self, event: Event<T>) {
        self.retire(event);
    }

    /// Seeds the free pool with `count` events built by `factory`.
    pub fn prime_with(&self, count: usize, mut factory: impl FnMut() -> Event<T>) {
        for _ in 0..count {
            self.prime(factory());
        }
    }

    fn retire(&self, event: Event<T>) {
        // The receiver lives as long as `inner`, so this only fails during teardown.
        let _ = self.inner.returns_tx.send(event);
    }

    /// Closes every consumer channel and wakes pending `dequeue` calls with `None`.
    pub fn close(&self) {
        self.inner.closed.cancel();
        let consumers = self
            .inner
            .consumers
            .lock()
            .map_or_else(|_| Vec::new(), |mut consumers| std::mem::take(&mut *consumers));
        for consumer in consumers {
            consumer.channel.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }
}

/// Type-erased view of a [`Connection`] held by the node context.
pub trait ErasedConnection: Send + Sync {
    /// Registers a consumer and returns its type-erased channel.
    ///
    /// # Errors
    ///
    /// See [`Connection::consumer`].
    fn add_consumer(&self) -> Result<BoxedChannel>;
    fn remove_consumer(&self, id: ChannelId) -> bool;
    fn consumer_count(&self) -> usize;
    fn close(&self);
    fn payload_type(&self) -> TypeId;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Send + Sync + 'static> ErasedConnection for Connection<T> {
    fn add_consumer(&self) -> Result<BoxedChannel> {
        Ok(Box::new(self.consumer()?))
    }

    fn remove_consumer(&self, id: ChannelId) -> bool {
        Self::remove_consumer(self, id)
    }

    fn consumer_count(&self) -> usize {
        Self::consumer_count(self)
    }

    fn close(&self) {
        Self::close(self);
    }

    fn payload_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Type-erased view of a [`Channel`], passed from producer to consumer node.
pub trait ErasedChannel: Send + Sync {
    fn id(&self) -> ChannelId;
    fn close(&self);
    fn payload_type(&self) -> TypeId;
    fn as_any(&self) -> &dyn Any;
}

pub type BoxedChannel = Box<dyn ErasedChannel>;

impl<T: Send + Sync + 'static> ErasedChannel for Channel<T> {
    fn id(&self) -> ChannelId {
        Self::id(self)
    }

    fn close(&self) {
        Self::close(self);
    }

    fn payload_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn numbered(n: u64) -> Event<u64> {
        let mut event = Event::new(n);
        event.stamp(n, 0);
        event
    }

    #[tokio::test]
    async fn test_conservation_across_consumers() {
        let conn = Connection::broadcast(4);
        let channels: Vec<_> = (0..3).map(|_| conn.consumer().unwrap()).collect();

        conn.queue(numbered(1)).await;
        let mut shares: Vec<_> = channels.iter().map(|c| c.try_recv().unwrap()).collect();
        assert_eq!(shares[0].holders(), 3);

        shares.pop().unwrap().release();
        assert!(conn.poll().is_none());
        shares.pop().unwrap().release();
        assert!(conn.poll().is_none());
        shares.pop().unwrap().release();

        let returned = conn.poll().unwrap();
        assert_eq!(returned.sequence_count, 1);
        assert!(conn.poll().is_none(), "event must come back exactly once");
    }

    #[tokio::test]
    async fn test_no_double_delivery() {
        let conn = Connection::broadcast(4);
        let a = conn.consumer().unwrap();
        let b = conn.consumer().unwrap();

        conn.queue(numbered(7)).await;

        for channel in [&a, &b] {
            let share = channel.try_recv().unwrap();
            assert_eq!(share.payload, 7);
            assert!(channel.try_recv().is_none());
        }
    }

    #[tokio::test]
    async fn test_zero_consumers_retire_immediately() {
        let conn = Connection::<u64>::broadcast(1);
        timeout(Duration::from_secs(1), conn.queue(numbered(3))).await.unwrap();
        assert_eq!(conn.poll().unwrap().sequence_count, 3);
    }

    #[tokio::test]
    async fn test_late_consumer_does_not_see_earlier_event() {
        let conn = Connection::broadcast(4);
        let early = conn.consumer().unwrap();
        conn.queue(numbered(1)).await;
        let late = conn.consumer().unwrap();

        assert!(late.try_recv().is_none());
        early.try_recv().unwrap().release();
        assert_eq!(conn.poll().unwrap().sequence_count, 1);
    }

    #[tokio::test]
    async fn test_removed_consumer_does_not_strand_event() {
        let conn = Connection::broadcast(4);
        let kept = conn.consumer().unwrap();
        let removed = conn.consumer().unwrap();

        conn.queue(numbered(1)).await;
        conn.queue(numbered(2)).await;

        // The removed consumer already took event 1 but never saw event 2.
        let held = removed.try_recv().unwrap();
        assert!(conn.remove_consumer(removed.id()));
        assert_eq!(conn.consumer_count(), 1);
        assert!(removed.try_recv().is_none());

        let first = kept.recv().await.unwrap();
        let second = kept.recv().await.unwrap();
        first.release();
        second.release();
        assert_eq!(conn.poll().unwrap().sequence_count, 2);

        held.release();
        assert_eq!(conn.poll().unwrap().sequence_count, 1);
    }

    #[tokio::test]
    async fn test_single_consumer_fifo() {
        let conn = Connection::single(8);
        let channel = conn.consumer().unwrap();

        for n in 1..=5 {
            conn.queue(numbered(n)).await;
        }

        let mut seen = Vec::new();
        for _ in 0..5 {
            let share = channel.recv().await.unwrap();
            seen.push(share.sequence_count);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_single_rejects_second_consumer() {
        let conn = Connection::<u64>::single(1);
        let _first = conn.consumer().unwrap();
        assert!(matches!(conn.consumer(), Err(NodeFlowError::Topology(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_closed_consumer_never_stalls_producer() {
        let conn = Connection::broadcast(1);
        let stuck = conn.consumer().unwrap();

        conn.queue(numbered(1)).await;
        let producer = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.queue(numbered(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished(), "second queue waits on the full delivery queue");

        stuck.close();
        timeout(Duration::from_secs(1), producer).await.unwrap().unwrap();

        let mut returned = vec![
            timeout(Duration::from_secs(1), conn.dequeue()).await.unwrap().unwrap().sequence_count,
            timeout(Duration::from_secs(1), conn.dequeue()).await.unwrap().unwrap().sequence_count,
        ];
        returned.sort_unstable();
        assert_eq!(returned, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_close_during_receive_still_retires_shares() {
        let conn = Connection::broadcast(4);
        let channel = conn.consumer().unwrap();
        conn.queue(numbered(1)).await;
        conn.queue(numbered(2)).await;

        // Another receiver is mid-call when the channel closes.
        let busy = channel.shared.rx.try_lock().unwrap();
        channel.close();
        assert!(conn.poll().is_none());
        drop(busy);

        assert!(channel.try_recv().is_none());
        let mut returned =
            vec![conn.poll().unwrap().sequence_count, conn.poll().unwrap().sequence_count];
        returned.sort_unstable();
        assert_eq!(returned, vec![1, 2]);
        assert!(channel.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_prime_and_close() {
        let conn = Connection::<u64>::broadcast(2);
        conn.prime_with(2, || Event::new(0));

        assert!(conn.dequeue().await.is_some());
        assert!(conn.poll().is_some());
        assert!(conn.poll().is_none());

        let channel = conn.consumer().unwrap();
        conn.close();
        assert!(conn.dequeue().await.is_none());
        assert!(channel.recv().await.is_none());
        assert!(conn.consumer().is_err());
    }

    #[tokio::test]
    async fn test_erased_round_trip() {
        let conn = Connection::<u64>::broadcast(2);
        let erased: Box<dyn ErasedConnection> = Box::new(conn);
        let channel = erased.add_consumer().unwrap();
        assert_eq!(channel.payload_type(), TypeId::of::<u64>());
        assert!(channel.as_any().downcast_ref::<Channel<u64>>().is_some());
        assert!(channel.as_any().downcast_ref::<Channel<u32>>().is_none());

        let typed = erased.as_any().downcast_ref::<Connection<u64>>().unwrap();
        assert_eq!(typed.consumer_count(), 1);
        assert!(erased.remove_consumer(channel.id()));
    }
}
