// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Thread-affine execution for resources that must stay on one OS thread.
//!
//! Rendering contexts and similar handles are not `Send` and must not be touched
//! concurrently. An [`AffinityWorker`] owns one dedicated thread and a
//! [`ThreadResources`] map living on it; node bodies submit closures with
//! [`AffinityWorker::run`] and await the result. Jobs execute strictly one at a
//! time in submission order, even when they come from different nodes.

use crate::error::{NodeFlowError, Result};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::oneshot;

type Job = Box<dyn FnOnce(&mut ThreadResources) + Send>;

/// Per-thread storage keyed by type.
///
/// Lives on the worker thread, so values need not be `Send`.
#[derive(Default)]
pub struct ThreadResources {
    values: HashMap<TypeId, Box<dyn Any>>,
}

impl ThreadResources {
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.values.get(&TypeId::of::<T>()).and_then(|v| v.downcast_ref())
    }

    pub fn get_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.values.get_mut(&TypeId::of::<T>()).and_then(|v| v.downcast_mut())
    }

    pub fn get_or_insert_with<T: 'static>(&mut self, init: impl FnOnce() -> T) -> &mut T {
        let slot = self.values.entry(TypeId::of::<T>()).or_insert_with(|| Box::new(init()));
        match slot.downcast_mut() {
            Some(value) => value,
            // Keyed by `TypeId::of::<T>()`, so the box always holds a `T`.
            None => unreachable!("thread resource stored under a foreign type id"),
        }
    }

    /// Stores `value`, returning the previous one of the same type.
    pub fn insert<T: 'static>(&mut self, value: T) -> Option<T> {
        self.values
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast().ok())
            .map(|old| *old)
    }

    pub fn remove<T: 'static>(&mut self) -> Option<T> {
        self.values.remove(&TypeId::of::<T>()).and_then(|v| v.downcast().ok()).map(|v| *v)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Default)]
struct WorkerState {
    jobs: Option<std_mpsc::Sender<Job>>,
    thread: Option<JoinHandle<()>>,
    shut_down: bool,
}

struct WorkerInner {
    name: String,
    state: Mutex<WorkerState>,
}

/// Handle to a dedicated job thread. Cheap to clone; the thread starts on first use.
#[derive(Clone)]
pub struct AffinityWorker {
    inner: Arc<WorkerInner>,
}

impl Default for AffinityWorker {
    fn default() -> Self {
        Self::new("nodeflow-affinity")
    }
}

impl std::fmt::Debug for AffinityWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AffinityWorker").field("name", &self.inner.name).finish_non_exhaustive()
    }
}

impl AffinityWorker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                name: name.into(),
                state: Mutex::new(WorkerState::default()),
            }),
        }
    }

    /// Runs `job` on the worker thread and returns its result.
    ///
    /// # Errors
    ///
    /// Returns `NodeFlowError::Released` after [`AffinityWorker::shutdown`], or
    /// `NodeFlowError::Resource` if the thread cannot be started or the job panicked.
    pub async fn run<R, F>(&self, job: F) -> Result<R>
    where
        F: FnOnce(&mut ThreadResources) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(Box::new(move |resources| {
            let _ = reply_tx.send(job(resources));
        }))?;
        reply_rx.await.map_err(|_| {
            NodeFlowError::Resource(format!("job on '{}' did not complete", self.inner.name))
        })
    }

    fn submit(&self, job: Job) -> Result<()> {
        let Ok(mut state) = self.inner.state.lock() else {
            return Err(NodeFlowError::Resource(format!("'{}' state poisoned", self.inner.name)));
        };
        if state.shut_down {
            return Err(NodeFlowError::Released(self.inner.name.clone()));
        }
        if state.jobs.is_none() {
            let (tx, rx) = std_mpsc::channel::<Job>();
            let name = self.inner.name.clone();
            let thread = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(&name, &rx))?;
            state.jobs = Some(tx);
            state.thread = Some(thread);
        }
        let sent = state.jobs.as_ref().is_some_and(|jobs| jobs.send(job).is_ok());
        drop(state);

        if sent {
            Ok(())
        } else {
            Err(NodeFlowError::Resource(format!("'{}' is not accepting jobs", self.inner.name)))
        }
    }

    /// Stops accepting jobs and waits for the queued ones to finish.
    ///
    /// Thread-local resources are dropped on the worker thread. Idempotent.
    pub async fn shutdown(&self) {
        let thread = {
            let Ok(mut state) = self.inner.state.lock() else {
                return;
            };
            state.shut_down = true;
            state.jobs = None;
            state.thread.take()
        };
        if let Some(thread) = thread {
            let name = self.inner.name.clone();
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => tracing::debug!(worker = %name, "Affinity worker stopped"),
                Ok(Err(_)) | Err(_) => {
                    tracing::warn!(worker = %name, "Affinity worker exited abnormally");
                },
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().map_or(true, |state| state.shut_down)
    }
}

fn worker_loop(name: &str, jobs: &std_mpsc::Receiver<Job>) {
    tracing::debug!(worker = %name, "Affinity worker started");
    let mut resources = ThreadResources::default();
    while let Ok(job) = jobs.recv() {
        // A panicking job drops its reply sender; the caller sees a resource error.
        if std::panic::catch_unwind(AssertUnwindSafe(|| job(&mut resources))).is_err() {
            tracing::error!(worker = %name, "Job panicked on affinity worker");
        }
    }
}
