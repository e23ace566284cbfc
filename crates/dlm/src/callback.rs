// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of ClusterLock.
//
// ClusterLock is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// ClusterLock is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with ClusterLock. If not, see <https://www.gnu.org/licenses/>.

//! Callback dispatch: blocking, completion and glimpse notifications.
//!
//! ## Model
//! ```text
//!  engine (resource primitive held)        dispatcher                 workers
//!  ───────────────────────────────         ──────────                 ───────
//!  push onto lock.pending  ──┐
//!  record lock in batch      │ release
//!                            └──> dispatch(batch) ──> channel ──> drain(lock) ──> CallbackSink
//! ```
//! - Notifications are queued on the recipient lock while the resource
//!   primitive is held, and delivered only after it is released.
//! - A lock is drained by at most one task at a time, so each lock sees its
//!   notifications in the order they were queued. There is no ordering
//!   across locks.
//! - Delivery failures are reported to the [`EvictionObserver`], never to
//!   the caller that caused the notification.

use crate::error::DlmResult;
use crate::eviction::{EvictionObserver, UnresponsiveReason};
use crate::handle::LockHandle;
use crate::lock::{Lock, LockInner, OwnerId};
use crate::mode::LockMode;
use crate::resource::ResourceKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Kind of notification delivered to a lock owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackKind {
    /// Release or downgrade, a conflicting request is waiting
    Blocking,
    /// Lock (or conversion) has been granted
    Completion,
    /// Report current state of cached data (e.g. file size)
    Glimpse,
}

impl CallbackKind {
    fn as_str(self) -> &'static str {
        match self {
            CallbackKind::Blocking => "blocking",
            CallbackKind::Completion => "completion",
            CallbackKind::Glimpse => "glimpse",
        }
    }
}

/// The other party of a blocking or glimpse notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDescriptor {
    /// Lock that triggered the notification, if any
    pub handle: Option<LockHandle>,
    /// Its owner
    pub owner: OwnerId,
    /// Mode it requested
    pub mode: Option<LockMode>,
}

/// Message for a lock owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Notification kind
    pub kind: CallbackKind,
    /// Recipient lock
    pub handle: LockHandle,
    /// Recipient lock's resource
    pub resource: ResourceKey,
    /// Granted mode of the recipient (newly granted mode for completions)
    pub mode: LockMode,
    /// Requester for blocking and glimpse notifications
    pub conflicting: Option<ConflictDescriptor>,
}

impl Notification {
    pub(crate) fn blocking(holder: &Lock, inner: &LockInner, mode: LockMode, waiter: &Lock, waiter_mode: LockMode) -> Self {
        Self {
            kind: CallbackKind::Blocking,
            handle: holder.handle(),
            resource: inner.resource_key,
            mode,
            conflicting: Some(ConflictDescriptor {
                handle: Some(waiter.handle()),
                owner: waiter.owner().clone(),
                mode: Some(waiter_mode),
            }),
        }
    }

    pub(crate) fn completion(lock: &Lock, inner: &LockInner, mode: LockMode) -> Self {
        Self {
            kind: CallbackKind::Completion,
            handle: lock.handle(),
            resource: inner.resource_key,
            mode,
            conflicting: None,
        }
    }

    pub(crate) fn glimpse(holder: &Lock, inner: &LockInner, mode: LockMode, requester: &OwnerId) -> Self {
        Self {
            kind: CallbackKind::Glimpse,
            handle: holder.handle(),
            resource: inner.resource_key,
            mode,
            conflicting: Some(ConflictDescriptor {
                handle: None,
                owner: requester.clone(),
                mode: None,
            }),
        }
    }
}

/// Transport towards lock owners.
#[async_trait]
pub trait CallbackSink: Send + Sync {
    /// Deliver one notification to `owner`. May block on I/O.
    async fn deliver(&self, owner: &OwnerId, notification: &Notification) -> DlmResult<()>;
}

/// Locks that received notifications while a resource primitive was held.
#[derive(Default)]
pub(crate) struct CallbackBatch {
    touched: Vec<Arc<Lock>>,
}

impl CallbackBatch {
    /// Queue `notification` on `lock`. `inner` must be `lock`'s state guard.
    pub(crate) fn queue(&mut self, lock: &Arc<Lock>, inner: &mut LockInner, notification: Notification) -> bool {
        if inner.callbacks_suppressed {
            return false;
        }
        inner.pending.push_back(notification);
        if !self.touched.iter().any(|l| Arc::ptr_eq(l, lock)) {
            self.touched.push(Arc::clone(lock));
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.touched.is_empty()
    }
}

struct DeliveryContext {
    namespace: String,
    sink: Arc<dyn CallbackSink>,
    observer: Arc<dyn EvictionObserver>,
    outstanding: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl DeliveryContext {
    async fn drain(&self, lock: Arc<Lock>) {
        loop {
            let next = lock.with_inner(|inner| match inner.pending.pop_front() {
                Some(n) => Some((n, inner.state, inner.callbacks_suppressed)),
                None => {
                    inner.dispatch_scheduled = false;
                    None
                }
            });
            let Some((notification, state, suppressed)) = next else {
                break;
            };

            if suppressed || state.is_canceling() {
                debug!(
                    handle = %lock.handle(),
                    kind = notification.kind.as_str(),
                    state = %state,
                    "Dropping notification for canceled lock"
                );
                metrics::counter!(
                    "clusterlock_dlm_callbacks_dropped_total",
                    "kind" => notification.kind.as_str()
                )
                .increment(1);
                continue;
            }

            match self.sink.deliver(lock.owner(), &notification).await {
                Ok(()) => {
                    metrics::counter!(
                        "clusterlock_dlm_callbacks_delivered_total",
                        "kind" => notification.kind.as_str()
                    )
                    .increment(1);
                }
                Err(e) => {
                    warn!(
                        namespace = %self.namespace,
                        owner = %lock.owner(),
                        handle = %lock.handle(),
                        kind = notification.kind.as_str(),
                        error = %e,
                        "Callback delivery failed"
                    );
                    metrics::counter!(
                        "clusterlock_dlm_callbacks_failed_total",
                        "kind" => notification.kind.as_str()
                    )
                    .increment(1);
                    self.observer
                        .report_unresponsive(
                            lock.owner(),
                            UnresponsiveReason::CallbackDeliveryFailed {
                                handle: lock.handle(),
                                error: e.to_string(),
                            },
                        )
                        .await;
                }
            }
        }
        self.finish_one();
    }

    fn abandon(&self, lock: &Lock) {
        lock.with_inner(|inner| {
            inner.pending.clear();
            inner.dispatch_scheduled = false;
        });
        self.finish_one();
    }

    fn finish_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Hands locks with pending notifications to delivery workers.
pub struct CallbackDispatcher {
    tx: mpsc::UnboundedSender<Arc<Lock>>,
    ctx: Arc<DeliveryContext>,
    shutdown_tx: watch::Sender<bool>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl CallbackDispatcher {
    /// Start the dispatcher. Must be called from within a tokio runtime.
    pub fn start(
        namespace: impl Into<String>,
        workers: usize,
        sink: Arc<dyn CallbackSink>,
        observer: Arc<dyn EvictionObserver>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = Arc::new(DeliveryContext {
            namespace: namespace.into(),
            sink,
            observer,
            outstanding: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        });
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let coordinator = tokio::spawn(run_dispatcher(rx, shutdown_rx, semaphore, ctx.clone()));
        Self {
            tx,
            ctx,
            shutdown_tx,
            coordinator: Mutex::new(Some(coordinator)),
        }
    }

    /// Schedule every lock in the batch. Call after releasing the resource primitive.
    pub(crate) fn dispatch(&self, batch: CallbackBatch) {
        for lock in batch.touched {
            let schedule = lock.with_inner(|inner| {
                if inner.dispatch_scheduled || inner.pending.is_empty() {
                    false
                } else {
                    inner.dispatch_scheduled = true;
                    true
                }
            });
            if !schedule {
                continue;
            }
            self.ctx.outstanding.fetch_add(1, Ordering::AcqRel);
            if let Err(mpsc::error::SendError(lock)) = self.tx.send(lock) {
                debug!(handle = %lock.handle(), "Dispatcher stopped, dropping notifications");
                self.ctx.abandon(&lock);
            }
        }
    }

    /// Locks currently scheduled or being drained
    pub fn outstanding(&self) -> usize {
        self.ctx.outstanding.load(Ordering::Acquire)
    }

    /// Wait until every scheduled notification has been delivered or dropped.
    pub async fn quiesce(&self) {
        loop {
            let notified = self.ctx.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting work. Queued but unstarted locks are abandoned.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let coordinator = self
            .coordinator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(coordinator) = coordinator {
            if let Err(e) = coordinator.await {
                warn!(error = %e, "Callback dispatcher task failed");
            }
        }
    }
}

async fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<Arc<Lock>>,
    mut shutdown_rx: watch::Receiver<bool>,
    semaphore: Arc<Semaphore>,
    ctx: Arc<DeliveryContext>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            next = rx.recv() => {
                let Some(lock) = next else { break };
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        ctx.abandon(&lock);
                        continue;
                    }
                };
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    ctx.drain(lock).await;
                    drop(permit);
                });
            }
        }
    }

    rx.close();
    while let Some(lock) = rx.recv().await {
        ctx.abandon(&lock);
    }
    debug!(namespace = %ctx.namespace, "Callback dispatcher stopped");
}
