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

//! Lock namespace: resource index, handle table and lifecycle.
//!
//! ## Purpose
//! A namespace owns every resource and lock for one role (server or
//! client). Handles are only meaningful within the namespace that issued
//! them; nothing here is process-global.
//!
//! ## Design
//! - **Resource index**: `ResourceKey -> Arc<Resource>`, reference counted.
//!   A resource leaves the index only when its count is zero and its queues
//!   are empty, checked with the resource primitive held.
//! - **Handle table**: generation-checked arena of live locks.
//! - **Replay index**: `(owner, client_seq) -> handle` for duplicate enqueues.
//! - **Sweeper**: optional task reporting holders that ignore blocking
//!   callbacks past `blocking_timeout`.

use crate::callback::{CallbackDispatcher, CallbackSink};
use crate::config::{DlmConfig, NamespaceRole};
use crate::error::{DlmError, DlmResult};
use crate::eviction::{EvictionObserver, UnresponsiveReason};
use crate::handle::{HandleTable, LockHandle};
use crate::lock::{Lock, LockSnapshot, LockState, OwnerId};
use crate::locking::{self, ResourceLockGuard};
use crate::resource::{Resource, ResourceKey, ResourceSnapshot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Resources and locks for one role.
pub struct Namespace {
    id: Ulid,
    config: DlmConfig,
    resources: Mutex<HashMap<ResourceKey, Arc<Resource>>>,
    pub(crate) handles: HandleTable<Lock>,
    pub(crate) replays: Mutex<HashMap<(OwnerId, u64), LockHandle>>,
    next_seq: AtomicU64,
    stopping: AtomicBool,
    pub(crate) dispatcher: CallbackDispatcher,
    observer: Arc<dyn EvictionObserver>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Namespace {
    /// Create a namespace and start its dispatcher (and sweeper, if enabled).
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: DlmConfig,
        sink: Arc<dyn CallbackSink>,
        observer: Arc<dyn EvictionObserver>,
    ) -> DlmResult<Arc<Self>> {
        config.validate()?;
        let dispatcher = CallbackDispatcher::start(
            config.namespace.clone(),
            config.dispatch_workers,
            sink,
            observer.clone(),
        );
        let namespace = Arc::new(Self {
            id: Ulid::new(),
            resources: Mutex::new(HashMap::new()),
            handles: HandleTable::with_capacity(config.initial_handle_capacity),
            replays: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
            dispatcher,
            observer,
            sweeper: Mutex::new(None),
            config,
        });

        if let Some(interval) = namespace.config.sweep_interval() {
            let weak = Arc::downgrade(&namespace);
            let sweeper = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(namespace) = weak.upgrade() else { break };
                    if namespace.is_stopping() {
                        break;
                    }
                    namespace.check_callback_timeouts().await;
                }
            });
            *lock_leaf(&namespace.sweeper) = Some(sweeper);
        }

        info!(
            namespace = %namespace.config.namespace,
            id = %namespace.id,
            role = %namespace.config.role,
            "Lock namespace started"
        );
        Ok(namespace)
    }

    /// Instance id (unique per process lifetime)
    pub fn id(&self) -> Ulid {
        self.id
    }

    /// Namespace name
    pub fn name(&self) -> &str {
        &self.config.namespace
    }

    /// Server or client
    pub fn role(&self) -> NamespaceRole {
        self.config.role
    }

    /// Effective configuration
    pub fn config(&self) -> &DlmConfig {
        &self.config
    }

    /// Whether `shutdown` has started
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_running(&self) -> DlmResult<()> {
        if self.is_stopping() {
            return Err(DlmError::ResourceShuttingDown(self.config.namespace.clone()));
        }
        Ok(())
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn resources(&self) -> MutexGuard<'_, HashMap<ResourceKey, Arc<Resource>>> {
        lock_leaf(&self.resources)
    }

    /// Look up `key`, creating the resource if needed. The caller owns one reference.
    pub(crate) fn find_or_create(&self, key: ResourceKey) -> Arc<Resource> {
        let mut resources = self.resources();
        let resource = resources.entry(key).or_insert_with(|| {
            debug!(namespace = %self.config.namespace, resource = %key, "Creating resource");
            metrics::counter!("clusterlock_dlm_resources_created_total").increment(1);
            Arc::new(Resource::new(key))
        });
        resource.get_ref();
        Arc::clone(resource)
    }

    /// Look up an existing resource. The caller owns one reference.
    pub(crate) fn find(&self, key: ResourceKey) -> Option<Arc<Resource>> {
        let resources = self.resources();
        let resource = resources.get(&key)?;
        resource.get_ref();
        Some(Arc::clone(resource))
    }

    /// Drop one reference, reclaiming the resource if it was the last one
    /// and no lock is queued on it.
    pub(crate) async fn put_resource(&self, resource: &Arc<Resource>) {
        if !resource.put_ref() {
            return;
        }
        let queues = resource.lock_queues().await;
        let mut resources = self.resources();
        if resource.refs() != 0 || !queues.is_empty() {
            return;
        }
        let key = resource.key();
        if resources
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, resource))
        {
            resources.remove(&key);
            debug!(namespace = %self.config.namespace, resource = %key, "Resource reclaimed");
            metrics::counter!("clusterlock_dlm_resources_reclaimed_total").increment(1);
        }
    }

    /// Resolve a handle to a live lock.
    pub fn lookup(&self, handle: LockHandle) -> DlmResult<Arc<Lock>> {
        self.handles.get(handle).ok_or(DlmError::InvalidHandle(handle))
    }

    /// Acquire the primitive of the resource `lock` is bound to, using this
    /// namespace's role.
    pub async fn lock_resource_of(&self, lock: &Lock) -> ResourceLockGuard {
        locking::lock_resource_of(self.config.role, lock).await
    }

    /// Point a `NEW` lock at another resource (client role only).
    ///
    /// Holds only the lock's binding, never a resource primitive, so it
    /// cannot invert the lock order against [`Namespace::lock_resource_of`].
    pub async fn rebind(&self, handle: LockHandle, key: ResourceKey) -> DlmResult<()> {
        let lock = self.lookup(handle)?;
        if self.config.role == NamespaceRole::Server {
            let state = lock.state();
            warn!(handle = %handle, state = %state, "Rebind rejected on server namespace");
            return Err(DlmError::ProtocolViolation {
                handle,
                state,
                operation: "rebind",
            });
        }

        let target = self.find_or_create(key);
        let mut binding = locking::lock_binding(&lock).await;
        let state = lock.state();
        if state != LockState::New {
            drop(binding);
            self.put_resource(&target).await;
            warn!(handle = %handle, state = %state, "Rebind rejected for enqueued lock");
            return Err(DlmError::ProtocolViolation {
                handle,
                state,
                operation: "rebind",
            });
        }

        let previous = std::mem::replace(&mut *binding, target);
        lock.with_inner(|inner| inner.resource_key = key);
        drop(binding);

        debug!(handle = %handle, from = %previous.key(), to = %key, "Lock rebound");
        self.put_resource(&previous).await;
        Ok(())
    }

    /// Force-cancel every lock held by `owner` without delivering callbacks
    /// to it. Returns the number of locks canceled.
    pub async fn evict_owner(&self, owner: &OwnerId) -> usize {
        let victims: Vec<Arc<Lock>> = self
            .handles
            .snapshot()
            .into_iter()
            .filter(|lock| lock.owner() == owner)
            .collect();
        for lock in &victims {
            lock.with_inner(|inner| {
                inner.callbacks_suppressed = true;
                inner.pending.clear();
            });
        }
        for lock in &victims {
            if !self.cancel_lock(lock).await {
                lock.wait_retired().await;
            }
        }
        lock_leaf(&self.replays).retain(|(replay_owner, _), _| replay_owner != owner);

        info!(
            namespace = %self.config.namespace,
            owner = %owner,
            locks = victims.len(),
            "Owner evicted"
        );
        metrics::counter!("clusterlock_dlm_evictions_total").increment(1);
        victims.len()
    }

    /// Report holders whose blocking callback has been outstanding for
    /// longer than `blocking_timeout`. Each lock is reported once per grant.
    pub async fn check_callback_timeouts(&self) -> usize {
        let timeout = self.config.blocking_timeout();
        let now = Instant::now();
        let overdue: Vec<(Arc<Lock>, u64)> = self
            .handles
            .snapshot()
            .into_iter()
            .filter_map(|lock| {
                let waited = lock.with_inner(|inner| {
                    if inner.state.is_canceling() || inner.timeout_reported {
                        return None;
                    }
                    let sent_at = inner.blocking_sent_at?;
                    let waited = now.saturating_duration_since(sent_at);
                    if waited < timeout {
                        return None;
                    }
                    inner.timeout_reported = true;
                    Some(waited.as_millis() as u64)
                })?;
                Some((lock, waited))
            })
            .collect();

        for (lock, waited_ms) in &overdue {
            warn!(
                namespace = %self.config.namespace,
                owner = %lock.owner(),
                handle = %lock.handle(),
                waited_ms = *waited_ms,
                "Blocking callback not honored"
            );
            metrics::counter!("clusterlock_dlm_blocking_timeouts_total").increment(1);
            self.observer
                .report_unresponsive(
                    lock.owner(),
                    UnresponsiveReason::BlockingTimeout {
                        handle: lock.handle(),
                        waited_ms: *waited_ms,
                    },
                )
                .await;
        }
        overdue.len()
    }

    /// Refuse new requests, cancel every lock without callbacks and stop
    /// the dispatcher. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(namespace = %self.config.namespace, id = %self.id, "Lock namespace shutting down");

        let sweeper = lock_leaf(&self.sweeper).take();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }

        let locks = self.handles.snapshot();
        for lock in &locks {
            lock.with_inner(|inner| {
                inner.callbacks_suppressed = true;
                inner.pending.clear();
            });
        }
        for lock in &locks {
            if !self.cancel_lock(lock).await {
                lock.wait_retired().await;
            }
        }

        self.dispatcher.quiesce().await;
        self.dispatcher.shutdown().await;
        info!(
            namespace = %self.config.namespace,
            canceled = locks.len(),
            resources = self.resource_count(),
            "Lock namespace stopped"
        );
    }

    /// Wait until every queued notification has been delivered or dropped.
    pub async fn quiesce(&self) {
        self.dispatcher.quiesce().await;
    }

    /// Snapshot of one lock.
    pub fn lock_snapshot(&self, handle: LockHandle) -> DlmResult<LockSnapshot> {
        Ok(self.lookup(handle)?.snapshot())
    }

    /// Snapshots of every live lock, in arrival order.
    pub fn locks(&self) -> Vec<LockSnapshot> {
        let mut locks: Vec<LockSnapshot> =
            self.handles.snapshot().iter().map(|lock| lock.snapshot()).collect();
        locks.sort_by_key(|lock| lock.seq);
        locks
    }

    /// Snapshot of one resource and its queues.
    pub async fn resource_snapshot(&self, key: ResourceKey) -> Option<ResourceSnapshot> {
        let resource = self.resources().get(&key).cloned()?;
        let queues = resource.lock_queues().await;
        Some(ResourceSnapshot::capture(&resource, &queues))
    }

    /// Snapshots of every resource, ordered by key.
    pub async fn resource_snapshots(&self) -> Vec<ResourceSnapshot> {
        let mut resources: Vec<Arc<Resource>> = self.resources().values().cloned().collect();
        resources.sort_by_key(|resource| resource.key());
        let mut snapshots = Vec::with_capacity(resources.len());
        for resource in resources {
            let queues = resource.lock_queues().await;
            snapshots.push(ResourceSnapshot::capture(&resource, &queues));
        }
        snapshots
    }

    /// Number of resources in the index
    pub fn resource_count(&self) -> usize {
        self.resources().len()
    }

    /// Number of live locks
    pub fn lock_count(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        if let Some(sweeper) = lock_leaf(&self.sweeper).take() {
            sweeper.abort();
        }
    }
}

pub(crate) fn lock_leaf<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
