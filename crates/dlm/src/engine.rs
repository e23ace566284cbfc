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

//! Enqueue, convert, cancel and glimpse.
//!
//! ## Granting
//! A request for `mode` is grantable when:
//! - it conflicts with no granted lock other than itself;
//! - it conflicts with no pending conversion target (conversions go first);
//! - no earlier waiter with the same mode and an overlapping policy is
//!   still waiting;
//! - it conflicts with no earlier waiter that has already been bypassed
//!   `starvation_bypass_limit` times.
//!
//! Otherwise it waits, and every granted lock it conflicts with is sent
//! one blocking notification. Whenever a lock leaves a resource or
//! downgrades, the converting queue and then the waiting queue are
//! re-evaluated in order.
//!
//! ## Cancel priority
//! Cancel marks the lock `CANCELING` in its state guard before touching the
//! resource. Every grant path re-checks that flag under the same guard, so
//! a cancel that has started always wins over a racing grant.

use crate::callback::{CallbackBatch, Notification};
use crate::error::{DlmError, DlmResult};
use crate::handle::{HandleStatus, LockHandle};
use crate::lock::{Lock, LockParams, LockState, OwnerId};
use crate::mode::{LockMode, LockPolicy};
use crate::namespace::{lock_leaf, Namespace};
use crate::resource::{QueueEntry, ResourceKey, ResourceQueues};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Request for a new lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    /// Resource to lock
    pub key: ResourceKey,
    /// Requested mode
    pub mode: LockMode,
    /// Range or bits covered
    #[serde(default)]
    pub policy: LockPolicy,
    /// Requesting connection
    pub owner: OwnerId,
    /// Client-generated sequence number; repeats are answered with the
    /// original handle
    #[serde(default)]
    pub client_seq: Option<u64>,
}

impl EnqueueRequest {
    /// Whole-resource request without a client sequence number
    pub fn new(key: ResourceKey, mode: LockMode, owner: impl Into<OwnerId>) -> Self {
        Self {
            key,
            mode,
            policy: LockPolicy::Plain,
            owner: owner.into(),
            client_seq: None,
        }
    }

    /// Set the policy
    pub fn with_policy(mut self, policy: LockPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the client sequence number
    pub fn with_client_seq(mut self, client_seq: u64) -> Self {
        self.client_seq = Some(client_seq);
        self
    }
}

/// Outcome of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueReply {
    /// Handle of the (possibly pre-existing) lock
    pub handle: LockHandle,
    /// `GRANTED` or `WAITING`, or the current state for a duplicate
    pub state: LockState,
    /// Mode held, if granted
    pub granted_mode: Option<LockMode>,
}

impl EnqueueReply {
    fn of(lock: &Lock) -> Self {
        lock.with_inner(|inner| Self {
            handle: lock.handle(),
            state: inner.state,
            granted_mode: inner.granted_mode,
        })
    }
}

/// Outcome of a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvertStatus {
    /// New mode is held
    Granted,
    /// Old mode is still held; a completion follows when the new one is granted
    Pending,
}

enum Registration {
    Fresh(Arc<Lock>),
    Replay(Arc<Lock>),
}

impl Namespace {
    /// Create a lock on `request.key` and try to grant it.
    ///
    /// ## Returns
    /// - `Ok(reply)` with state `GRANTED` or `WAITING`
    /// - `Ok(reply)` for the original lock if `(owner, client_seq)` was seen before
    /// - `Err(DlmError::ResourceShuttingDown)` if the namespace is stopping
    /// - `Err(DlmError::InvalidRequest)` for a malformed policy or empty owner
    pub async fn enqueue(&self, request: EnqueueRequest) -> DlmResult<EnqueueReply> {
        let started = std::time::Instant::now();
        let lock = match self.register(request)? {
            Registration::Replay(lock) => {
                debug!(handle = %lock.handle(), owner = %lock.owner(), "Duplicate enqueue");
                metrics::counter!("clusterlock_dlm_enqueue_total", "result" => "duplicate")
                    .increment(1);
                return Ok(EnqueueReply::of(&lock));
            }
            Registration::Fresh(lock) => lock,
        };

        let reply = match self.enqueue_locked(&lock).await {
            Ok(reply) => reply,
            Err(e) => {
                self.discard(&lock).await;
                metrics::counter!("clusterlock_dlm_enqueue_total", "result" => "error").increment(1);
                return Err(e);
            }
        };

        metrics::counter!("clusterlock_dlm_enqueue_total", "result" => reply.state.as_str())
            .increment(1);
        metrics::histogram!("clusterlock_dlm_enqueue_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        Ok(reply)
    }

    /// Create a lock in `NEW` without queueing it (client role split form).
    ///
    /// The lock is bound to `request.key` until [`Namespace::rebind`] moves
    /// it, and joins the resource queues with [`Namespace::enqueue_lock`].
    pub async fn create_lock(&self, request: EnqueueRequest) -> DlmResult<LockHandle> {
        let lock = match self.register(request)? {
            Registration::Fresh(lock) => lock,
            Registration::Replay(lock) => lock,
        };
        Ok(lock.handle())
    }

    /// Queue a lock created with [`Namespace::create_lock`].
    pub async fn enqueue_lock(&self, handle: LockHandle) -> DlmResult<EnqueueReply> {
        let lock = self.lookup(handle)?;
        self.enqueue_locked(&lock).await
    }

    /// Request a different mode for a granted lock.
    ///
    /// The old mode stays held until the new one is granted.
    pub async fn convert(&self, handle: LockHandle, mode: LockMode) -> DlmResult<ConvertStatus> {
        self.ensure_running()?;
        let lock = self.lookup(handle)?;
        let mut guard = self.lock_resource_of(&lock).await;

        let held = lock.with_inner(|inner| {
            let held = match (inner.state, inner.granted_mode) {
                (LockState::Granted, Some(held)) => held,
                (state, _) => {
                    return Err(DlmError::ProtocolViolation {
                        handle,
                        state,
                        operation: "convert",
                    })
                }
            };
            if held != mode {
                inner.advance(handle, LockState::Converting, "convert")?;
                inner.requested_mode = mode;
                inner.bypassed = 0;
            }
            Ok(held)
        });
        let held = match held {
            Ok(held) => held,
            Err(e) => {
                warn!(handle = %handle, error = %e, "Convert rejected");
                return Err(e);
            }
        };
        if held == mode {
            return Ok(ConvertStatus::Granted);
        }

        let mut batch = CallbackBatch::default();
        let status = if guard.granted_conflicts(handle, mode, lock.policy()).is_empty() {
            if !self.complete_conversion(&mut guard, &lock, mode, false, &mut batch) {
                return Err(DlmError::ProtocolViolation {
                    handle,
                    state: lock.state(),
                    operation: "convert",
                });
            }
            self.reprocess(&mut guard, &mut batch);
            ConvertStatus::Granted
        } else {
            guard.converting.push_back(QueueEntry::new(lock.clone(), mode));
            self.send_blocking(&guard, &lock, mode, &mut batch);
            ConvertStatus::Pending
        };
        drop(guard);
        self.dispatcher.dispatch(batch);

        debug!(handle = %handle, from = %held, to = %mode, status = ?status, "Convert");
        metrics::counter!("clusterlock_dlm_conversions_total").increment(1);
        Ok(status)
    }

    /// Cancel a lock. Canceling an already canceled handle succeeds.
    ///
    /// ## Returns
    /// - `Ok(LockState::Canceled)` for live and retired handles
    /// - `Err(DlmError::InvalidHandle)` for a handle this namespace never issued
    pub async fn cancel(&self, handle: LockHandle) -> DlmResult<LockState> {
        match self.handles.status(handle) {
            HandleStatus::Live(lock) => {
                if !self.cancel_lock(&lock).await {
                    lock.wait_retired().await;
                }
                Ok(LockState::Canceled)
            }
            HandleStatus::Retired => {
                debug!(handle = %handle, "Cancel of retired handle");
                Ok(LockState::Canceled)
            }
            HandleStatus::Unknown => {
                warn!(handle = %handle, "Cancel of unknown handle");
                Err(DlmError::InvalidHandle(handle))
            }
        }
    }

    /// Ask every holder of a write-capable lock on `key` (other than
    /// `requester`) to report its cached state. Returns the number of
    /// glimpse notifications queued.
    pub async fn glimpse(&self, key: ResourceKey, requester: &OwnerId) -> DlmResult<usize> {
        self.ensure_running()?;
        let Some(resource) = self.find(key) else {
            return Ok(0);
        };

        let mut batch = CallbackBatch::default();
        let mut queued = 0;
        {
            let queues = resource.lock_queues().await;
            for entry in queues.granted.iter().filter(|e| e.mode.is_write()) {
                if entry.lock.owner() == requester {
                    continue;
                }
                let sent = entry.lock.with_inner(|inner| {
                    if inner.state.is_canceling() {
                        return false;
                    }
                    let n = Notification::glimpse(&entry.lock, inner, entry.mode, requester);
                    batch.queue(&entry.lock, inner, n)
                });
                if sent {
                    queued += 1;
                }
            }
        }
        self.dispatcher.dispatch(batch);
        self.put_resource(&resource).await;

        debug!(resource = %key, requester = %requester, queued, "Glimpse");
        metrics::counter!("clusterlock_dlm_glimpses_total").increment(1);
        Ok(queued)
    }

    /// Cancel `lock`, re-evaluate its resource and release its reference.
    /// Returns `false` if another cancel got there first; that cancel may
    /// still be in progress (see `Lock::wait_retired`).
    pub(crate) async fn cancel_lock(&self, lock: &Arc<Lock>) -> bool {
        let handle = lock.handle();
        let first = lock.with_inner(|inner| {
            !inner.state.is_canceling()
                && inner.advance(handle, LockState::Canceling, "cancel").is_ok()
        });
        if !first {
            return false;
        }

        let mut guard = self.lock_resource_of(lock).await;
        guard.remove(handle);
        lock.with_inner(|inner| {
            if let Err(e) = inner.advance(handle, LockState::Canceled, "cancel") {
                warn!(handle = %handle, error = %e, "Cancel completion failed");
            }
            inner.granted_mode = None;
            inner.blocking_sent_at = None;
            inner.pending.clear();
        });
        let mut batch = CallbackBatch::default();
        self.reprocess(&mut guard, &mut batch);
        let resource = Arc::clone(guard.resource());
        drop(guard);

        if let Some(client_seq) = lock.client_seq() {
            let mut replays = lock_leaf(&self.replays);
            let key = (lock.owner().clone(), client_seq);
            if replays.get(&key) == Some(&handle) {
                replays.remove(&key);
            }
        }
        self.handles.remove(handle);
        lock.mark_retired();
        self.dispatcher.dispatch(batch);
        self.put_resource(&resource).await;

        debug!(handle = %handle, owner = %lock.owner(), resource = %resource.key(), "Lock canceled");
        metrics::counter!("clusterlock_dlm_cancels_total").increment(1);
        true
    }

    async fn discard(&self, lock: &Arc<Lock>) {
        lock.with_inner(|inner| inner.callbacks_suppressed = true);
        self.cancel_lock(lock).await;
    }

    /// Validate, allocate a handle and bind to the resource, or find the
    /// lock a previous copy of this request created.
    fn register(&self, request: EnqueueRequest) -> DlmResult<Registration> {
        self.ensure_running()?;
        request.policy.validate().map_err(DlmError::InvalidRequest)?;
        if request.owner.as_str().is_empty() {
            return Err(DlmError::InvalidRequest("owner is required".to_string()));
        }

        // replay index, then resource index, then handle table
        let mut replays = lock_leaf(&self.replays);
        if let Some(client_seq) = request.client_seq {
            let replay_key = (request.owner.clone(), client_seq);
            if let Some(&existing) = replays.get(&replay_key) {
                if let Some(lock) = self.handles.get(existing) {
                    return Ok(Registration::Replay(lock));
                }
                replays.remove(&replay_key);
            }
        }

        let resource = self.find_or_create(request.key);
        let params = LockParams {
            owner: request.owner,
            mode: request.mode,
            policy: request.policy,
            seq: self.next_seq(),
            client_seq: request.client_seq,
            history_depth: self.config().history_depth,
        };
        let (handle, lock) = self
            .handles
            .insert_with(|handle| Lock::new(handle, resource, params));
        if let Some(client_seq) = request.client_seq {
            replays.insert((lock.owner().clone(), client_seq), handle);
        }

        debug!(
            handle = %handle,
            owner = %lock.owner(),
            resource = %request.key,
            mode = %request.mode,
            "Lock created"
        );
        Ok(Registration::Fresh(lock))
    }

    async fn enqueue_locked(&self, lock: &Arc<Lock>) -> DlmResult<EnqueueReply> {
        let handle = lock.handle();
        let mut guard = self.lock_resource_of(lock).await;
        self.ensure_running()?;

        let mode = lock.requested_mode();
        let proceed = lock.with_inner(|inner| {
            if inner.state.is_canceling() {
                return Ok(false);
            }
            inner.advance(handle, LockState::Enqueued, "enqueue").map(|()| true)
        });
        let proceed = match proceed {
            Ok(proceed) => proceed,
            Err(e) => {
                warn!(handle = %handle, error = %e, "Enqueue rejected");
                return Err(e);
            }
        };

        let mut batch = CallbackBatch::default();
        if proceed {
            if self.grantable(&guard, lock, mode) {
                self.record_bypass(&guard, lock, mode);
                self.grant(&mut guard, lock, mode, false, &mut batch);
            } else {
                let waiting = lock.with_inner(|inner| {
                    !inner.state.is_canceling()
                        && inner.advance(handle, LockState::Waiting, "enqueue").is_ok()
                });
                if waiting {
                    guard.push_waiting(QueueEntry::new(lock.clone(), mode));
                    self.send_blocking(&guard, lock, mode, &mut batch);
                    debug!(handle = %handle, resource = %guard.resource().key(), mode = %mode, "Lock waiting");
                }
            }
        }
        let reply = EnqueueReply::of(lock);
        drop(guard);
        self.dispatcher.dispatch(batch);
        Ok(reply)
    }

    fn grantable(&self, queues: &ResourceQueues, lock: &Lock, mode: LockMode) -> bool {
        let handle = lock.handle();
        let policy = lock.policy();
        if queues
            .granted
            .iter()
            .any(|e| e.handle() != handle && e.conflicts_with(mode, policy))
        {
            return false;
        }
        // A pending conversion holds back conflicting requests only once starved.
        if queues
            .converting
            .iter()
            .any(|e| e.handle() != handle && e.conflicts_with(mode, policy) && self.starved(&e.lock))
        {
            return false;
        }
        queues
            .waiting
            .iter()
            .take_while(|e| e.lock.seq() < lock.seq())
            .all(|earlier| !self.holds_back(earlier, mode, policy))
    }

    /// Whether an earlier waiter keeps a request for `(mode, policy)` waiting.
    fn holds_back(&self, earlier: &QueueEntry, mode: LockMode, policy: &LockPolicy) -> bool {
        if !earlier.policy().overlaps(policy) {
            return false;
        }
        if earlier.mode == mode {
            return !earlier.lock.state().is_canceling();
        }
        !earlier.mode.is_compatible(mode) && self.starved(&earlier.lock)
    }

    /// Whether `lock` has been passed over `starvation_bypass_limit` times.
    fn starved(&self, lock: &Lock) -> bool {
        match self.config().starvation_bypass_limit {
            Some(limit) => lock.with_inner(|inner| !inner.state.is_canceling() && inner.bypassed >= limit),
            None => false,
        }
    }

    /// Count a grant of `(lock, mode)` against every pending conversion and
    /// earlier waiter it passes.
    fn record_bypass(&self, queues: &ResourceQueues, lock: &Lock, mode: LockMode) {
        let passed_waiters = queues
            .waiting
            .iter()
            .take_while(|e| e.lock.seq() < lock.seq());
        for earlier in queues
            .converting
            .iter()
            .chain(passed_waiters)
            .filter(|e| e.handle() != lock.handle() && e.conflicts_with(mode, lock.policy()))
        {
            let bypassed = earlier.lock.with_inner(|inner| {
                inner.bypassed = inner.bypassed.saturating_add(1);
                inner.bypassed
            });
            if self.config().starvation_bypass_limit == Some(bypassed) {
                debug!(handle = %earlier.handle(), bypassed, "Request reached bypass limit");
            }
        }
    }

    /// Move `lock` to the granted queue. Skipped if a cancel has started.
    fn grant(
        &self,
        queues: &mut ResourceQueues,
        lock: &Arc<Lock>,
        mode: LockMode,
        notify: bool,
        batch: &mut CallbackBatch,
    ) -> bool {
        let handle = lock.handle();
        let granted = lock.with_inner(|inner| {
            if inner.state.is_canceling() || inner.advance(handle, LockState::Granted, "grant").is_err() {
                return false;
            }
            inner.granted_mode = Some(mode);
            inner.granted_at = Some(Utc::now());
            inner.blocking_sent = false;
            inner.blocking_sent_at = None;
            inner.timeout_reported = false;
            inner.bypassed = 0;
            if notify {
                let n = Notification::completion(lock, inner, mode);
                batch.queue(lock, inner, n);
            }
            true
        });
        if granted {
            queues.granted.push(QueueEntry::new(lock.clone(), mode));
            debug!(handle = %handle, owner = %lock.owner(), mode = %mode, "Lock granted");
            metrics::counter!("clusterlock_dlm_grants_total").increment(1);
        }
        granted
    }

    /// Finish a conversion of a lock already on the granted queue.
    fn complete_conversion(
        &self,
        queues: &mut ResourceQueues,
        lock: &Arc<Lock>,
        mode: LockMode,
        notify: bool,
        batch: &mut CallbackBatch,
    ) -> bool {
        let handle = lock.handle();
        let converted = lock.with_inner(|inner| {
            if inner.state.is_canceling() || inner.advance(handle, LockState::Granted, "convert").is_err() {
                return false;
            }
            inner.granted_mode = Some(mode);
            inner.granted_at = Some(Utc::now());
            inner.blocking_sent = false;
            inner.blocking_sent_at = None;
            inner.timeout_reported = false;
            inner.bypassed = 0;
            if notify {
                let n = Notification::completion(lock, inner, mode);
                batch.queue(lock, inner, n);
            }
            true
        });
        if converted {
            queues.set_granted_mode(handle, mode);
            debug!(handle = %handle, mode = %mode, "Conversion granted");
        }
        converted
    }

    /// Queue one blocking notification to each granted lock that `(waiter, mode)` conflicts with.
    fn send_blocking(
        &self,
        queues: &ResourceQueues,
        waiter: &Lock,
        mode: LockMode,
        batch: &mut CallbackBatch,
    ) {
        for entry in queues
            .granted
            .iter()
            .filter(|e| e.handle() != waiter.handle() && e.conflicts_with(mode, waiter.policy()))
        {
            let holder = &entry.lock;
            let held = entry.mode;
            holder.with_inner(|inner| {
                if inner.blocking_sent || inner.state.is_canceling() {
                    return;
                }
                let n = Notification::blocking(holder, inner, held, waiter, mode);
                if batch.queue(holder, inner, n) {
                    inner.blocking_sent = true;
                    inner.blocking_sent_at = Some(Instant::now());
                    metrics::counter!("clusterlock_dlm_blocking_callbacks_total").increment(1);
                }
            });
        }
    }

    /// Grant whatever became grantable, conversions first, then ask the
    /// remaining blockers to give way.
    pub(crate) fn reprocess(&self, queues: &mut ResourceQueues, batch: &mut CallbackBatch) {
        let mut i = 0;
        while i < queues.converting.len() {
            let entry = queues.converting[i].clone();
            if !entry.lock.state().is_canceling()
                && queues
                    .granted_conflicts(entry.handle(), entry.mode, entry.policy())
                    .is_empty()
            {
                queues.converting.remove(i);
                self.complete_conversion(queues, &entry.lock, entry.mode, true, batch);
            } else {
                i += 1;
            }
        }

        let mut i = 0;
        while i < queues.waiting.len() {
            let entry = queues.waiting[i].clone();
            if !entry.lock.state().is_canceling() && self.grantable(queues, &entry.lock, entry.mode) {
                queues.waiting.remove(i);
                self.record_bypass(queues, &entry.lock, entry.mode);
                self.grant(queues, &entry.lock, entry.mode, true, batch);
            } else {
                i += 1;
            }
        }

        let blocked: Vec<QueueEntry> = queues
            .converting
            .iter()
            .chain(queues.waiting.iter())
            .cloned()
            .collect();
        for entry in &blocked {
            if !entry.lock.state().is_canceling() {
                self.send_blocking(queues, &entry.lock, entry.mode, batch);
            }
        }
    }
}
