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

//! Resources and their lock queues.

use crate::handle::LockHandle;
use crate::lock::Lock;
use crate::mode::{conflicts, LockMode, LockPolicy};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Fixed-width composite resource name, unique within a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Object identifier
    pub object_id: u64,
    /// Sub-key within the object (e.g. extent group)
    pub sub_key: u64,
}

impl ResourceKey {
    /// Create a key
    pub fn new(object_id: u64, sub_key: u64) -> Self {
        Self { object_id, sub_key }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}:{:#x}]", self.object_id, self.sub_key)
    }
}

/// A lock's position in one of the resource queues.
///
/// `mode` is the granted mode on the granted queue and the requested mode
/// on the converting and waiting queues. It only changes with the resource
/// primitive held.
#[derive(Clone)]
pub(crate) struct QueueEntry {
    pub(crate) lock: Arc<Lock>,
    pub(crate) mode: LockMode,
}

impl QueueEntry {
    pub(crate) fn new(lock: Arc<Lock>, mode: LockMode) -> Self {
        Self { lock, mode }
    }

    pub(crate) fn handle(&self) -> LockHandle {
        self.lock.handle()
    }

    pub(crate) fn policy(&self) -> &LockPolicy {
        self.lock.policy()
    }

    pub(crate) fn conflicts_with(&self, mode: LockMode, policy: &LockPolicy) -> bool {
        conflicts(self.mode, self.policy(), mode, policy)
    }
}

/// Queues protected by the resource's own primitive.
#[derive(Default)]
pub struct ResourceQueues {
    pub(crate) granted: Vec<QueueEntry>,
    pub(crate) converting: VecDeque<QueueEntry>,
    pub(crate) waiting: VecDeque<QueueEntry>,
}

impl ResourceQueues {
    /// Whether no lock is queued at all
    pub fn is_empty(&self) -> bool {
        self.granted.is_empty() && self.converting.is_empty() && self.waiting.is_empty()
    }

    /// Granted handles with their granted modes, in grant order
    pub fn granted(&self) -> Vec<(LockHandle, LockMode)> {
        self.granted.iter().map(|e| (e.handle(), e.mode)).collect()
    }

    /// Converting handles with their target modes
    pub fn converting(&self) -> Vec<(LockHandle, LockMode)> {
        self.converting.iter().map(|e| (e.handle(), e.mode)).collect()
    }

    /// Waiting handles with their requested modes, in arrival order
    pub fn waiting(&self) -> Vec<(LockHandle, LockMode)> {
        self.waiting.iter().map(|e| (e.handle(), e.mode)).collect()
    }

    /// Granted locks other than `handle` that conflict with `(mode, policy)`.
    pub(crate) fn granted_conflicts(
        &self,
        handle: LockHandle,
        mode: LockMode,
        policy: &LockPolicy,
    ) -> Vec<Arc<Lock>> {
        self.granted
            .iter()
            .filter(|e| e.handle() != handle && e.conflicts_with(mode, policy))
            .map(|e| e.lock.clone())
            .collect()
    }

    /// Insert into the waiting queue by arrival sequence.
    pub(crate) fn push_waiting(&mut self, entry: QueueEntry) {
        let seq = entry.lock.seq();
        let pos = self
            .waiting
            .iter()
            .position(|e| e.lock.seq() > seq)
            .unwrap_or(self.waiting.len());
        self.waiting.insert(pos, entry);
    }

    /// Update the granted mode recorded for `handle`.
    pub(crate) fn set_granted_mode(&mut self, handle: LockHandle, mode: LockMode) {
        if let Some(entry) = self.granted.iter_mut().find(|e| e.handle() == handle) {
            entry.mode = mode;
        }
    }

    /// Drop `handle` from every queue. Returns whether it was queued.
    pub(crate) fn remove(&mut self, handle: LockHandle) -> bool {
        let before = self.granted.len() + self.converting.len() + self.waiting.len();
        self.granted.retain(|e| e.handle() != handle);
        self.converting.retain(|e| e.handle() != handle);
        self.waiting.retain(|e| e.handle() != handle);
        before != self.granted.len() + self.converting.len() + self.waiting.len()
    }

    /// Whether every pair of granted locks is compatible.
    pub fn granted_pairwise_compatible(&self) -> bool {
        self.granted.iter().enumerate().all(|(i, a)| {
            self.granted[i + 1..]
                .iter()
                .all(|b| !a.conflicts_with(b.mode, b.policy()))
        })
    }
}

/// Named, reference-counted lockable entity.
pub struct Resource {
    key: ResourceKey,
    refs: AtomicUsize,
    queues: Arc<Mutex<ResourceQueues>>,
}

impl Resource {
    pub(crate) fn new(key: ResourceKey) -> Self {
        Self {
            key,
            refs: AtomicUsize::new(0),
            queues: Arc::new(Mutex::new(ResourceQueues::default())),
        }
    }

    /// Immutable key
    pub fn key(&self) -> ResourceKey {
        self.key
    }

    /// Current reference count (locks bound + lookups in progress)
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn get_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a reference. Returns `true` if it was the last one.
    pub(crate) fn put_ref(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Take the resource's own primitive.
    pub(crate) async fn lock_queues(&self) -> tokio::sync::OwnedMutexGuard<ResourceQueues> {
        self.queues.clone().lock_owned().await
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("key", &self.key)
            .field("refs", &self.refs())
            .finish()
    }
}

/// Serializable view of a resource and its queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Resource key
    pub key: ResourceKey,
    /// Reference count at snapshot time
    pub refs: usize,
    /// `(handle cookie, granted mode)` in grant order
    pub granted: Vec<(u64, LockMode)>,
    /// `(handle cookie, target mode)` in conversion order
    pub converting: Vec<(u64, LockMode)>,
    /// `(handle cookie, requested mode)` in arrival order
    pub waiting: Vec<(u64, LockMode)>,
}

impl ResourceSnapshot {
    pub(crate) fn capture(resource: &Resource, queues: &ResourceQueues) -> Self {
        let cookies = |v: Vec<(LockHandle, LockMode)>| {
            v.into_iter().map(|(h, m)| (h.cookie(), m)).collect()
        };
        Self {
            key: resource.key(),
            refs: resource.refs(),
            granted: cookies(queues.granted()),
            converting: cookies(queues.converting()),
            waiting: cookies(queues.waiting()),
        }
    }
}
