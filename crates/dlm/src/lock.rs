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

//! Locks and the lock state machine.
//!
//! ## State Machine
//! ```text
//!   NEW ──> ENQUEUED ──┬──> GRANTED <──┐
//!    │         │       │      │  ▲     │
//!    │         │       └──> WAITING    │
//!    │         │              │   └── CONVERTING
//!    ▼         ▼              ▼           │
//!   CANCELING <─────────────────────────────┘
//!      │
//!      ▼
//!   CANCELED
//! ```
//! Every non-terminal state may move to `CANCELING`. Nothing reaches
//! `GRANTED` or `WAITING` without passing `ENQUEUED`.
//!
//! ## Primitives
//! A lock carries two primitives:
//! - `binding`: the lock's own mutual exclusion over its resource pointer.
//!   Outermost in the lock order; see [`crate::locking`].
//! - `inner`: a leaf guard over state, modes, flags and the pending
//!   notification queue. Never held across an `.await` and never held while
//!   acquiring anything else.

use crate::callback::Notification;
use crate::error::{DlmError, DlmResult};
use crate::handle::LockHandle;
use crate::mode::{LockMode, LockPolicy};
use crate::resource::{Resource, ResourceKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::time::Instant;

/// Lifecycle state of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockState {
    /// Allocated, not attached to any resource queue
    New,
    /// Attached to a resource, compatibility being evaluated
    Enqueued,
    /// Compatible with every granted lock
    Granted,
    /// Blocked behind a conflicting lock
    Waiting,
    /// Granted, with a different mode pending
    Converting,
    /// Cancel recorded, leaving the queues
    Canceling,
    /// Terminal
    Canceled,
}

impl LockState {
    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: LockState) -> bool {
        use LockState::*;
        matches!(
            (self, next),
            (New, Enqueued)
                | (Enqueued, Granted)
                | (Enqueued, Waiting)
                | (Waiting, Granted)
                | (Granted, Converting)
                | (Converting, Granted)
                | (Canceling, Canceled)
        ) || (next == Canceling && !self.is_canceling())
    }

    /// `CANCELING` or `CANCELED`
    pub fn is_canceling(self) -> bool {
        matches!(self, LockState::Canceling | LockState::Canceled)
    }

    /// Upper-case name
    pub fn as_str(self) -> &'static str {
        match self {
            LockState::New => "NEW",
            LockState::Enqueued => "ENQUEUED",
            LockState::Granted => "GRANTED",
            LockState::Waiting => "WAITING",
            LockState::Converting => "CONVERTING",
            LockState::Canceling => "CANCELING",
            LockState::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the connection/export that owns a lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Create an owner id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// State guarded by the lock's leaf primitive.
pub(crate) struct LockInner {
    pub(crate) state: LockState,
    pub(crate) requested_mode: LockMode,
    pub(crate) granted_mode: Option<LockMode>,
    pub(crate) granted_at: Option<DateTime<Utc>>,
    /// Mirror of the bound resource's key, updated together with `binding`
    pub(crate) resource_key: ResourceKey,
    /// A blocking notification has been queued for the current grant
    pub(crate) blocking_sent: bool,
    pub(crate) blocking_sent_at: Option<Instant>,
    pub(crate) timeout_reported: bool,
    /// Owner evicted: nothing is queued or delivered any more
    pub(crate) callbacks_suppressed: bool,
    /// Times a later request was granted past this waiter
    pub(crate) bypassed: u32,
    pub(crate) pending: VecDeque<Notification>,
    pub(crate) dispatch_scheduled: bool,
    history: VecDeque<LockState>,
    history_depth: usize,
}

impl LockInner {
    /// Apply a state machine edge, rejecting anything off the graph.
    pub(crate) fn advance(
        &mut self,
        handle: LockHandle,
        next: LockState,
        operation: &'static str,
    ) -> DlmResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(DlmError::ProtocolViolation {
                handle,
                state: self.state,
                operation,
            });
        }
        self.state = next;
        if self.history.len() == self.history_depth {
            self.history.pop_front();
        }
        self.history.push_back(next);
        Ok(())
    }

    pub(crate) fn history(&self) -> Vec<LockState> {
        self.history.iter().copied().collect()
    }
}

/// One principal's claim on a resource.
pub struct Lock {
    handle: LockHandle,
    owner: OwnerId,
    policy: LockPolicy,
    seq: u64,
    client_seq: Option<u64>,
    created_at: DateTime<Utc>,
    pub(crate) binding: Arc<tokio::sync::Mutex<Arc<Resource>>>,
    inner: Mutex<LockInner>,
    /// Set once the handle is removed and the lock left its queues
    retired: watch::Sender<bool>,
}

/// Construction parameters for [`Lock::new`].
pub(crate) struct LockParams {
    pub(crate) owner: OwnerId,
    pub(crate) mode: LockMode,
    pub(crate) policy: LockPolicy,
    pub(crate) seq: u64,
    pub(crate) client_seq: Option<u64>,
    pub(crate) history_depth: usize,
}

impl Lock {
    pub(crate) fn new(handle: LockHandle, resource: Arc<Resource>, params: LockParams) -> Self {
        let history_depth = params.history_depth.max(1);
        let mut history = VecDeque::with_capacity(history_depth);
        history.push_back(LockState::New);
        Self {
            handle,
            owner: params.owner,
            policy: params.policy,
            seq: params.seq,
            client_seq: params.client_seq,
            created_at: Utc::now(),
            inner: Mutex::new(LockInner {
                state: LockState::New,
                requested_mode: params.mode,
                granted_mode: None,
                granted_at: None,
                resource_key: resource.key(),
                blocking_sent: false,
                blocking_sent_at: None,
                timeout_reported: false,
                callbacks_suppressed: false,
                bypassed: 0,
                pending: VecDeque::new(),
                dispatch_scheduled: false,
                history,
                history_depth,
            }),
            binding: Arc::new(tokio::sync::Mutex::new(resource)),
            retired: watch::channel(false).0,
        }
    }

    /// Mark the cancel of this lock as complete and wake its waiters.
    pub(crate) fn mark_retired(&self) {
        self.retired.send_replace(true);
    }

    /// Wait until a cancel in progress on another task completes.
    pub(crate) async fn wait_retired(&self) {
        let mut rx = self.retired.subscribe();
        // The sender lives as long as `self`, so this only ends once retired.
        let _ = rx.wait_for(|retired| *retired).await;
    }

    fn inner(&self) -> MutexGuard<'_, LockInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with the leaf state guard held.
    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&mut LockInner) -> R) -> R {
        f(&mut self.inner())
    }

    /// Handle naming this lock
    pub fn handle(&self) -> LockHandle {
        self.handle
    }

    /// Owning connection
    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Range/bits covered
    pub fn policy(&self) -> &LockPolicy {
        &self.policy
    }

    /// Namespace-wide arrival sequence number
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Client-generated sequence number used for duplicate detection
    pub fn client_seq(&self) -> Option<u64> {
        self.client_seq
    }

    /// Current state
    pub fn state(&self) -> LockState {
        self.inner().state
    }

    /// Mode most recently requested (differs from the granted mode while converting)
    pub fn requested_mode(&self) -> LockMode {
        self.inner().requested_mode
    }

    /// Mode currently held, if any
    pub fn granted_mode(&self) -> Option<LockMode> {
        self.inner().granted_mode
    }

    /// Key of the resource this lock is bound to
    pub fn resource_key(&self) -> ResourceKey {
        self.inner().resource_key
    }

    /// Point-in-time view for introspection.
    pub fn snapshot(&self) -> LockSnapshot {
        let inner = self.inner();
        LockSnapshot {
            handle: self.handle.cookie(),
            owner: self.owner.clone(),
            resource: inner.resource_key,
            state: inner.state,
            requested_mode: inner.requested_mode,
            granted_mode: inner.granted_mode,
            policy: self.policy,
            seq: self.seq,
            created_at: self.created_at,
            granted_at: inner.granted_at,
            blocking_sent: inner.blocking_sent,
            history: inner.history(),
        }
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner();
        f.debug_struct("Lock")
            .field("handle", &self.handle)
            .field("owner", &self.owner)
            .field("resource", &inner.resource_key)
            .field("state", &inner.state)
            .field("requested_mode", &inner.requested_mode)
            .field("granted_mode", &inner.granted_mode)
            .finish()
    }
}

/// Serializable view of a lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockSnapshot {
    /// Wire cookie of the handle
    pub handle: u64,
    /// Owning connection
    pub owner: OwnerId,
    /// Bound resource
    pub resource: ResourceKey,
    /// Current state
    pub state: LockState,
    /// Requested mode
    pub requested_mode: LockMode,
    /// Granted mode
    pub granted_mode: Option<LockMode>,
    /// Policy
    pub policy: LockPolicy,
    /// Arrival sequence
    pub seq: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last grant time
    pub granted_at: Option<DateTime<Utc>>,
    /// Blocking notification outstanding
    pub blocking_sent: bool,
    /// Most recent states, oldest first
    pub history: Vec<LockState>,
}
