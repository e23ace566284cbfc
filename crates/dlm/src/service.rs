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

//! Lock service trait: the operations a request boundary needs.

use crate::engine::{ConvertStatus, EnqueueReply, EnqueueRequest};
use crate::error::DlmResult;
use crate::handle::LockHandle;
use crate::lock::{LockSnapshot, LockState, OwnerId};
use crate::mode::LockMode;
use crate::namespace::Namespace;
use crate::resource::ResourceKey;
use async_trait::async_trait;

/// Trait for lock enqueue/convert/cancel coordination.
///
/// ## Purpose
/// Decouples request decoding (see [`crate::protocol`]) from the lock
/// engine, so a boundary can be tested against a stub.
///
/// ## Design
/// - **Enqueue**: never blocks on a conflict; returns `WAITING` and a
///   completion notification follows the grant
/// - **Convert**: old mode is kept until the new mode is granted
/// - **Cancel**: idempotent for handles this service issued
/// - **Glimpse**: fan-out to write-capable holders, answered out of band
///
/// ## Example
/// ```rust,ignore
/// use clusterlock_dlm::{EnqueueRequest, LockMode, LockService, ResourceKey};
///
/// let reply = service
///     .enqueue(EnqueueRequest::new(ResourceKey::new(1, 0), LockMode::ProtectedRead, "client-a"))
///     .await?;
/// service.cancel(reply.handle).await?;
/// ```
#[async_trait]
pub trait LockService: Send + Sync {
    /// Create and queue a lock.
    ///
    /// ## Returns
    /// - `Ok(EnqueueReply)`: state `GRANTED` or `WAITING`
    /// - `Err(DlmError::ResourceShuttingDown)`: service is stopping
    async fn enqueue(&self, request: EnqueueRequest) -> DlmResult<EnqueueReply>;

    /// Change the mode of a granted lock.
    ///
    /// ## Returns
    /// - `Ok(ConvertStatus::Granted)` or `Ok(ConvertStatus::Pending)`
    /// - `Err(DlmError::InvalidHandle)`: handle is stale or unknown
    /// - `Err(DlmError::ProtocolViolation)`: lock is not `GRANTED`
    async fn convert(&self, handle: LockHandle, mode: LockMode) -> DlmResult<ConvertStatus>;

    /// Cancel a lock.
    ///
    /// ## Returns
    /// - `Ok(LockState::Canceled)`: canceled now or earlier
    /// - `Err(DlmError::InvalidHandle)`: handle was never issued
    async fn cancel(&self, handle: LockHandle) -> DlmResult<LockState>;

    /// Queue glimpse notifications for write-capable holders of `key`.
    async fn glimpse(&self, key: ResourceKey, requester: &OwnerId) -> DlmResult<usize>;

    /// Current view of a live lock.
    async fn lock_snapshot(&self, handle: LockHandle) -> DlmResult<LockSnapshot>;
}

#[async_trait]
impl LockService for Namespace {
    async fn enqueue(&self, request: EnqueueRequest) -> DlmResult<EnqueueReply> {
        Namespace::enqueue(self, request).await
    }

    async fn convert(&self, handle: LockHandle, mode: LockMode) -> DlmResult<ConvertStatus> {
        Namespace::convert(self, handle, mode).await
    }

    async fn cancel(&self, handle: LockHandle) -> DlmResult<LockState> {
        Namespace::cancel(self, handle).await
    }

    async fn glimpse(&self, key: ResourceKey, requester: &OwnerId) -> DlmResult<usize> {
        Namespace::glimpse(self, key, requester).await
    }

    async fn lock_snapshot(&self, handle: LockHandle) -> DlmResult<LockSnapshot> {
        Namespace::lock_snapshot(self, handle)
    }
}
