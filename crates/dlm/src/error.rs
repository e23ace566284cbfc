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

//! Error types for lock manager operations.

use crate::handle::LockHandle;
use crate::lock::{LockState, OwnerId};
use thiserror::Error;

/// Result type for lock manager operations.
pub type DlmResult<T> = Result<T, DlmError>;

/// Errors that can occur during lock manager operations.
///
/// A request that conflicts with a granted lock is not an error: it is
/// reported as [`LockState::Waiting`] and resolved asynchronously.
#[derive(Error, Debug)]
pub enum DlmError {
    /// Handle is stale or was never issued. The caller should re-enqueue.
    #[error("Invalid lock handle: {0}")]
    InvalidHandle(LockHandle),

    /// Namespace is being torn down; the request is rejected and not retried.
    #[error("Namespace shutting down: {0}")]
    ResourceShuttingDown(String),

    /// Operation is not valid from the lock's current state.
    #[error("Protocol violation: cannot {operation} lock {handle} in state {state}")]
    ProtocolViolation {
        /// Lock the operation was applied to
        handle: LockHandle,
        /// State the lock was observed in
        state: LockState,
        /// Rejected operation
        operation: &'static str,
    },

    /// Peer tried to operate on a lock it does not own
    #[error("Lock {handle} is not owned by {owner}")]
    NotOwner {
        /// Lock named in the request
        handle: LockHandle,
        /// Requesting peer
        owner: OwnerId,
    },

    /// Malformed request (bad policy, empty owner, ...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Callback or request delivery failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Wire encoding/decoding error
    #[error("Codec error: {0}")]
    Codec(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<serde_json::Error> for DlmError {
    fn from(err: serde_json::Error) -> Self {
        DlmError::Codec(err.to_string())
    }
}
