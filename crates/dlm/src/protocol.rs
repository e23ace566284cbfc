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

//! Request boundary: JSON-encoded lock requests from peers.
//!
//! The transport hands raw bytes and the authenticated peer identity to
//! [`RequestHandler::handle`], which always answers with an encoded
//! [`Response`]. Errors become typed error responses; nothing here panics
//! on malformed input.
//!
//! Requests may arrive more than once. Enqueues carrying a `client_seq`
//! are answered with the original handle, and cancel is idempotent.

use crate::callback::Notification;
use crate::engine::{ConvertStatus, EnqueueRequest};
use crate::error::{DlmError, DlmResult};
use crate::handle::LockHandle;
use crate::lock::{LockState, OwnerId};
use crate::mode::{LockMode, LockPolicy};
use crate::resource::ResourceKey;
use crate::service::LockService;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Request from a peer. The owner is always the peer itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Create and queue a lock
    Enqueue {
        /// Resource to lock
        key: ResourceKey,
        /// Requested mode
        mode: LockMode,
        /// Range or bits covered
        #[serde(default)]
        policy: LockPolicy,
        /// Duplicate detection sequence number
        #[serde(default)]
        client_seq: Option<u64>,
    },
    /// Change the mode of a granted lock
    Convert {
        /// Handle cookie
        handle: u64,
        /// Target mode
        mode: LockMode,
    },
    /// Cancel a lock
    Cancel {
        /// Handle cookie
        handle: u64,
    },
    /// Ask write-capable holders for their cached state
    Glimpse {
        /// Resource to glimpse
        key: ResourceKey,
    },
}

/// Machine-readable error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Handle stale or unknown: re-enqueue
    InvalidHandle,
    /// Server stopping: do not retry
    ShuttingDown,
    /// Operation invalid in the lock's state
    ProtocolViolation,
    /// Lock belongs to another peer
    NotOwner,
    /// Malformed request
    InvalidRequest,
    /// Bytes could not be decoded
    Codec,
    /// Anything else
    Internal,
}

impl From<&DlmError> for ErrorCode {
    fn from(err: &DlmError) -> Self {
        match err {
            DlmError::InvalidHandle(_) => ErrorCode::InvalidHandle,
            DlmError::ResourceShuttingDown(_) => ErrorCode::ShuttingDown,
            DlmError::ProtocolViolation { .. } => ErrorCode::ProtocolViolation,
            DlmError::NotOwner { .. } => ErrorCode::NotOwner,
            DlmError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            DlmError::Codec(_) => ErrorCode::Codec,
            DlmError::Transport(_) | DlmError::ConfigError(_) => ErrorCode::Internal,
        }
    }
}

/// Reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// Lock created (or found by client sequence)
    Enqueued {
        /// Handle cookie
        handle: u64,
        /// `GRANTED` or `WAITING`
        state: LockState,
        /// Mode held, if granted
        granted_mode: Option<LockMode>,
    },
    /// Conversion accepted
    Converted {
        /// Granted now or pending
        result: ConvertStatus,
    },
    /// Lock canceled
    Canceled {
        /// Always `CANCELED`
        state: LockState,
    },
    /// Glimpse fanned out
    Glimpsed {
        /// Notifications queued
        queued: usize,
    },
    /// Request failed
    Error {
        /// Error class
        code: ErrorCode,
        /// Human-readable detail
        message: String,
    },
}

impl Response {
    fn error(err: &DlmError) -> Self {
        Response::Error {
            code: ErrorCode::from(err),
            message: err.to_string(),
        }
    }
}

impl Request {
    /// Encode to wire bytes
    pub fn encode(&self) -> DlmResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from wire bytes
    pub fn decode(bytes: &[u8]) -> DlmResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl Response {
    /// Encode to wire bytes
    pub fn encode(&self) -> DlmResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from wire bytes
    pub fn decode(bytes: &[u8]) -> DlmResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Encode a notification for the callback transport.
pub fn encode_notification(notification: &Notification) -> DlmResult<Vec<u8>> {
    Ok(serde_json::to_vec(notification)?)
}

/// Decode a notification received from the callback transport.
pub fn decode_notification(bytes: &[u8]) -> DlmResult<Notification> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Decodes peer requests and runs them against a [`LockService`].
pub struct RequestHandler {
    service: Arc<dyn LockService>,
}

impl RequestHandler {
    /// Create a handler for `service`
    pub fn new(service: Arc<dyn LockService>) -> Self {
        Self { service }
    }

    /// Decode, execute and encode. Always returns a response.
    pub async fn handle(&self, peer: &OwnerId, bytes: &[u8]) -> Vec<u8> {
        let response = match Request::decode(bytes) {
            Ok(request) => self.dispatch(peer, request).await,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Undecodable request");
                Response::error(&e)
            }
        };
        match response.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Response encoding failed");
                br#"{"status":"error","code":"internal","message":"response encoding failed"}"#
                    .to_vec()
            }
        }
    }

    /// Execute a decoded request on behalf of `peer`.
    pub async fn dispatch(&self, peer: &OwnerId, request: Request) -> Response {
        debug!(peer = %peer, request = ?request, "Handling request");
        let result = match request {
            Request::Enqueue {
                key,
                mode,
                policy,
                client_seq,
            } => {
                let request = EnqueueRequest {
                    key,
                    mode,
                    policy,
                    owner: peer.clone(),
                    client_seq,
                };
                self.service
                    .enqueue(request)
                    .await
                    .map(|reply| Response::Enqueued {
                        handle: reply.handle.cookie(),
                        state: reply.state,
                        granted_mode: reply.granted_mode,
                    })
            }
            Request::Convert { handle, mode } => {
                let handle = LockHandle::from_cookie(handle);
                match self.check_owner(peer, handle, false).await {
                    Ok(()) => self
                        .service
                        .convert(handle, mode)
                        .await
                        .map(|result| Response::Converted { result }),
                    Err(e) => Err(e),
                }
            }
            Request::Cancel { handle } => {
                let handle = LockHandle::from_cookie(handle);
                match self.check_owner(peer, handle, true).await {
                    Ok(()) => self
                        .service
                        .cancel(handle)
                        .await
                        .map(|state| Response::Canceled { state }),
                    Err(e) => Err(e),
                }
            }
            Request::Glimpse { key } => self
                .service
                .glimpse(key, peer)
                .await
                .map(|queued| Response::Glimpsed { queued }),
        };

        result.unwrap_or_else(|e| {
            debug!(peer = %peer, error = %e, "Request failed");
            Response::error(&e)
        })
    }

    /// Reject operations on another peer's lock. With `allow_stale`, a
    /// handle that no longer resolves is passed through so the service can
    /// answer it (cancel is idempotent).
    async fn check_owner(&self, peer: &OwnerId, handle: LockHandle, allow_stale: bool) -> DlmResult<()> {
        match self.service.lock_snapshot(handle).await {
            Ok(snapshot) if &snapshot.owner != peer => {
                warn!(peer = %peer, handle = %handle, owner = %snapshot.owner, "Request for foreign lock");
                Err(DlmError::NotOwner {
                    handle,
                    owner: peer.clone(),
                })
            }
            Ok(_) => Ok(()),
            Err(DlmError::InvalidHandle(_)) if allow_stale => Ok(()),
            Err(e) => Err(e),
        }
    }
}
