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

//! Administrative commands over a lock namespace.

use crate::error::{CtlError, CtlResult};
use crate::packing::{CtlCommand, CtlRequest};
use clusterlock_dlm::{LockHandle, LockSnapshot, LockState, Namespace, OwnerId, ResourceSnapshot};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Decoded administrative command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    /// List live locks, optionally for one owner
    ListLocks {
        /// Owner filter
        owner: Option<OwnerId>,
    },
    /// List resources with their queues
    ListResources,
    /// Cancel one lock regardless of owner
    ForceCancel {
        /// Lock to cancel
        handle: LockHandle,
    },
    /// Evict an owner
    Evict {
        /// Owner to evict
        owner: OwnerId,
    },
}

impl AdminCommand {
    /// Interpret the inline buffers of a validated request.
    pub fn from_request(request: &CtlRequest) -> CtlResult<Self> {
        let command = request.command();
        let expect_slots = |max: usize| -> CtlResult<()> {
            if request.inline_count() > max {
                return Err(CtlError::InvalidArgument {
                    command: command.as_str(),
                    reason: format!("expected at most {} arguments, got {}", max, request.inline_count()),
                });
            }
            Ok(())
        };
        let missing = |what: &str| CtlError::InvalidArgument {
            command: command.as_str(),
            reason: format!("missing {}", what),
        };

        match command {
            CtlCommand::ListLocks => {
                expect_slots(1)?;
                Ok(AdminCommand::ListLocks {
                    owner: request.inline_str(0)?.map(OwnerId::new),
                })
            }
            CtlCommand::ListResources => {
                expect_slots(0)?;
                Ok(AdminCommand::ListResources)
            }
            CtlCommand::ForceCancel => {
                expect_slots(1)?;
                let cookie = request.inline_u64(0)?.ok_or_else(|| missing("handle"))?;
                Ok(AdminCommand::ForceCancel {
                    handle: LockHandle::from_cookie(cookie),
                })
            }
            CtlCommand::Evict => {
                expect_slots(1)?;
                let owner = request.inline_str(0)?.ok_or_else(|| missing("owner"))?;
                if owner.is_empty() {
                    return Err(missing("owner"));
                }
                Ok(AdminCommand::Evict {
                    owner: OwnerId::new(owner),
                })
            }
        }
    }

    /// Build the packed request for this command.
    pub fn to_request(&self) -> CtlResult<CtlRequest> {
        match self {
            AdminCommand::ListLocks { owner } => {
                CtlRequest::list_locks(owner.as_ref().map(OwnerId::as_str))
            }
            AdminCommand::ListResources => Ok(CtlRequest::list_resources()),
            AdminCommand::ForceCancel { handle } => Ok(CtlRequest::force_cancel(handle.cookie())),
            AdminCommand::Evict { owner } => CtlRequest::evict(owner.as_str()),
        }
    }
}

/// JSON document returned for every administrative request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CtlResponse {
    /// Lock listing
    Locks {
        /// Snapshots in arrival order
        locks: Vec<LockSnapshot>,
    },
    /// Resource listing
    Resources {
        /// Snapshots ordered by key
        resources: Vec<ResourceSnapshot>,
    },
    /// Force-cancel outcome
    Canceled {
        /// Handle cookie
        handle: u64,
        /// Final state
        state: LockState,
    },
    /// Eviction outcome
    Evicted {
        /// Evicted owner
        owner: OwnerId,
        /// Locks canceled
        locks: usize,
    },
    /// Request rejected
    Error {
        /// Error text
        message: String,
    },
}

impl CtlResponse {
    /// Encode as a JSON document.
    pub fn encode(&self) -> CtlResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Runs administrative commands against a namespace.
pub struct AdminHandler {
    namespace: Arc<Namespace>,
}

impl AdminHandler {
    /// Create a handler for `namespace`
    pub fn new(namespace: Arc<Namespace>) -> Self {
        Self { namespace }
    }

    /// Execute a decoded command.
    pub async fn execute(&self, command: AdminCommand) -> CtlResult<CtlResponse> {
        match command {
            AdminCommand::ListLocks { owner } => {
                let locks = self
                    .namespace
                    .locks()
                    .into_iter()
                    .filter(|lock| owner.as_ref().map_or(true, |o| &lock.owner == o))
                    .collect();
                Ok(CtlResponse::Locks { locks })
            }
            AdminCommand::ListResources => Ok(CtlResponse::Resources {
                resources: self.namespace.resource_snapshots().await,
            }),
            AdminCommand::ForceCancel { handle } => {
                let state = self.namespace.cancel(handle).await?;
                info!(namespace = %self.namespace.name(), handle = %handle, "Lock force-canceled");
                Ok(CtlResponse::Canceled {
                    handle: handle.cookie(),
                    state,
                })
            }
            AdminCommand::Evict { owner } => {
                let locks = self.namespace.evict_owner(&owner).await;
                Ok(CtlResponse::Evicted { owner, locks })
            }
        }
    }

    /// Unpack, execute and encode. Always returns a JSON document.
    pub async fn handle_packed(&self, bytes: &[u8]) -> Vec<u8> {
        let response = match self.run_packed(bytes).await {
            Ok(response) => response,
            Err(e) => {
                warn!(namespace = %self.namespace.name(), error = %e, "Admin request rejected");
                CtlResponse::Error {
                    message: e.to_string(),
                }
            }
        };
        match response.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Admin response encoding failed");
                br#"{"result":"error","message":"response encoding failed"}"#.to_vec()
            }
        }
    }

    async fn run_packed(&self, bytes: &[u8]) -> CtlResult<CtlResponse> {
        let request = CtlRequest::unpack(bytes)?;
        let command = AdminCommand::from_request(&request)?;
        self.execute(command).await
    }
}
