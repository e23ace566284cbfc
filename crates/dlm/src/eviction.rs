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

//! Liveness reporting towards the eviction policy.
//!
//! The lock manager never evicts on its own. Holders that fail callback
//! delivery or ignore a blocking callback past its deadline are reported
//! here; the policy decides and answers with
//! [`Namespace::evict_owner`](crate::Namespace::evict_owner).

use crate::handle::LockHandle;
use crate::lock::OwnerId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Why an owner is considered unresponsive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnresponsiveReason {
    /// Transport failed to deliver a notification
    CallbackDeliveryFailed {
        /// Lock the notification was for
        handle: LockHandle,
        /// Transport error text
        error: String,
    },
    /// Holder neither canceled nor converted after a blocking callback
    BlockingTimeout {
        /// Lock that was asked to give way
        handle: LockHandle,
        /// Time since the blocking callback was queued
        waited_ms: u64,
    },
}

/// Consumer of unresponsive-owner reports.
#[async_trait]
pub trait EvictionObserver: Send + Sync {
    /// Record that `owner` looks unreachable.
    async fn report_unresponsive(&self, owner: &OwnerId, reason: UnresponsiveReason);
}

/// Observer that only logs.
#[derive(Debug, Default, Clone)]
pub struct LoggingEvictionObserver;

#[async_trait]
impl EvictionObserver for LoggingEvictionObserver {
    async fn report_unresponsive(&self, owner: &OwnerId, reason: UnresponsiveReason) {
        warn!(owner = %owner, reason = ?reason, "Lock owner unresponsive");
    }
}
