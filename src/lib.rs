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

//! ClusterLock: the lock-coordination core of a cluster filesystem.
//!
//! Core design:
//! - Servers own resources and grant, convert and revoke locks on them
//! - Clients mirror granted locks and honor blocking callbacks
//! - Conflicts never block callers: revocation is asynchronous
//!
//! Crates:
//! 1. [`dlm`]: resource/lock model, engine, callback dispatch, request boundary
//! 2. [`ctl`]: packed administrative requests

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub use clusterlock_ctl as ctl;
pub use clusterlock_dlm as dlm;

// In-process cluster for tests and demos
pub mod testing;

// Re-export core types for convenience
pub use ctl::{AdminCommand, AdminHandler, CtlRequest, CtlResponse};
pub use dlm::{
    CallbackKind, CallbackSink, ConvertStatus, DlmConfig, DlmError, DlmResult, EnqueueReply,
    EnqueueRequest, EvictionObserver, LockHandle, LockMode, LockPolicy, LockState, Namespace,
    NamespaceRole, Notification, OwnerId, ResourceKey,
};
