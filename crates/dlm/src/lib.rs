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

//! # ClusterLock Distributed Lock Manager
//!
//! ## Purpose
//! Grants, converts and revokes locks on shared named resources across
//! cooperating nodes, giving clients cache-coherent access to data and
//! metadata owned by servers.
//!
//! ## Architecture Context
//! - **Server namespace**: authoritative queues for the resources a node owns
//! - **Client namespace**: local mirror of granted locks; resources become
//!   known from server replies, so locks may be rebound while still `NEW`
//! - **Transport**: external, reached through [`CallbackSink`] (outbound
//!   notifications) and [`RequestHandler`] (inbound requests)
//! - **Eviction policy**: external, fed by [`EvictionObserver`]
//!
//! ## Design Decisions
//! - **Handles, not pointers**: locks are named by generation-checked
//!   [`LockHandle`]s owned by a [`Namespace`]
//! - **Two-level locking**: a lock's binding, then its resource's queues,
//!   acquired only through [`locking::lock_resource_of`]
//! - **Asynchronous revocation**: conflicts never block the caller; they
//!   produce `WAITING` plus blocking notifications to the holders
//! - **Deferred delivery**: notifications are queued under the resource
//!   primitive and delivered by worker tasks after it is released
//! - **Bounded bypass**: a waiter can be passed by compatible requests at
//!   most `starvation_bypass_limit` times
//!
//! ## Examples
//!
//! ### Basic Usage
//! ```rust,no_run
//! use clusterlock_dlm::{
//!     DlmConfig, EnqueueRequest, LockMode, LoggingEvictionObserver, Namespace, ResourceKey,
//! };
//! # use clusterlock_dlm::{CallbackSink, DlmResult, Notification, OwnerId};
//! # use std::sync::Arc;
//! # struct Sink;
//! # #[async_trait::async_trait]
//! # impl CallbackSink for Sink {
//! #     async fn deliver(&self, _: &OwnerId, _: &Notification) -> DlmResult<()> { Ok(()) }
//! # }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ns = Namespace::new(
//!     DlmConfig::server("mdt0"),
//!     Arc::new(Sink),
//!     Arc::new(LoggingEvictionObserver),
//! )?;
//!
//! let key = ResourceKey::new(0x200000401, 0);
//! let reply = ns.enqueue(EnqueueRequest::new(key, LockMode::ProtectedRead, "client-1")).await?;
//! ns.convert(reply.handle, LockMode::Exclusive).await?;
//! ns.cancel(reply.handle).await?;
//! ns.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod callback;
pub mod config;
pub mod engine;
pub mod error;
pub mod eviction;
pub mod handle;
pub mod lock;
pub mod locking;
pub mod mode;
pub mod namespace;
pub mod protocol;
pub mod resource;
pub mod service;
pub mod tracing_setup;

pub use callback::{CallbackDispatcher, CallbackKind, CallbackSink, ConflictDescriptor, Notification};
pub use config::{DlmConfig, NamespaceRole};
pub use engine::{ConvertStatus, EnqueueReply, EnqueueRequest};
pub use error::{DlmError, DlmResult};
pub use eviction::{EvictionObserver, LoggingEvictionObserver, UnresponsiveReason};
pub use handle::{HandleStatus, HandleTable, LockHandle};
pub use lock::{Lock, LockSnapshot, LockState, OwnerId};
pub use locking::ResourceLockGuard;
pub use mode::{conflicts, LockMode, LockPolicy};
pub use namespace::Namespace;
pub use protocol::{ErrorCode, Request, RequestHandler, Response};
pub use resource::{Resource, ResourceKey, ResourceQueues, ResourceSnapshot};
pub use service::LockService;
