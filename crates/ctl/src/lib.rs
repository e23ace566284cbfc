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

//! # ClusterLock Control Plane
//!
//! ## Purpose
//! Operator access to a running lock namespace: list locks and resources,
//! force-cancel a lock, evict an unresponsive owner.
//!
//! ## Design
//! - **Packed requests** ([`packing`]): fixed little-endian header plus up
//!   to four 8-byte aligned inline buffers, validated before use
//! - **Commands** ([`admin`]): decoded from the inline buffers and executed
//!   against a [`clusterlock_dlm::Namespace`]
//! - **Responses**: JSON documents
//!
//! ## Examples
//! ```rust,ignore
//! use clusterlock_ctl::{AdminHandler, CtlRequest};
//!
//! let admin = AdminHandler::new(namespace.clone());
//! let reply = admin.handle_packed(&CtlRequest::evict("client-7")?.pack()?).await;
//! ```

pub mod admin;
pub mod error;
pub mod packing;

pub use admin::{AdminCommand, AdminHandler, CtlResponse};
pub use error::{CtlError, CtlResult};
pub use packing::{CtlCommand, CtlHeader, CtlRequest};
