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

//! Locking discipline for reaching a lock's resource.
//!
//! ## Lock Order
//! 1. a lock's `binding` (its own primitive over the resource pointer)
//! 2. a resource's queues
//! 3. a lock's leaf state guard
//! 4. namespace leaf maps (resource index, handle table, replay index)
//!
//! Levels 3 and 4 are plain mutexes that are never held across an `.await`.
//!
//! ## Roles
//! On a server-role namespace a lock's resource is fixed at creation, so the
//! binding is released as soon as the pointer has been read. On a
//! client-role namespace the pointer may be rebound (the resource becomes
//! known from the server's reply), and rebinding only ever happens with the
//! binding held and no resource primitive held. Keeping the binding until the
//! resource primitive is acquired, and until the guard is dropped, closes the
//! window in which a caller could operate on a stale resource.

use crate::config::NamespaceRole;
use crate::lock::Lock;
use crate::resource::{Resource, ResourceQueues};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

/// Resource primitive held on behalf of a lock.
///
/// Fields drop in declaration order, so the resource primitive is released
/// before the lock's binding on the client-role path.
pub struct ResourceLockGuard {
    queues: OwnedMutexGuard<ResourceQueues>,
    binding: Option<OwnedMutexGuard<Arc<Resource>>>,
    resource: Arc<Resource>,
}

impl ResourceLockGuard {
    /// Resource whose primitive is held
    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }

    /// Whether the lock's binding is also held (client role)
    pub fn holds_binding(&self) -> bool {
        self.binding.is_some()
    }
}

impl Deref for ResourceLockGuard {
    type Target = ResourceQueues;

    fn deref(&self) -> &ResourceQueues {
        &self.queues
    }
}

impl DerefMut for ResourceLockGuard {
    fn deref_mut(&mut self) -> &mut ResourceQueues {
        &mut self.queues
    }
}

/// Take the lock's binding alone (rebinding path).
pub(crate) async fn lock_binding(lock: &Lock) -> OwnedMutexGuard<Arc<Resource>> {
    lock.binding.clone().lock_owned().await
}

/// Acquire the primitive of the resource `lock` is bound to.
pub async fn lock_resource_of(role: NamespaceRole, lock: &Lock) -> ResourceLockGuard {
    lock_resource_with(role, lock, || async {}).await
}

/// [`lock_resource_of`] with a hook that runs between reading the resource
/// pointer and acquiring the resource primitive.
pub async fn lock_resource_with<F, Fut>(
    role: NamespaceRole,
    lock: &Lock,
    between: F,
) -> ResourceLockGuard
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    let binding = lock_binding(lock).await;
    let resource = Arc::clone(&binding);
    match role {
        NamespaceRole::Server => {
            drop(binding);
            between().await;
            let queues = resource.lock_queues().await;
            ResourceLockGuard {
                queues,
                binding: None,
                resource,
            }
        }
        NamespaceRole::Client => {
            between().await;
            let queues = resource.lock_queues().await;
            ResourceLockGuard {
                queues,
                binding: Some(binding),
                resource,
            }
        }
    }
}
