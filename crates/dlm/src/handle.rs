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

//! Generation-checked lock handle table.
//!
//! ## Purpose
//! Maps opaque [`LockHandle`]s to live locks so that remote nodes can name a
//! lock without exposing internal addresses.
//!
//! ## Design
//! An arena of slots, each carrying a generation counter. Removing an entry
//! bumps the slot generation, so a handle that outlived its lock can never
//! resolve to whatever later reuses the slot. The table is owned by a
//! namespace and passed by reference; there is no process-wide registry.
//!
//! Lookups hand out a new `Arc`, which is the lock's reference count: a lock
//! removed from the table stays readable by callers that already resolved
//! it and is reclaimed when the last of them drops it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Opaque, generation-checked reference to a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockHandle {
    index: u32,
    generation: u32,
}

impl LockHandle {
    /// Pack into a 64-bit wire cookie (`generation << 32 | index`).
    pub fn cookie(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    /// Unpack a wire cookie. The result may be stale or unknown.
    pub fn from_cookie(cookie: u64) -> Self {
        Self {
            index: cookie as u32,
            generation: (cookie >> 32) as u32,
        }
    }

    /// Slot index
    pub fn index(self) -> u32 {
        self.index
    }

    /// Slot generation at issue time
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.cookie())
    }
}

/// Result of classifying a handle against the table.
pub enum HandleStatus<T> {
    /// Handle resolves to a live entry
    Live(Arc<T>),
    /// Handle was issued earlier and its entry has since been removed
    Retired,
    /// Handle was never issued by this table
    Unknown,
}

struct Slot<T> {
    generation: u32,
    entry: Option<Arc<T>>,
}

struct Slots<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

/// Arena of generation-checked slots.
pub struct HandleTable<T> {
    inner: Mutex<Slots<T>>,
}

impl<T> HandleTable<T> {
    /// Create a table with room for `capacity` entries before growing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Slots {
                slots: Vec::with_capacity(capacity),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve a slot and build the entry with its handle.
    ///
    /// `build` runs with the table locked and must not touch the table.
    pub fn insert_with(&self, build: impl FnOnce(LockHandle) -> T) -> (LockHandle, Arc<T>) {
        let mut slots = self.slots();
        let index = match slots.free.pop() {
            Some(index) => index,
            None => {
                slots.slots.push(Slot {
                    generation: 1,
                    entry: None,
                });
                (slots.slots.len() - 1) as u32
            }
        };
        let slot = &mut slots.slots[index as usize];
        let handle = LockHandle {
            index,
            generation: slot.generation,
        };
        let entry = Arc::new(build(handle));
        slot.entry = Some(entry.clone());
        slots.live += 1;
        (handle, entry)
    }

    /// Resolve a handle to a live entry.
    pub fn get(&self, handle: LockHandle) -> Option<Arc<T>> {
        let slots = self.slots();
        let slot = slots.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.clone()
    }

    /// Classify a handle as live, retired or unknown.
    pub fn status(&self, handle: LockHandle) -> HandleStatus<T> {
        let slots = self.slots();
        let Some(slot) = slots.slots.get(handle.index as usize) else {
            return HandleStatus::Unknown;
        };
        if handle.generation == 0 {
            return HandleStatus::Unknown;
        }
        if slot.generation == handle.generation {
            return match &slot.entry {
                Some(entry) => HandleStatus::Live(entry.clone()),
                None => HandleStatus::Unknown,
            };
        }
        if handle.generation < slot.generation {
            HandleStatus::Retired
        } else {
            HandleStatus::Unknown
        }
    }

    /// Remove the entry for `handle`, invalidating the handle.
    ///
    /// Returns `None` if the handle was not live.
    pub fn remove(&self, handle: LockHandle) -> Option<Arc<T>> {
        let mut slots = self.slots();
        let slot = slots.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        slots.free.push(handle.index);
        slots.live -= 1;
        Some(entry)
    }

    /// All live entries, in slot order.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.slots()
            .slots
            .iter()
            .filter_map(|slot| slot.entry.clone())
            .collect()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.slots().live
    }

    /// Whether the table has no live entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
