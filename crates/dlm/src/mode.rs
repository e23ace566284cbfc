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

//! Lock modes, the static compatibility matrix and lock policies.
//!
//! ## Compatibility Matrix
//! ```text
//!        EX  PW  PR  CW  CR  NL
//!   EX   -   -   -   -   -   ✓
//!   PW   -   -   -   -   ✓   ✓
//!   PR   -   -   ✓   -   ✓   ✓
//!   CW   -   -   -   ✓   ✓   ✓
//!   CR   -   ✓   ✓   ✓   ✓   ✓
//!   NL   ✓   ✓   ✓   ✓   ✓   ✓
//! ```
//!
//! Two locks on one resource conflict iff their modes are incompatible AND
//! their policies overlap.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Access class requested by a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Exclusive
    #[serde(rename = "EX")]
    Exclusive = 0,
    /// Protected write
    #[serde(rename = "PW")]
    ProtectedWrite = 1,
    /// Protected read
    #[serde(rename = "PR")]
    ProtectedRead = 2,
    /// Concurrent write
    #[serde(rename = "CW")]
    ConcurrentWrite = 3,
    /// Concurrent read
    #[serde(rename = "CR")]
    ConcurrentRead = 4,
    /// Null (holds a reference, grants nothing)
    #[serde(rename = "NL")]
    Null = 5,
}

const EX: u8 = 1 << LockMode::Exclusive as u8;
const PW: u8 = 1 << LockMode::ProtectedWrite as u8;
const PR: u8 = 1 << LockMode::ProtectedRead as u8;
const CW: u8 = 1 << LockMode::ConcurrentWrite as u8;
const CR: u8 = 1 << LockMode::ConcurrentRead as u8;
const NL: u8 = 1 << LockMode::Null as u8;

impl LockMode {
    /// Every mode, strongest first.
    pub const ALL: [LockMode; 6] = [
        LockMode::Exclusive,
        LockMode::ProtectedWrite,
        LockMode::ProtectedRead,
        LockMode::ConcurrentWrite,
        LockMode::ConcurrentRead,
        LockMode::Null,
    ];

    fn bit(self) -> u8 {
        1 << self as u8
    }

    fn compat_mask(self) -> u8 {
        match self {
            LockMode::Exclusive => NL,
            LockMode::ProtectedWrite => NL | CR,
            LockMode::ProtectedRead => NL | CR | PR,
            LockMode::ConcurrentWrite => NL | CR | CW,
            LockMode::ConcurrentRead => NL | CR | PR | CW | PW,
            LockMode::Null => NL | CR | PR | CW | PW | EX,
        }
    }

    /// Whether two granted locks in these modes may coexist.
    pub fn is_compatible(self, other: LockMode) -> bool {
        self.compat_mask() & other.bit() != 0
    }

    /// Modes that may dirty cached data (glimpse targets).
    pub fn is_write(self) -> bool {
        matches!(
            self,
            LockMode::Exclusive | LockMode::ProtectedWrite | LockMode::ConcurrentWrite
        )
    }

    /// Short wire name (`EX`, `PW`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            LockMode::Exclusive => "EX",
            LockMode::ProtectedWrite => "PW",
            LockMode::ProtectedRead => "PR",
            LockMode::ConcurrentWrite => "CW",
            LockMode::ConcurrentRead => "CR",
            LockMode::Null => "NL",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LockMode::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown lock mode: {}", s))
    }
}

/// What part of a resource a lock covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LockPolicy {
    /// The whole resource
    Plain,
    /// Inclusive byte range `[start, end]`
    Extent {
        /// First byte covered
        start: u64,
        /// Last byte covered
        end: u64,
    },
    /// Bitmask of metadata parts (e.g. lookup, update, layout)
    InodeBits {
        /// Covered parts
        bits: u64,
    },
}

impl Default for LockPolicy {
    fn default() -> Self {
        LockPolicy::Plain
    }
}

impl LockPolicy {
    /// Whole-object extent.
    pub const WHOLE_FILE: LockPolicy = LockPolicy::Extent {
        start: 0,
        end: u64::MAX,
    };

    /// Extent policy covering `[start, end]`.
    pub fn extent(start: u64, end: u64) -> Self {
        LockPolicy::Extent { start, end }
    }

    /// Inode-bits policy.
    pub fn inode_bits(bits: u64) -> Self {
        LockPolicy::InodeBits { bits }
    }

    /// Reject empty ranges and empty bit sets.
    pub fn validate(&self) -> Result<(), String> {
        match *self {
            LockPolicy::Plain => Ok(()),
            LockPolicy::Extent { start, end } if start > end => {
                Err(format!("extent start {} beyond end {}", start, end))
            }
            LockPolicy::Extent { .. } => Ok(()),
            LockPolicy::InodeBits { bits: 0 } => Err("empty inode bits".to_string()),
            LockPolicy::InodeBits { .. } => Ok(()),
        }
    }

    /// Whether two policies cover a common part of the resource.
    ///
    /// Policies of different kinds are treated as overlapping.
    pub fn overlaps(&self, other: &LockPolicy) -> bool {
        match (*self, *other) {
            (
                LockPolicy::Extent { start: s1, end: e1 },
                LockPolicy::Extent { start: s2, end: e2 },
            ) => s1 <= e2 && s2 <= e1,
            (LockPolicy::InodeBits { bits: b1 }, LockPolicy::InodeBits { bits: b2 }) => b1 & b2 != 0,
            _ => true,
        }
    }
}

/// Whether `(mode_a, policy_a)` and `(mode_b, policy_b)` may not both be granted.
pub fn conflicts(
    mode_a: LockMode,
    policy_a: &LockPolicy,
    mode_b: LockMode,
    policy_b: &LockPolicy,
) -> bool {
    !mode_a.is_compatible(mode_b) && policy_a.overlaps(policy_b)
}
