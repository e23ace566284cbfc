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

//! Error types for control-plane requests.

use clusterlock_dlm::DlmError;
use thiserror::Error;

/// Result type for control-plane operations.
pub type CtlResult<T> = Result<T, CtlError>;

/// Errors raised while unpacking or executing an admin request.
#[derive(Error, Debug)]
pub enum CtlError {
    /// Input shorter than the fixed header
    #[error("Truncated request: need {needed} bytes, got {actual}")]
    Truncated {
        /// Bytes required
        needed: usize,
        /// Bytes available
        actual: usize,
    },

    /// Header magic does not match
    #[error("Bad magic: {0:#010x}")]
    BadMagic(u32),

    /// Unsupported header version
    #[error("Unsupported version: {0}")]
    BadVersion(u32),

    /// `total_len` disagrees with the inline buffer lengths or the input
    #[error("Length mismatch: header says {declared}, expected {expected}")]
    LengthMismatch {
        /// Length declared in the header
        declared: usize,
        /// Length computed from the inline slots
        expected: usize,
    },

    /// A used slot follows an empty one
    #[error("Inline slot {0} used after an empty slot")]
    Hole(usize),

    /// Inline buffer extends past the end of the input
    #[error("Inline slot {0} runs past the end of the request")]
    Overrun(usize),

    /// String argument lacks a terminating NUL
    #[error("Inline slot {0} is not NUL-terminated")]
    MissingNul(usize),

    /// String argument contains a NUL before its end
    #[error("Inline slot {0} contains an interior NUL")]
    InteriorNul(usize),

    /// Alignment padding is not zero
    #[error("Inline slot {0} has non-zero padding")]
    NonZeroPadding(usize),

    /// String argument is not valid UTF-8
    #[error("Inline slot {0} is not valid UTF-8")]
    InvalidUtf8(usize),

    /// Command number not recognized
    #[error("Unknown command: {0}")]
    UnknownCommand(u32),

    /// Argument missing or of the wrong shape for the command
    #[error("Invalid argument for {command}: {reason}")]
    InvalidArgument {
        /// Command name
        command: &'static str,
        /// What is wrong
        reason: String,
    },

    /// More inline buffers than the header can describe
    #[error("Too many inline buffers: {0}")]
    TooManyBuffers(usize),

    /// Lock manager error
    #[error("Lock manager error: {0}")]
    Dlm(#[from] DlmError),

    /// Response encoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
