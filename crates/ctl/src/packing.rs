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

//! Packed control-plane requests.
//!
//! ## Layout
//! ```text
//! offset  size  field
//! 0       4     magic         (little-endian)
//! 4       4     version
//! 8       4     total_len     header + padded inline buffers
//! 12      4     command
//! 16      16    inline_len[4]
//! 32      ...   inline buffers, each zero-padded to 8 bytes
//! ```
//! Slots are used front to back: an empty slot may not be followed by a
//! used one. String arguments carry exactly one NUL, at the end.

use crate::error::{CtlError, CtlResult};
use serde::{Deserialize, Serialize};
use std::fmt;

// -- constants --
/// `"CLKC"` read as a little-endian `u32`
pub const CTL_MAGIC: u32 = u32::from_le_bytes(*b"CLKC");
/// Current layout version
pub const CTL_VERSION: u32 = 1;
/// Fixed header size
pub const CTL_HEADER_SIZE: usize = 32;
/// Number of inline buffer slots
pub const CTL_INLINE_SLOTS: usize = 4;
/// Inline buffer alignment
pub const CTL_ALIGN: usize = 8;

#[inline]
fn round_up(len: usize) -> usize {
    (len + CTL_ALIGN - 1) & !(CTL_ALIGN - 1)
}

#[inline]
fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// Administrative command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CtlCommand {
    /// List locks, optionally for one owner (slot 0: owner string)
    ListLocks,
    /// List resources and their queues
    ListResources,
    /// Cancel one lock (slot 0: handle cookie, 8 bytes LE)
    ForceCancel,
    /// Evict an owner (slot 0: owner string)
    Evict,
}

impl CtlCommand {
    /// Wire code
    pub fn code(self) -> u32 {
        match self {
            CtlCommand::ListLocks => 1,
            CtlCommand::ListResources => 2,
            CtlCommand::ForceCancel => 3,
            CtlCommand::Evict => 4,
        }
    }

    /// Parse a wire code
    pub fn from_code(code: u32) -> CtlResult<Self> {
        match code {
            1 => Ok(CtlCommand::ListLocks),
            2 => Ok(CtlCommand::ListResources),
            3 => Ok(CtlCommand::ForceCancel),
            4 => Ok(CtlCommand::Evict),
            other => Err(CtlError::UnknownCommand(other)),
        }
    }

    /// Command name
    pub fn as_str(self) -> &'static str {
        match self {
            CtlCommand::ListLocks => "list_locks",
            CtlCommand::ListResources => "list_resources",
            CtlCommand::ForceCancel => "force_cancel",
            CtlCommand::Evict => "evict",
        }
    }
}

impl fmt::Display for CtlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtlHeader {
    /// Must be [`CTL_MAGIC`]
    pub magic: u32,
    /// Must be [`CTL_VERSION`]
    pub version: u32,
    /// Header plus padded inline buffers
    pub total_len: u32,
    /// Command code
    pub command: u32,
    /// Unpadded length of each inline buffer
    pub inline_len: [u32; CTL_INLINE_SLOTS],
}

impl CtlHeader {
    /// Encode to the wire layout
    pub fn encode(&self) -> [u8; CTL_HEADER_SIZE] {
        let mut buf = [0u8; CTL_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.total_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.command.to_le_bytes());
        for (slot, len) in self.inline_len.iter().enumerate() {
            let offset = 16 + slot * 4;
            buf[offset..offset + 4].copy_from_slice(&len.to_le_bytes());
        }
        buf
    }

    /// Decode and check magic and version.
    pub fn decode(buf: &[u8]) -> CtlResult<Self> {
        if buf.len() < CTL_HEADER_SIZE {
            return Err(CtlError::Truncated {
                needed: CTL_HEADER_SIZE,
                actual: buf.len(),
            });
        }
        let magic = read_u32(buf, 0);
        if magic != CTL_MAGIC {
            return Err(CtlError::BadMagic(magic));
        }
        let version = read_u32(buf, 4);
        if version != CTL_VERSION {
            return Err(CtlError::BadVersion(version));
        }
        let mut inline_len = [0u32; CTL_INLINE_SLOTS];
        for (slot, len) in inline_len.iter_mut().enumerate() {
            *len = read_u32(buf, 16 + slot * 4);
        }
        Ok(Self {
            magic,
            version,
            total_len: read_u32(buf, 8),
            command: read_u32(buf, 12),
            inline_len,
        })
    }

    /// Length the header implies: fixed part plus padded buffers.
    pub fn expected_len(&self) -> u64 {
        CTL_HEADER_SIZE as u64
            + self
                .inline_len
                .iter()
                .map(|len| round_up(*len as usize) as u64)
                .sum::<u64>()
    }
}

/// Encode a string argument with its terminating NUL.
pub fn string_arg(command: CtlCommand, value: &str) -> CtlResult<Vec<u8>> {
    if value.as_bytes().contains(&0) {
        return Err(CtlError::InvalidArgument {
            command: command.as_str(),
            reason: "string contains NUL".to_string(),
        });
    }
    let mut buf = Vec::with_capacity(value.len() + 1);
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
    Ok(buf)
}

/// An administrative request with up to four inline buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtlRequest {
    command: CtlCommand,
    inline: Vec<Vec<u8>>,
}

impl CtlRequest {
    /// Build a request. Empty buffers are only allowed at the end and are dropped.
    pub fn new(command: CtlCommand, mut inline: Vec<Vec<u8>>) -> CtlResult<Self> {
        while inline.last().is_some_and(|buf| buf.is_empty()) {
            inline.pop();
        }
        if inline.len() > CTL_INLINE_SLOTS {
            return Err(CtlError::TooManyBuffers(inline.len()));
        }
        if let Some(empty) = inline.iter().position(|buf| buf.is_empty()) {
            let used = inline[empty..]
                .iter()
                .position(|buf| !buf.is_empty())
                .map_or(inline.len(), |offset| empty + offset);
            return Err(CtlError::Hole(used));
        }
        Ok(Self { command, inline })
    }

    /// `ListLocks`, optionally filtered by owner
    pub fn list_locks(owner: Option<&str>) -> CtlResult<Self> {
        let inline = match owner {
            Some(owner) => vec![string_arg(CtlCommand::ListLocks, owner)?],
            None => Vec::new(),
        };
        Self::new(CtlCommand::ListLocks, inline)
    }

    /// `ListResources`
    pub fn list_resources() -> Self {
        Self {
            command: CtlCommand::ListResources,
            inline: Vec::new(),
        }
    }

    /// `ForceCancel` of a handle cookie
    pub fn force_cancel(cookie: u64) -> Self {
        Self {
            command: CtlCommand::ForceCancel,
            inline: vec![cookie.to_le_bytes().to_vec()],
        }
    }

    /// `Evict` an owner
    pub fn evict(owner: &str) -> CtlResult<Self> {
        Self::new(CtlCommand::Evict, vec![string_arg(CtlCommand::Evict, owner)?])
    }

    /// Command
    pub fn command(&self) -> CtlCommand {
        self.command
    }

    /// Raw inline buffer, if the slot is used
    pub fn inline(&self, slot: usize) -> Option<&[u8]> {
        self.inline.get(slot).map(Vec::as_slice)
    }

    /// Number of used slots
    pub fn inline_count(&self) -> usize {
        self.inline.len()
    }

    /// Encode to the wire layout.
    pub fn pack(&self) -> CtlResult<Vec<u8>> {
        let mut inline_len = [0u32; CTL_INLINE_SLOTS];
        for (slot, buf) in self.inline.iter().enumerate() {
            inline_len[slot] = u32::try_from(buf.len()).map_err(|_| CtlError::InvalidArgument {
                command: self.command.as_str(),
                reason: format!("inline slot {} too large", slot),
            })?;
        }
        let mut header = CtlHeader {
            magic: CTL_MAGIC,
            version: CTL_VERSION,
            total_len: 0,
            command: self.command.code(),
            inline_len,
        };
        let total = header.expected_len();
        header.total_len = u32::try_from(total).map_err(|_| CtlError::LengthMismatch {
            declared: u32::MAX as usize,
            expected: total as usize,
        })?;

        let mut out = Vec::with_capacity(total as usize);
        out.extend_from_slice(&header.encode());
        for buf in &self.inline {
            out.extend_from_slice(buf);
            out.resize(out.len() + round_up(buf.len()) - buf.len(), 0);
        }
        Ok(out)
    }

    /// Decode and validate a packed request.
    pub fn unpack(bytes: &[u8]) -> CtlResult<Self> {
        let header = CtlHeader::decode(bytes)?;

        let used = header.inline_len.iter().take_while(|len| **len != 0).count();
        if let Some(offset) = header.inline_len[used..].iter().position(|len| *len != 0) {
            return Err(CtlError::Hole(used + offset));
        }

        let expected = header.expected_len();
        if u64::from(header.total_len) != expected {
            return Err(CtlError::LengthMismatch {
                declared: header.total_len as usize,
                expected: expected as usize,
            });
        }

        let mut inline = Vec::with_capacity(used);
        let mut offset = CTL_HEADER_SIZE;
        for (slot, len) in header.inline_len[..used].iter().enumerate() {
            let len = *len as usize;
            let padded = round_up(len);
            if bytes.len() < offset + padded {
                return Err(CtlError::Overrun(slot));
            }
            if bytes[offset + len..offset + padded].iter().any(|b| *b != 0) {
                return Err(CtlError::NonZeroPadding(slot));
            }
            inline.push(bytes[offset..offset + len].to_vec());
            offset += padded;
        }
        if bytes.len() != offset {
            return Err(CtlError::LengthMismatch {
                declared: header.total_len as usize,
                expected: bytes.len(),
            });
        }

        let command = CtlCommand::from_code(header.command)?;
        Ok(Self { command, inline })
    }

    /// Inline buffer `slot` as a NUL-terminated string.
    pub fn inline_str(&self, slot: usize) -> CtlResult<Option<&str>> {
        let Some(buf) = self.inline(slot) else {
            return Ok(None);
        };
        let Some((last, body)) = buf.split_last() else {
            return Err(CtlError::MissingNul(slot));
        };
        if *last != 0 {
            return Err(CtlError::MissingNul(slot));
        }
        if body.contains(&0) {
            return Err(CtlError::InteriorNul(slot));
        }
        std::str::from_utf8(body)
            .map(Some)
            .map_err(|_| CtlError::InvalidUtf8(slot))
    }

    /// Inline buffer `slot` as a little-endian `u64`.
    pub fn inline_u64(&self, slot: usize) -> CtlResult<Option<u64>> {
        let Some(buf) = self.inline(slot) else {
            return Ok(None);
        };
        let bytes: [u8; 8] = buf.try_into().map_err(|_| CtlError::InvalidArgument {
            command: self.command.as_str(),
            reason: format!("slot {} must be 8 bytes, got {}", slot, buf.len()),
        })?;
        Ok(Some(u64::from_le_bytes(bytes)))
    }
}
