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

//! Lock manager configuration.
//!
//! ## Environment Variables
//! - `CLUSTERLOCK_NAMESPACE`: namespace name (default: `default`)
//! - `CLUSTERLOCK_ROLE`: `server` or `client` (default: `server`)
//! - `CLUSTERLOCK_DISPATCH_WORKERS`: concurrent callback deliveries (default: 8)
//! - `CLUSTERLOCK_BYPASS_LIMIT`: grants allowed past a waiter, `none` for unbounded (default: 16)
//! - `CLUSTERLOCK_BLOCKING_TIMEOUT_MS`: blocking callback deadline (default: 30000)
//! - `CLUSTERLOCK_SWEEP_INTERVAL_MS`: timeout sweep period, `0` disables (default: 1000)

use crate::error::{DlmError, DlmResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Which side of the protocol a namespace serves.
///
/// The role changes only the locking discipline (see [`crate::locking`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceRole {
    /// Resource binding fixed at lock creation
    #[default]
    Server,
    /// Resource binding may be reassigned while the lock is `NEW`
    Client,
}

impl fmt::Display for NamespaceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamespaceRole::Server => f.write_str("server"),
            NamespaceRole::Client => f.write_str("client"),
        }
    }
}

impl FromStr for NamespaceRole {
    type Err = DlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "server" => Ok(NamespaceRole::Server),
            "client" => Ok(NamespaceRole::Client),
            other => Err(DlmError::ConfigError(format!("Invalid role: {}", other))),
        }
    }
}

/// Namespace configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlmConfig {
    /// Namespace name (for logs and metrics)
    pub namespace: String,

    /// Server or client role
    pub role: NamespaceRole,

    /// Maximum concurrent callback delivery tasks
    pub dispatch_workers: usize,

    /// How many later requests may be granted past a conflicting waiter
    /// before new conflicting requests queue behind it. `None` = unbounded.
    pub starvation_bypass_limit: Option<u32>,

    /// Time a holder has to cancel or convert after a blocking callback
    /// before it is reported to the eviction observer
    pub blocking_timeout_ms: u64,

    /// Period of the background timeout sweep (0 disables it)
    pub sweep_interval_ms: u64,

    /// Initial handle table capacity
    pub initial_handle_capacity: usize,

    /// State transitions remembered per lock
    pub history_depth: usize,
}

impl Default for DlmConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            role: NamespaceRole::Server,
            dispatch_workers: 8,
            starvation_bypass_limit: Some(16),
            blocking_timeout_ms: 30_000,
            sweep_interval_ms: 1_000,
            initial_handle_capacity: 1024,
            history_depth: 16,
        }
    }
}

impl DlmConfig {
    /// Server-role config with defaults
    pub fn server(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            role: NamespaceRole::Server,
            ..Default::default()
        }
    }

    /// Client-role config with defaults
    pub fn client(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            role: NamespaceRole::Client,
            ..Default::default()
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> DlmResult<Self> {
        let defaults = Self::default();
        let config = Self {
            namespace: env::var("CLUSTERLOCK_NAMESPACE").unwrap_or(defaults.namespace),
            role: match env::var("CLUSTERLOCK_ROLE") {
                Ok(role) => role.parse()?,
                Err(_) => defaults.role,
            },
            dispatch_workers: parse_env("CLUSTERLOCK_DISPATCH_WORKERS", defaults.dispatch_workers)?,
            starvation_bypass_limit: match env::var("CLUSTERLOCK_BYPASS_LIMIT") {
                Ok(v) if v.eq_ignore_ascii_case("none") => None,
                Ok(v) => Some(v.parse().map_err(|_| {
                    DlmError::ConfigError(format!("Invalid CLUSTERLOCK_BYPASS_LIMIT: {}", v))
                })?),
                Err(_) => defaults.starvation_bypass_limit,
            },
            blocking_timeout_ms: parse_env(
                "CLUSTERLOCK_BLOCKING_TIMEOUT_MS",
                defaults.blocking_timeout_ms,
            )?,
            sweep_interval_ms: parse_env("CLUSTERLOCK_SWEEP_INTERVAL_MS", defaults.sweep_interval_ms)?,
            initial_handle_capacity: defaults.initial_handle_capacity,
            history_depth: defaults.history_depth,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> DlmResult<()> {
        if self.namespace.is_empty() {
            return Err(DlmError::ConfigError("namespace is required".to_string()));
        }
        if self.dispatch_workers == 0 {
            return Err(DlmError::ConfigError(
                "dispatch_workers must be at least 1".to_string(),
            ));
        }
        if self.blocking_timeout_ms == 0 {
            return Err(DlmError::ConfigError(
                "blocking_timeout_ms must be positive".to_string(),
            ));
        }
        if self.history_depth == 0 {
            return Err(DlmError::ConfigError(
                "history_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the bypass limit
    pub fn with_bypass_limit(mut self, limit: Option<u32>) -> Self {
        self.starvation_bypass_limit = limit;
        self
    }

    /// Set the blocking callback timeout
    pub fn with_blocking_timeout(mut self, timeout: Duration) -> Self {
        self.blocking_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the sweep interval (zero disables the sweeper)
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the delivery concurrency
    pub fn with_dispatch_workers(mut self, workers: usize) -> Self {
        self.dispatch_workers = workers;
        self
    }

    /// Blocking callback timeout as a `Duration`
    pub fn blocking_timeout(&self) -> Duration {
        Duration::from_millis(self.blocking_timeout_ms)
    }

    /// Sweep interval, if the sweeper is enabled
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_ms > 0).then(|| Duration::from_millis(self.sweep_interval_ms))
    }
}

fn parse_env<T: FromStr>(name: &str, default: T) -> DlmResult<T> {
    match env::var(name) {
        Ok(v) => v
            .parse()
            .map_err(|_| DlmError::ConfigError(format!("Invalid {}: {}", name, v))),
        Err(_) => Ok(default),
    }
}
