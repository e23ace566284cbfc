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

//! Shared fixtures for lock manager integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use clusterlock_dlm::{
    CallbackKind, CallbackSink, DlmConfig, DlmError, DlmResult, EvictionObserver, LockHandle,
    Namespace, Notification, OwnerId, UnresponsiveReason,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Sink that records every delivered notification.
#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<(OwnerId, Notification)>>,
    unreachable: Mutex<HashSet<OwnerId>>,
}

impl RecordingSink {
    pub async fn make_unreachable(&self, owner: &str) {
        self.unreachable.lock().await.insert(OwnerId::new(owner));
    }

    pub async fn all(&self) -> Vec<(OwnerId, Notification)> {
        self.delivered.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.delivered.lock().await.clear();
    }

    pub async fn for_owner(&self, owner: &str) -> Vec<Notification> {
        self.delivered
            .lock()
            .await
            .iter()
            .filter(|(o, _)| o.as_str() == owner)
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub async fn count(&self, handle: LockHandle, kind: CallbackKind) -> usize {
        self.delivered
            .lock()
            .await
            .iter()
            .filter(|(_, n)| n.handle == handle && n.kind == kind)
            .count()
    }
}

#[async_trait]
impl CallbackSink for RecordingSink {
    async fn deliver(&self, owner: &OwnerId, notification: &Notification) -> DlmResult<()> {
        if self.unreachable.lock().await.contains(owner) {
            return Err(DlmError::Transport(format!("{} unreachable", owner)));
        }
        self.delivered
            .lock()
            .await
            .push((owner.clone(), notification.clone()));
        Ok(())
    }
}

/// Observer that records every report.
#[derive(Default)]
pub struct RecordingObserver {
    reports: Mutex<Vec<(OwnerId, UnresponsiveReason)>>,
}

impl RecordingObserver {
    pub async fn reports(&self) -> Vec<(OwnerId, UnresponsiveReason)> {
        self.reports.lock().await.clone()
    }
}

#[async_trait]
impl EvictionObserver for RecordingObserver {
    async fn report_unresponsive(&self, owner: &OwnerId, reason: UnresponsiveReason) {
        self.reports.lock().await.push((owner.clone(), reason));
    }
}

pub struct Fixture {
    pub ns: Arc<Namespace>,
    pub sink: Arc<RecordingSink>,
    pub observer: Arc<RecordingObserver>,
}

impl Fixture {
    /// Server namespace with the sweeper off
    pub fn server() -> Self {
        Self::with_config(DlmConfig::server("test").with_sweep_interval(Duration::ZERO))
    }

    pub fn with_config(config: DlmConfig) -> Self {
        clusterlock_dlm::tracing_setup::init_tracing_with_default("warn");
        let sink = Arc::new(RecordingSink::default());
        let observer = Arc::new(RecordingObserver::default());
        let ns = Namespace::new(config, sink.clone(), observer.clone()).unwrap();
        Self { ns, sink, observer }
    }

    /// Wait for every queued notification to be delivered.
    pub async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.ns.quiesce())
            .await
            .expect("callbacks did not settle");
    }
}
