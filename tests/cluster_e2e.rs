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

//! End-to-end tests: clients and a server exchanging encoded requests and
//! notifications through the in-process cluster.

use async_trait::async_trait;
use clusterlock::ctl::{AdminCommand, CtlResponse};
use clusterlock::dlm::{ErrorCode, Request, Response, UnresponsiveReason};
use clusterlock::testing::{InProcessCluster, TestError};
use clusterlock::{
    CallbackKind, ConvertStatus, DlmConfig, EvictionObserver, LockMode, LockState, OwnerId,
    ResourceKey,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const WAIT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct Reports(Mutex<Vec<(OwnerId, UnresponsiveReason)>>);

#[async_trait]
impl EvictionObserver for Reports {
    async fn report_unresponsive(&self, owner: &OwnerId, reason: UnresponsiveReason) {
        self.0.lock().await.push((owner.clone(), reason));
    }
}

fn cluster() -> (InProcessCluster, Arc<Reports>) {
    clusterlock::dlm::tracing_setup::init_tracing_with_default("warn");
    let reports = Arc::new(Reports::default());
    let cluster = InProcessCluster::start(
        DlmConfig::server("e2e").with_sweep_interval(Duration::ZERO),
        reports.clone(),
    )
    .unwrap();
    (cluster, reports)
}

#[tokio::test]
async fn test_writer_waits_for_readers_to_drop() {
    let (cluster, _) = cluster();
    let a = cluster.connect("a").await.unwrap();
    let b = cluster.connect("b").await.unwrap();
    let c = cluster.connect("c").await.unwrap();
    let key = ResourceKey::new(1, 0);

    let ra = a.enqueue(key, LockMode::ProtectedRead).await.unwrap();
    let rb = b.enqueue(key, LockMode::ProtectedRead).await.unwrap();
    assert_eq!(ra.state, LockState::Granted);
    assert_eq!(rb.state, LockState::Granted);

    let w = c.enqueue(key, LockMode::Exclusive).await.unwrap();
    assert_eq!(w.state, LockState::Waiting);
    // Not granted yet, so the client mirror is still unqueued.
    assert_eq!(c.local().lock_snapshot(w.local).unwrap().state, LockState::New);

    for (client, lock) in [(&a, &ra), (&b, &rb)] {
        let n = client.next_notification(WAIT).await.unwrap();
        assert_eq!(n.kind, CallbackKind::Blocking);
        assert_eq!(n.handle.cookie(), lock.remote);
        let conflict = n.conflicting.unwrap();
        assert_eq!(conflict.owner.as_str(), "c");
        assert_eq!(conflict.mode, Some(LockMode::Exclusive));
        assert_eq!(client.cancel(lock).await.unwrap(), LockState::Canceled);
    }

    let done = c.next_notification(WAIT).await.unwrap();
    assert_eq!(done.kind, CallbackKind::Completion);
    assert_eq!(done.mode, LockMode::Exclusive);

    let mirror = c.local().lock_snapshot(w.local).unwrap();
    assert_eq!(mirror.state, LockState::Granted);
    assert_eq!(mirror.granted_mode, Some(LockMode::Exclusive));
    assert_eq!(mirror.resource, key);
}

#[tokio::test]
async fn test_client_lock_is_rebound_to_server_resource() {
    let (cluster, _) = cluster();
    let a = cluster.connect("a").await.unwrap();
    let key = ResourceKey::new(42, 7);

    let lock = a.enqueue(key, LockMode::ConcurrentRead).await.unwrap();
    let local = a.local().lock_snapshot(lock.local).unwrap();
    assert_eq!(local.resource, key);
    assert_eq!(local.state, LockState::Granted);
    assert!(a.local().resource_snapshot(key).await.is_some());

    let remote = cluster.server().locks();
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].handle, lock.remote);
    assert_eq!(remote[0].owner.as_str(), "a");
}

#[tokio::test]
async fn test_upgrade_completes_after_peer_cancels() {
    let (cluster, _) = cluster();
    let a = cluster.connect("a").await.unwrap();
    let b = cluster.connect("b").await.unwrap();
    let key = ResourceKey::new(3, 0);

    let ra = a.enqueue(key, LockMode::ProtectedRead).await.unwrap();
    let rb = b.enqueue(key, LockMode::ProtectedRead).await.unwrap();

    assert_eq!(
        a.convert(&ra, LockMode::Exclusive).await.unwrap(),
        ConvertStatus::Pending
    );
    let blocking = b.next_notification(WAIT).await.unwrap();
    assert_eq!(blocking.kind, CallbackKind::Blocking);
    b.cancel(&rb).await.unwrap();

    let done = a.next_notification(WAIT).await.unwrap();
    assert_eq!(done.kind, CallbackKind::Completion);
    assert_eq!(done.mode, LockMode::Exclusive);
    assert_eq!(
        a.local().lock_snapshot(ra.local).unwrap().granted_mode,
        Some(LockMode::Exclusive)
    );
}

#[tokio::test]
async fn test_partitioned_holder_is_reported_and_evicted() {
    let (cluster, reports) = cluster();
    let a = cluster.connect("a").await.unwrap();
    let b = cluster.connect("b").await.unwrap();
    let key = ResourceKey::new(5, 0);

    a.enqueue(key, LockMode::Exclusive).await.unwrap();
    cluster.partition("a").await;

    let w = b.enqueue(key, LockMode::ProtectedWrite).await.unwrap();
    assert_eq!(w.state, LockState::Waiting);
    cluster.server().quiesce().await;

    {
        let reports = reports.0.lock().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0.as_str(), "a");
        assert!(matches!(
            reports[0].1,
            UnresponsiveReason::CallbackDeliveryFailed { .. }
        ));
    }

    let evicted = cluster
        .admin()
        .execute(AdminCommand::Evict {
            owner: OwnerId::new("a"),
        })
        .await
        .unwrap();
    assert!(matches!(evicted, CtlResponse::Evicted { locks: 1, .. }));

    let done = b.next_notification(WAIT).await.unwrap();
    assert_eq!(done.kind, CallbackKind::Completion);
    assert_eq!(done.handle.cookie(), w.remote);
    // Nothing was delivered to the partitioned client.
    assert!(matches!(
        a.next_notification(Duration::from_millis(50)).await,
        Err(TestError::Timeout)
    ));
}

#[tokio::test]
async fn test_foreign_cancel_is_rejected() {
    let (cluster, _) = cluster();
    let a = cluster.connect("a").await.unwrap();
    let b = cluster.connect("b").await.unwrap();

    let lock = a
        .enqueue(ResourceKey::new(6, 0), LockMode::ProtectedRead)
        .await
        .unwrap();
    match b.cancel(&lock).await {
        Err(TestError::Rejected { code, .. }) => assert_eq!(code, ErrorCode::NotOwner),
        other => panic!("expected rejection, got {:?}", other.map(|_| ())),
    }
    assert_eq!(
        cluster.server().locks()[0].state,
        LockState::Granted
    );
}

#[tokio::test]
async fn test_resent_enqueue_returns_same_lock() {
    let (cluster, _) = cluster();
    let a = cluster.connect("a").await.unwrap();
    let request = Request::Enqueue {
        key: ResourceKey::new(8, 0),
        mode: LockMode::ProtectedWrite,
        policy: Default::default(),
        client_seq: Some(99),
    };

    let first = a.send(&request).await.unwrap();
    let second = a.send(&request).await.unwrap();
    let (Response::Enqueued { handle: h1, .. }, Response::Enqueued { handle: h2, .. }) =
        (first, second)
    else {
        panic!("enqueue failed");
    };
    assert_eq!(h1, h2);
    assert_eq!(cluster.server().lock_count(), 1);
}

#[tokio::test]
async fn test_shutdown_rejects_clients() {
    let (cluster, _) = cluster();
    let a = cluster.connect("a").await.unwrap();
    a.enqueue(ResourceKey::new(9, 0), LockMode::ConcurrentWrite)
        .await
        .unwrap();

    cluster.shutdown().await;
    match a.enqueue(ResourceKey::new(9, 1), LockMode::ConcurrentWrite).await {
        Err(TestError::Rejected { code, .. }) => assert_eq!(code, ErrorCode::ShuttingDown),
        other => panic!("expected shutdown rejection, got {:?}", other.map(|_| ())),
    }
    assert_eq!(cluster.server().lock_count(), 0);
    // The failed enqueue left nothing behind locally.
    assert_eq!(a.local().locks().len(), 1);
}
