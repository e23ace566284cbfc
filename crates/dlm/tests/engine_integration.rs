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

//! Enqueue/convert/cancel integration tests.
//!
//! These tests verify:
//! - Grant, wait and completion on cancel
//! - Stale handle handling and idempotent cancel
//! - Arrival-order fairness and the bounded bypass of incompatible waiters
//! - Conversions, blocking notifications and glimpses

mod common;

use clusterlock_dlm::{
    CallbackKind, ConvertStatus, DlmConfig, DlmError, EnqueueRequest, LockMode, LockPolicy,
    LockState, OwnerId, ResourceKey,
};
use common::Fixture;
use std::time::Duration;

const R1: ResourceKey = ResourceKey {
    object_id: 0x2_0000_0401,
    sub_key: 0,
};

fn request(mode: LockMode, owner: &str) -> EnqueueRequest {
    EnqueueRequest::new(R1, mode, owner)
}

#[tokio::test]
async fn test_exclusive_on_idle_resource_is_granted() {
    let fx = Fixture::server();

    let reply = fx.ns.enqueue(request(LockMode::Exclusive, "a")).await.unwrap();

    assert_eq!(reply.state, LockState::Granted);
    assert_eq!(reply.granted_mode, Some(LockMode::Exclusive));
    let snapshot = fx.ns.resource_snapshot(R1).await.unwrap();
    assert_eq!(snapshot.granted, vec![(reply.handle.cookie(), LockMode::Exclusive)]);
}

#[tokio::test]
async fn test_waiter_granted_with_completion_after_cancel() {
    let fx = Fixture::server();
    let a = fx.ns.enqueue(request(LockMode::Exclusive, "a")).await.unwrap();
    let b = fx.ns.enqueue(request(LockMode::Exclusive, "b")).await.unwrap();
    assert_eq!(b.state, LockState::Waiting);
    assert_eq!(b.granted_mode, None);

    fx.settle().await;
    let to_a = fx.sink.for_owner("a").await;
    assert_eq!(to_a.len(), 1);
    assert_eq!(to_a[0].kind, CallbackKind::Blocking);
    let conflicting = to_a[0].conflicting.clone().unwrap();
    assert_eq!(conflicting.handle, Some(b.handle));
    assert_eq!(conflicting.owner, OwnerId::new("b"));

    assert_eq!(fx.ns.cancel(a.handle).await.unwrap(), LockState::Canceled);
    fx.settle().await;

    let b_lock = fx.ns.lookup(b.handle).unwrap();
    assert_eq!(b_lock.state(), LockState::Granted);
    let to_b = fx.sink.for_owner("b").await;
    assert_eq!(to_b.len(), 1);
    assert_eq!(to_b[0].kind, CallbackKind::Completion);
    assert_eq!(to_b[0].mode, LockMode::Exclusive);
}

#[tokio::test]
async fn test_convert_canceled_handle_is_invalid() {
    let fx = Fixture::server();
    let a = fx.ns.enqueue(request(LockMode::Exclusive, "a")).await.unwrap();
    fx.ns.cancel(a.handle).await.unwrap();

    let err = fx.ns.convert(a.handle, LockMode::ProtectedRead).await.unwrap_err();
    assert!(matches!(err, DlmError::InvalidHandle(h) if h == a.handle));
}

#[tokio::test]
async fn test_compatible_requests_both_granted() {
    let fx = Fixture::server();
    let a = fx.ns.enqueue(request(LockMode::ConcurrentRead, "a")).await.unwrap();
    let b = fx.ns.enqueue(request(LockMode::ConcurrentRead, "b")).await.unwrap();

    assert_eq!(a.state, LockState::Granted);
    assert_eq!(b.state, LockState::Granted);
    fx.settle().await;
    assert!(fx.sink.all().await.is_empty());
}

#[tokio::test]
async fn test_cancel_twice() {
    let fx = Fixture::server();
    let a = fx.ns.enqueue(request(LockMode::ProtectedWrite, "a")).await.unwrap();

    assert_eq!(fx.ns.cancel(a.handle).await.unwrap(), LockState::Canceled);
    assert_eq!(fx.ns.cancel(a.handle).await.unwrap(), LockState::Canceled);
    assert_eq!(fx.ns.lock_count(), 0);
}

#[tokio::test]
async fn test_cancel_of_never_issued_handle() {
    let fx = Fixture::server();
    let a = fx.ns.enqueue(request(LockMode::ProtectedWrite, "a")).await.unwrap();
    let bogus = clusterlock_dlm::LockHandle::from_cookie(a.handle.cookie() + (5u64 << 32));

    assert!(matches!(
        fx.ns.cancel(bogus).await,
        Err(DlmError::InvalidHandle(_))
    ));
    assert_eq!(fx.ns.lookup(a.handle).unwrap().state(), LockState::Granted);
}

#[tokio::test]
async fn test_equal_mode_waiters_granted_in_arrival_order() {
    let fx = Fixture::server();
    let holder = fx.ns.enqueue(request(LockMode::Exclusive, "holder")).await.unwrap();
    let w1 = fx.ns.enqueue(request(LockMode::Exclusive, "w1")).await.unwrap();
    let w2 = fx.ns.enqueue(request(LockMode::Exclusive, "w2")).await.unwrap();

    fx.ns.cancel(holder.handle).await.unwrap();
    assert_eq!(fx.ns.lookup(w1.handle).unwrap().state(), LockState::Granted);
    assert_eq!(fx.ns.lookup(w2.handle).unwrap().state(), LockState::Waiting);

    fx.ns.cancel(w1.handle).await.unwrap();
    assert_eq!(fx.ns.lookup(w2.handle).unwrap().state(), LockState::Granted);
}

#[tokio::test]
async fn test_compatible_request_passes_incompatible_waiter() {
    let fx = Fixture::server();
    fx.ns.enqueue(request(LockMode::ProtectedRead, "reader-1")).await.unwrap();
    let writer = fx.ns.enqueue(request(LockMode::Exclusive, "writer")).await.unwrap();
    let reader = fx.ns.enqueue(request(LockMode::ProtectedRead, "reader-2")).await.unwrap();

    assert_eq!(writer.state, LockState::Waiting);
    assert_eq!(reader.state, LockState::Granted);
}

#[tokio::test]
async fn test_bypass_limit_bounds_writer_wait() {
    let fx = Fixture::with_config(
        DlmConfig::server("bounded")
            .with_bypass_limit(Some(2))
            .with_sweep_interval(Duration::ZERO),
    );
    let r0 = fx.ns.enqueue(request(LockMode::ProtectedRead, "r0")).await.unwrap();
    let writer = fx.ns.enqueue(request(LockMode::Exclusive, "writer")).await.unwrap();
    let r1 = fx.ns.enqueue(request(LockMode::ProtectedRead, "r1")).await.unwrap();
    let r2 = fx.ns.enqueue(request(LockMode::ProtectedRead, "r2")).await.unwrap();
    let r3 = fx.ns.enqueue(request(LockMode::ProtectedRead, "r3")).await.unwrap();

    assert_eq!(r1.state, LockState::Granted);
    assert_eq!(r2.state, LockState::Granted);
    assert_eq!(r3.state, LockState::Waiting);

    for reader in [r0, r1, r2] {
        fx.ns.cancel(reader.handle).await.unwrap();
    }
    assert_eq!(fx.ns.lookup(writer.handle).unwrap().state(), LockState::Granted);
    assert_eq!(fx.ns.lookup(r3.handle).unwrap().state(), LockState::Waiting);

    fx.ns.cancel(writer.handle).await.unwrap();
    assert_eq!(fx.ns.lookup(r3.handle).unwrap().state(), LockState::Granted);
}

#[tokio::test]
async fn test_unbounded_bypass_keeps_admitting_readers() {
    let fx = Fixture::with_config(
        DlmConfig::server("unbounded")
            .with_bypass_limit(None)
            .with_sweep_interval(Duration::ZERO),
    );
    fx.ns.enqueue(request(LockMode::ProtectedRead, "r0")).await.unwrap();
    let writer = fx.ns.enqueue(request(LockMode::Exclusive, "writer")).await.unwrap();
    for i in 0..64 {
        let reply = fx
            .ns
            .enqueue(request(LockMode::ProtectedRead, &format!("r{}", i + 1)))
            .await
            .unwrap();
        assert_eq!(reply.state, LockState::Granted);
    }
    assert_eq!(fx.ns.lookup(writer.handle).unwrap().state(), LockState::Waiting);
}

#[tokio::test]
async fn test_transition_history_passes_enqueued() {
    let fx = Fixture::server();
    let a = fx.ns.enqueue(request(LockMode::Exclusive, "a")).await.unwrap();
    let b = fx.ns.enqueue(request(LockMode::Exclusive, "b")).await.unwrap();
    fx.ns.cancel(a.handle).await.unwrap();
    fx.ns.convert(b.handle, LockMode::ProtectedRead).await.unwrap();

    let history = fx.ns.lock_snapshot(b.handle).unwrap().history;
    assert_eq!(
        history,
        vec![
            LockState::New,
            LockState::Enqueued,
            LockState::Waiting,
            LockState::Granted,
            LockState::Converting,
            LockState::Granted,
        ]
    );
}

#[tokio::test]
async fn test_upgrade_waits_for_other_holder() {
    let fx = Fixture::server();
    let a = fx.ns.enqueue(request(LockMode::ProtectedRead, "a")).await.unwrap();
    let b = fx.ns.enqueue(request(LockMode::ProtectedRead, "b")).await.unwrap();

    let status = fx.ns.convert(a.handle, LockMode::ProtectedWrite).await.unwrap();
    assert_eq!(status, ConvertStatus::Pending);
    let a_lock = fx.ns.lookup(a.handle).unwrap();
    assert_eq!(a_lock.granted_mode(), Some(LockMode::ProtectedRead));
    assert_eq!(a_lock.requested_mode(), LockMode::ProtectedWrite);

    fx.settle().await;
    assert_eq!(fx.sink.count(b.handle, CallbackKind::Blocking).await, 1);

    fx.ns.cancel(b.handle).await.unwrap();
    fx.settle().await;
    assert_eq!(a_lock.state(), LockState::Granted);
    assert_eq!(a_lock.granted_mode(), Some(LockMode::ProtectedWrite));
    let to_a = fx.sink.for_owner("a").await;
    assert_eq!(to_a.len(), 1);
    assert_eq!(to_a[0].kind, CallbackKind::Completion);
    assert_eq!(to_a[0].mode, LockMode::ProtectedWrite);
}

#[tokio::test]
async fn test_downgrade_releases_waiters() {
    let fx = Fixture::server();
    let a = fx.ns.enqueue(request(LockMode::Exclusive, "a")).await.unwrap();
    let b = fx.ns.enqueue(request(LockMode::ProtectedRead, "b")).await.unwrap();
    assert_eq!(b.state, LockState::Waiting);

    let status = fx.ns.convert(a.handle, LockMode::ProtectedRead).await.unwrap();
    assert_eq!(status, ConvertStatus::Granted);
    assert_eq!(fx.ns.lookup(b.handle).unwrap().state(), LockState::Granted);

    let snapshot = fx.ns.resource_snapshot(R1).await.unwrap();
    assert_eq!(
        snapshot.granted,
        vec![
            (a.handle.cookie(), LockMode::ProtectedRead),
            (b.handle.cookie(), LockMode::ProtectedRead),
        ]
    );
    assert!(snapshot.converting.is_empty());
    assert!(snapshot.waiting.is_empty());
}

#[tokio::test]
async fn test_convert_to_held_mode() {
    let fx = Fixture::server();
    let a = fx.ns.enqueue(request(LockMode::ConcurrentWrite, "a")).await.unwrap();

    let status = fx.ns.convert(a.handle, LockMode::ConcurrentWrite).await.unwrap();
    assert_eq!(status, ConvertStatus::Granted);
    assert_eq!(fx.ns.lookup(a.handle).unwrap().state(), LockState::Granted);
}

#[tokio::test]
async fn test_blocking_sent_once_per_grant() {
    let fx = Fixture::server();
    let a = fx.ns.enqueue(request(LockMode::Exclusive, "a")).await.unwrap();
    for owner in ["b", "c", "d"] {
        fx.ns.enqueue(request(LockMode::Exclusive, owner)).await.unwrap();
    }
    fx.settle().await;

    assert_eq!(fx.sink.count(a.handle, CallbackKind::Blocking).await, 1);
    assert!(fx.ns.lock_snapshot(a.handle).unwrap().blocking_sent);
}

#[tokio::test]
async fn test_canceled_waiter_gets_no_completion() {
    let fx = Fixture::server();
    let a = fx.ns.enqueue(request(LockMode::Exclusive, "a")).await.unwrap();
    let b = fx.ns.enqueue(request(LockMode::Exclusive, "b")).await.unwrap();

    fx.ns.cancel(b.handle).await.unwrap();
    fx.ns.cancel(a.handle).await.unwrap();
    fx.settle().await;

    assert!(fx.sink.for_owner("b").await.is_empty());
    assert_eq!(fx.ns.resource_count(), 0);
}

#[tokio::test]
async fn test_duplicate_enqueue_returns_original_handle() {
    let fx = Fixture::server();
    let first = fx
        .ns
        .enqueue(request(LockMode::ProtectedWrite, "a").with_client_seq(17))
        .await
        .unwrap();
    let again = fx
        .ns
        .enqueue(request(LockMode::ProtectedWrite, "a").with_client_seq(17))
        .await
        .unwrap();
    let other_owner = fx
        .ns
        .enqueue(request(LockMode::ProtectedWrite, "b").with_client_seq(17))
        .await
        .unwrap();

    assert_eq!(first.handle, again.handle);
    assert_eq!(again.state, LockState::Granted);
    assert_eq!(other_owner.state, LockState::Waiting);
    assert_eq!(fx.ns.resource_snapshot(R1).await.unwrap().granted.len(), 1);
}

#[tokio::test]
async fn test_glimpse_reaches_write_holders_only() {
    let fx = Fixture::server();
    let writer = fx
        .ns
        .enqueue(request(LockMode::ProtectedWrite, "writer").with_policy(LockPolicy::extent(0, 4095)))
        .await
        .unwrap();
    fx.ns
        .enqueue(request(LockMode::ProtectedRead, "reader").with_policy(LockPolicy::extent(8192, 16383)))
        .await
        .unwrap();

    let queued = fx.ns.glimpse(R1, &OwnerId::new("stat")).await.unwrap();
    assert_eq!(queued, 1);
    fx.settle().await;

    let to_writer = fx.sink.for_owner("writer").await;
    assert_eq!(to_writer.len(), 1);
    assert_eq!(to_writer[0].kind, CallbackKind::Glimpse);
    assert_eq!(to_writer[0].handle, writer.handle);
    assert_eq!(
        to_writer[0].conflicting.as_ref().map(|c| c.owner.clone()),
        Some(OwnerId::new("stat"))
    );
    assert!(fx.sink.for_owner("reader").await.is_empty());

    assert_eq!(
        fx.ns.glimpse(ResourceKey::new(1, 1), &OwnerId::new("stat")).await.unwrap(),
        0
    );
    assert_eq!(fx.ns.resource_count(), 1);
}

#[tokio::test]
async fn test_inode_bits_conflict_only_on_shared_bits() {
    let fx = Fixture::server();
    let lookup = fx
        .ns
        .enqueue(request(LockMode::Exclusive, "a").with_policy(LockPolicy::inode_bits(0b001)))
        .await
        .unwrap();
    let layout = fx
        .ns
        .enqueue(request(LockMode::Exclusive, "b").with_policy(LockPolicy::inode_bits(0b100)))
        .await
        .unwrap();
    let both = fx
        .ns
        .enqueue(request(LockMode::ProtectedRead, "c").with_policy(LockPolicy::inode_bits(0b101)))
        .await
        .unwrap();

    assert_eq!(lookup.state, LockState::Granted);
    assert_eq!(layout.state, LockState::Granted);
    assert_eq!(both.state, LockState::Waiting);
}
