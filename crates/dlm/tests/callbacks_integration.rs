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

//! Callback delivery and liveness integration tests.
//!
//! These tests verify:
//! - Delivery failures reach the eviction observer, not the caller
//! - Evicted owners receive nothing and their locks are released
//! - Blocking callbacks that are not honored are reported once
//! - Shutdown cancels everything without callbacks

mod common;

use clusterlock_dlm::{
    CallbackKind, DlmConfig, DlmError, EnqueueRequest, LockMode, LockState, OwnerId, ResourceKey,
    UnresponsiveReason,
};
use common::Fixture;
use std::time::Duration;

const R1: ResourceKey = ResourceKey {
    object_id: 42,
    sub_key: 7,
};

#[tokio::test]
async fn test_delivery_failure_goes_to_observer() {
    let fx = Fixture::server();
    fx.sink.make_unreachable("dead").await;
    let held = fx
        .ns
        .enqueue(EnqueueRequest::new(R1, LockMode::Exclusive, "dead"))
        .await
        .unwrap();

    let reply = fx
        .ns
        .enqueue(EnqueueRequest::new(R1, LockMode::Exclusive, "live"))
        .await
        .unwrap();
    assert_eq!(reply.state, LockState::Waiting);
    fx.settle().await;

    let reports = fx.observer.reports().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, OwnerId::new("dead"));
    assert!(matches!(
        &reports[0].1,
        UnresponsiveReason::CallbackDeliveryFailed { handle, .. } if *handle == held.handle
    ));
}

#[tokio::test]
async fn test_evicted_owner_gets_no_callbacks() {
    let fx = Fixture::server();
    let dead = fx
        .ns
        .enqueue(EnqueueRequest::new(R1, LockMode::ProtectedWrite, "dead"))
        .await
        .unwrap();
    let waiter = fx
        .ns
        .enqueue(EnqueueRequest::new(R1, LockMode::ProtectedWrite, "live"))
        .await
        .unwrap();
    fx.settle().await;
    fx.sink.clear().await;

    assert_eq!(fx.ns.evict_owner(&OwnerId::new("dead")).await, 1);
    fx.settle().await;

    assert!(fx.sink.for_owner("dead").await.is_empty());
    assert_eq!(fx.sink.count(waiter.handle, CallbackKind::Completion).await, 1);
    assert!(matches!(
        fx.ns.lookup(dead.handle),
        Err(DlmError::InvalidHandle(_))
    ));
    assert_eq!(fx.ns.lookup(waiter.handle).unwrap().state(), LockState::Granted);
}

#[tokio::test]
async fn test_evicting_waiting_owner_skips_blocking_resend() {
    let fx = Fixture::server();
    let holder = fx
        .ns
        .enqueue(EnqueueRequest::new(R1, LockMode::Exclusive, "holder"))
        .await
        .unwrap();
    fx.ns
        .enqueue(EnqueueRequest::new(R1, LockMode::Exclusive, "dead"))
        .await
        .unwrap();

    fx.ns.evict_owner(&OwnerId::new("dead")).await;
    fx.settle().await;

    assert_eq!(fx.sink.count(holder.handle, CallbackKind::Blocking).await, 1);
    assert!(fx.ns.resource_snapshot(R1).await.unwrap().waiting.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_blocking_timeout_reported_once() {
    let fx = Fixture::with_config(
        DlmConfig::server("timeouts")
            .with_blocking_timeout(Duration::from_secs(5))
            .with_sweep_interval(Duration::ZERO),
    );
    let holder = fx
        .ns
        .enqueue(EnqueueRequest::new(R1, LockMode::Exclusive, "slow"))
        .await
        .unwrap();
    fx.ns
        .enqueue(EnqueueRequest::new(R1, LockMode::Exclusive, "eager"))
        .await
        .unwrap();

    assert_eq!(fx.ns.check_callback_timeouts().await, 0);
    tokio::time::advance(Duration::from_secs(6)).await;
    assert_eq!(fx.ns.check_callback_timeouts().await, 1);
    assert_eq!(fx.ns.check_callback_timeouts().await, 0);

    let reports = fx.observer.reports().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, OwnerId::new("slow"));
    assert!(matches!(
        &reports[0].1,
        UnresponsiveReason::BlockingTimeout { handle, waited_ms } if *handle == holder.handle && *waited_ms >= 5_000
    ));
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_reports_ignored_blocking_callback() {
    let fx = Fixture::with_config(
        DlmConfig::server("sweeper")
            .with_blocking_timeout(Duration::from_secs(2))
            .with_sweep_interval(Duration::from_millis(500)),
    );
    fx.ns
        .enqueue(EnqueueRequest::new(R1, LockMode::ProtectedWrite, "slow"))
        .await
        .unwrap();
    fx.ns
        .enqueue(EnqueueRequest::new(R1, LockMode::ProtectedRead, "eager"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(4)).await;

    let reports = fx.observer.reports().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, OwnerId::new("slow"));
}

#[tokio::test(start_paused = true)]
async fn test_honored_blocking_callback_not_reported() {
    let fx = Fixture::with_config(
        DlmConfig::server("honored")
            .with_blocking_timeout(Duration::from_secs(5))
            .with_sweep_interval(Duration::ZERO),
    );
    let holder = fx
        .ns
        .enqueue(EnqueueRequest::new(R1, LockMode::Exclusive, "cooperative"))
        .await
        .unwrap();
    fx.ns
        .enqueue(EnqueueRequest::new(R1, LockMode::ProtectedRead, "reader"))
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(1)).await;
    fx.ns.convert(holder.handle, LockMode::ProtectedRead).await.unwrap();
    tokio::time::advance(Duration::from_secs(10)).await;

    assert_eq!(fx.ns.check_callback_timeouts().await, 0);
    assert!(fx.observer.reports().await.is_empty());
}

#[tokio::test]
async fn test_shutdown_cancels_without_callbacks() {
    let fx = Fixture::server();
    fx.ns
        .enqueue(EnqueueRequest::new(R1, LockMode::Exclusive, "a"))
        .await
        .unwrap();
    let waiter = fx
        .ns
        .enqueue(EnqueueRequest::new(R1, LockMode::Exclusive, "b"))
        .await
        .unwrap();
    fx.settle().await;
    fx.sink.clear().await;

    fx.ns.shutdown().await;

    assert!(fx.sink.all().await.is_empty());
    assert_eq!(fx.ns.lock_count(), 0);
    assert_eq!(fx.ns.resource_count(), 0);
    assert!(matches!(
        fx.ns.convert(waiter.handle, LockMode::Null).await,
        Err(DlmError::ResourceShuttingDown(_))
    ));
    assert!(matches!(
        fx.ns.glimpse(R1, &OwnerId::new("a")).await,
        Err(DlmError::ResourceShuttingDown(_))
    ));
}
