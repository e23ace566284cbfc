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

//! In-process cluster for tests and demos.
//!
//! One server namespace and any number of clients, each with its own
//! client-role namespace mirroring the locks the server granted it.
//! Requests and notifications cross the "network" as encoded bytes through
//! the same [`RequestHandler`] and [`CallbackSink`] seams a real transport
//! would use. Clients can be partitioned to simulate unreachable peers.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;

use crate::ctl::AdminHandler;
use crate::dlm::protocol::{decode_notification, encode_notification};
use crate::dlm::{
    CallbackKind, CallbackSink, ConvertStatus, DlmConfig, DlmError, DlmResult, EnqueueRequest,
    ErrorCode, EvictionObserver, LockHandle, LockMode, LockPolicy, LockState, Namespace,
    Notification, OwnerId, Request, RequestHandler, ResourceKey, Response,
};

/// Errors raised by the in-process cluster
#[derive(Error, Debug)]
pub enum TestError {
    /// Local namespace or codec failure
    #[error("Lock manager error: {0}")]
    Dlm(#[from] DlmError),

    /// Server answered with an error response
    #[error("Request rejected ({code:?}): {message}")]
    Rejected {
        /// Error class
        code: ErrorCode,
        /// Server message
        message: String,
    },

    /// Server answered with the wrong kind of response
    #[error("Unexpected response: {0:?}")]
    Unexpected(Response),

    /// No notification arrived in time
    #[error("Timeout waiting for notification")]
    Timeout,

    /// Client inbox closed
    #[error("Client disconnected: {0}")]
    Disconnected(OwnerId),
}

/// Resource a client-side lock is bound to before the server names one.
pub const UNBOUND_KEY: ResourceKey = ResourceKey {
    object_id: 0,
    sub_key: 0,
};

#[derive(Default)]
struct Network {
    inboxes: RwLock<HashMap<OwnerId, mpsc::UnboundedSender<Vec<u8>>>>,
    partitioned: RwLock<HashSet<OwnerId>>,
    delivered: AtomicU64,
}

/// Callback transport that routes encoded notifications to client inboxes.
pub struct LoopbackSink {
    network: Arc<Network>,
}

#[async_trait]
impl CallbackSink for LoopbackSink {
    async fn deliver(&self, owner: &OwnerId, notification: &Notification) -> DlmResult<()> {
        if self.network.partitioned.read().await.contains(owner) {
            return Err(DlmError::Transport(format!("{} is partitioned", owner)));
        }
        let bytes = encode_notification(notification)?;
        let inboxes = self.network.inboxes.read().await;
        let inbox = inboxes
            .get(owner)
            .ok_or_else(|| DlmError::Transport(format!("no route to {}", owner)))?;
        inbox
            .send(bytes)
            .map_err(|_| DlmError::Transport(format!("{} disconnected", owner)))?;
        self.network.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// A server namespace plus its connected clients.
pub struct InProcessCluster {
    server: Arc<Namespace>,
    handler: Arc<RequestHandler>,
    admin: AdminHandler,
    network: Arc<Network>,
}

impl InProcessCluster {
    /// Start a server namespace. `config.role` is forced to server.
    pub fn start(config: DlmConfig, observer: Arc<dyn EvictionObserver>) -> Result<Self, TestError> {
        let network = Arc::new(Network::default());
        let sink = Arc::new(LoopbackSink {
            network: network.clone(),
        });
        let config = DlmConfig {
            role: crate::dlm::NamespaceRole::Server,
            ..config
        };
        let server = Namespace::new(config, sink, observer)?;
        Ok(Self {
            handler: Arc::new(RequestHandler::new(server.clone())),
            admin: AdminHandler::new(server.clone()),
            server,
            network,
        })
    }

    /// Server namespace
    pub fn server(&self) -> &Arc<Namespace> {
        &self.server
    }

    /// Control plane for the server namespace
    pub fn admin(&self) -> &AdminHandler {
        &self.admin
    }

    /// Notifications handed to client inboxes so far
    pub fn delivered(&self) -> u64 {
        self.network.delivered.load(Ordering::Relaxed)
    }

    /// Register a client and give it a local client-role namespace.
    pub async fn connect(&self, owner: &str) -> Result<InProcessClient, TestError> {
        let owner = OwnerId::new(owner);
        let (tx, rx) = mpsc::unbounded_channel();
        self.network.inboxes.write().await.insert(owner.clone(), tx);

        let local = Namespace::new(
            DlmConfig::client(format!("{}-local", owner)).with_sweep_interval(Duration::ZERO),
            Arc::new(NoopSink),
            Arc::new(crate::dlm::LoggingEvictionObserver),
        )?;
        debug!(owner = %owner, "Client connected");
        Ok(InProcessClient {
            owner,
            local,
            handler: self.handler.clone(),
            inbox: Mutex::new(rx),
            next_seq: AtomicU64::new(1),
            mirror: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Make notifications to `owner` fail.
    pub async fn partition(&self, owner: &str) {
        self.network.partitioned.write().await.insert(OwnerId::new(owner));
    }

    /// Undo [`InProcessCluster::partition`].
    pub async fn heal(&self, owner: &str) {
        self.network.partitioned.write().await.remove(&OwnerId::new(owner));
    }

    /// Stop the server namespace.
    pub async fn shutdown(&self) {
        self.server.shutdown().await;
    }
}

/// Client namespaces have no peers to call back.
struct NoopSink;

#[async_trait]
impl CallbackSink for NoopSink {
    async fn deliver(&self, _owner: &OwnerId, _notification: &Notification) -> DlmResult<()> {
        Ok(())
    }
}

/// A lock as the client sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientLock {
    /// Handle in the client's local namespace
    pub local: LockHandle,
    /// Server handle cookie
    pub remote: u64,
    /// State the server reported
    pub state: LockState,
}

/// One connected peer.
pub struct InProcessClient {
    owner: OwnerId,
    local: Arc<Namespace>,
    handler: Arc<RequestHandler>,
    inbox: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    next_seq: AtomicU64,
    /// server cookie -> local handle
    mirror: std::sync::Mutex<HashMap<u64, LockHandle>>,
}

impl InProcessClient {
    /// Owner id the server sees
    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Local client-role namespace
    pub fn local(&self) -> &Arc<Namespace> {
        &self.local
    }

    /// Send a raw request.
    pub async fn send(&self, request: &Request) -> Result<Response, TestError> {
        let bytes = request.encode()?;
        let reply = self.handler.handle(&self.owner, &bytes).await;
        Ok(Response::decode(&reply)?)
    }

    /// Enqueue on the server and mirror the lock locally.
    ///
    /// The local lock is created before the server names the resource and
    /// is rebound once the reply arrives.
    pub async fn enqueue(&self, key: ResourceKey, mode: LockMode) -> Result<ClientLock, TestError> {
        let client_seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let local = self
            .local
            .create_lock(EnqueueRequest::new(UNBOUND_KEY, mode, self.owner.clone()))
            .await?;

        let request = Request::Enqueue {
            key,
            mode,
            policy: LockPolicy::Plain,
            client_seq: Some(client_seq),
        };
        let (remote, state) = match self.send(&request).await? {
            Response::Enqueued { handle, state, .. } => (handle, state),
            other => {
                self.local.cancel(local).await?;
                return Err(rejection(other));
            }
        };

        self.local.rebind(local, key).await?;
        if state == LockState::Granted {
            self.local.enqueue_lock(local).await?;
        }
        self.mirror
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(remote, local);
        Ok(ClientLock {
            local,
            remote,
            state,
        })
    }

    /// Convert on the server; the local mirror follows once granted.
    pub async fn convert(&self, lock: &ClientLock, mode: LockMode) -> Result<ConvertStatus, TestError> {
        match self.send(&Request::Convert { handle: lock.remote, mode }).await? {
            Response::Converted { result } => {
                if result == ConvertStatus::Granted {
                    self.local.convert(lock.local, mode).await?;
                }
                Ok(result)
            }
            other => Err(rejection(other)),
        }
    }

    /// Cancel on the server and locally.
    pub async fn cancel(&self, lock: &ClientLock) -> Result<LockState, TestError> {
        let state = match self.send(&Request::Cancel { handle: lock.remote }).await? {
            Response::Canceled { state } => state,
            other => return Err(rejection(other)),
        };
        self.local.cancel(lock.local).await?;
        self.mirror
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&lock.remote);
        Ok(state)
    }

    /// Wait for the next notification and apply completions to the local mirror.
    pub async fn next_notification(&self, wait: Duration) -> Result<Notification, TestError> {
        let bytes = {
            let mut inbox = self.inbox.lock().await;
            tokio::time::timeout(wait, inbox.recv())
                .await
                .map_err(|_| TestError::Timeout)?
                .ok_or_else(|| TestError::Disconnected(self.owner.clone()))?
        };
        let notification = decode_notification(&bytes)?;

        if notification.kind == CallbackKind::Completion {
            let local = self
                .mirror
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&notification.handle.cookie())
                .copied();
            // A mirror canceled in the meantime has nothing to apply.
            if let Some(lock) = local.and_then(|h| self.local.lookup(h).ok()) {
                match lock.state() {
                    LockState::New => {
                        self.local.enqueue_lock(lock.handle()).await?;
                    }
                    LockState::Granted => {
                        self.local.convert(lock.handle(), notification.mode).await?;
                    }
                    _ => {}
                }
            }
        }
        Ok(notification)
    }
}

fn rejection(response: Response) -> TestError {
    match response {
        Response::Error { code, message } => TestError::Rejected { code, message },
        other => TestError::Unexpected(other),
    }
}
