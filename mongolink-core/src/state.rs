// Copyright 2026 Mongolink Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Connection state machine.
//!
//! ```text
//!                 connect()              health check fails
//! Disconnected ──────────────▶ Connected ──────────────────▶ Reconnecting
//!      ▲                          ▲                               │
//!      │ disconnect()             └───────── supervisor ──────────┘
//!      └──────────────────────── (from any state)
//! ```
//!
//! Status, the installed client and the supervisor's running flag live
//! under one [`RwLock`], so readers always see a consistent triple. The
//! lock is never held across a network call.

use crate::driver::{Connection, Driver, DriverError};
use crate::event::Namespace;
use crate::link::LinkError;
use crate::metrics::{self, LinkStatus};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// NetworkTimeout server code, reused for pings that exceed their deadline.
const NETWORK_TIMEOUT: i32 = 89;

/// Lifecycle status of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// No client is installed.
    Disconnected,
    /// A verified client is installed.
    Connected,
    /// The supervisor is replacing the client.
    Reconnecting,
}

impl ConnectionStatus {
    /// Returns the status as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ConnectionStatus> for LinkStatus {
    fn from(status: ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Disconnected => Self::Disconnected,
            ConnectionStatus::Connected => Self::Connected,
            ConnectionStatus::Reconnecting => Self::Reconnecting,
        }
    }
}

/// Fields guarded by the state lock.
#[derive(Debug)]
pub(crate) struct LinkState {
    status: ConnectionStatus,
    pub(crate) client: Option<Arc<dyn Connection>>,
    pub(crate) supervisor_running: bool,
    /// Bumped by every teardown. A retry loop armed under an older epoch
    /// must not touch the state again.
    pub(crate) epoch: u64,
    /// Namespaces whose logical id index was ensured on the current client.
    pub(crate) indexed: HashSet<Namespace>,
}

impl LinkState {
    pub(crate) fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            debug!(from = %self.status, to = %status, "Link status changed");
            self.status = status;
            metrics::set_link_status(status.into());
        }
    }

    /// Installs a verified client and marks the link Connected.
    ///
    /// Returns the client it replaced, which the caller must close.
    pub(crate) fn install(&mut self, client: Arc<dyn Connection>) -> Option<Arc<dyn Connection>> {
        self.indexed.clear();
        self.set_status(ConnectionStatus::Connected);
        self.client.replace(client)
    }
}

/// Owns the current client and the link's status.
pub struct ConnectionState {
    driver: Arc<dyn Driver>,
    uri: String,
    server_selection_timeout: Duration,
    health_check_timeout: Duration,
    inner: RwLock<LinkState>,
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionState")
            .field("driver", &self.driver)
            .field("uri", &self.uri)
            .field("server_selection_timeout", &self.server_selection_timeout)
            .field("health_check_timeout", &self.health_check_timeout)
            .finish_non_exhaustive()
    }
}

impl ConnectionState {
    pub(crate) fn new(
        driver: Arc<dyn Driver>,
        uri: impl Into<String>,
        server_selection_timeout: Duration,
        health_check_timeout: Duration,
    ) -> Self {
        Self {
            driver,
            uri: uri.into(),
            server_selection_timeout,
            health_check_timeout,
            inner: RwLock::new(LinkState {
                status: ConnectionStatus::Disconnected,
                client: None,
                supervisor_running: false,
                epoch: 0,
                indexed: HashSet::new(),
            }),
        }
    }

    /// Target URI.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Opens a new client with the configured server selection timeout.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Dial`] if the driver could not create a client.
    pub async fn dial(&self) -> Result<Arc<dyn Connection>, LinkError> {
        self.driver
            .dial(&self.uri, self.server_selection_timeout)
            .await
            .map_err(|source| LinkError::Dial {
                uri: self.uri.clone(),
                source,
            })
    }

    /// Pings `client`, giving up after the health check timeout.
    pub(crate) async fn ping(&self, client: &dyn Connection) -> Result<(), DriverError> {
        match tokio::time::timeout(self.health_check_timeout, client.ping()).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::new(format!(
                "ping timed out after {}ms",
                self.health_check_timeout.as_millis()
            ))
            .with_code(NETWORK_TIMEOUT)),
        }
    }

    /// Returns true if `client` answered a ping in time.
    pub async fn health_check(&self, client: &dyn Connection) -> bool {
        self.ping(client).await.is_ok()
    }

    /// Dials and pings a fresh client, closing it again if the ping fails.
    pub(crate) async fn dial_verified(&self) -> Result<Arc<dyn Connection>, LinkError> {
        let client = self.dial().await?;
        if let Err(source) = self.ping(client.as_ref()).await {
            if let Err(e) = client.close().await {
                debug!(error = %e, "Failed to close unverified client");
            }
            return Err(LinkError::HealthCheck { source });
        }
        Ok(client)
    }

    /// Returns true if the link is Connected and its client answers a ping.
    ///
    /// A link in the Reconnecting state is never healthy, whatever the
    /// installed client would answer.
    pub async fn is_healthy(&self) -> bool {
        let client = {
            let guard = self.inner.read().await;
            if guard.status == ConnectionStatus::Reconnecting {
                return false;
            }
            match guard.client.as_ref() {
                Some(client) => Arc::clone(client),
                None => return false,
            }
        };
        self.health_check(client.as_ref()).await
    }

    /// Current status.
    pub async fn status(&self) -> ConnectionStatus {
        self.inner.read().await.status
    }

    /// Returns the installed client if the link is Connected.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Reconnecting`] while the supervisor is at work and
    /// [`LinkError::NotConnected`] otherwise.
    pub async fn current_client(&self) -> Result<Arc<dyn Connection>, LinkError> {
        let guard = self.inner.read().await;
        match (guard.status, guard.client.as_ref()) {
            (ConnectionStatus::Connected, Some(client)) => Ok(Arc::clone(client)),
            (ConnectionStatus::Reconnecting, _) => Err(LinkError::Reconnecting),
            _ => Err(LinkError::NotConnected),
        }
    }

    pub(crate) async fn read(&self) -> RwLockReadGuard<'_, LinkState> {
        self.inner.read().await
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, LinkState> {
        self.inner.write().await
    }

    /// Forces Disconnected and hands back the client to close.
    ///
    /// Any armed retry loop is disowned in the same critical section: the
    /// running flag drops and the epoch moves on, so the loop exits without
    /// installing a client.
    pub(crate) async fn teardown(&self) -> Option<Arc<dyn Connection>> {
        let mut guard = self.inner.write().await;
        guard.set_status(ConnectionStatus::Disconnected);
        guard.supervisor_running = false;
        guard.epoch += 1;
        guard.indexed.clear();
        let client = guard.client.take();
        if client.is_some() {
            info!(uri = %self.uri, "Link disconnected");
        }
        client
    }
}
