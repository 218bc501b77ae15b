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

//! Background reconnect supervisor.
//!
//! When a link loses its server, [`ReconnectSupervisor::trigger`] moves it to
//! Reconnecting and spawns one retry loop. The loop closes the old client,
//! then dials and pings with a fixed backoff between attempts until a client
//! answers. The verified client is installed, the link goes back to
//! Connected and the reconnected hook is spawned as its own task.
//!
//! At most one loop is armed per link. The running flag sits under the same
//! lock as the status, so concurrent triggers cannot both arm a loop.
//!
//! Each loop owns a child of the link's shutdown token. Stopping the
//! supervisor cancels that child and waits for the loop to exit; a client
//! dialed after cancellation is closed rather than installed, and the link
//! is left Disconnected. A loop also remembers the teardown epoch it was
//! armed under and gives up as soon as a disconnect moves the epoch on.

use crate::metrics;
use crate::state::{ConnectionState, ConnectionStatus};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback invoked after every successful reconnect.
pub type ReconnectedHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct ArmedLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Re-establishes a lost connection in the background.
pub struct ReconnectSupervisor {
    state: Arc<ConnectionState>,
    backoff: Duration,
    on_reconnected: Option<ReconnectedHook>,
    shutdown: CancellationToken,
    armed: Mutex<Option<ArmedLoop>>,
}

impl fmt::Debug for ReconnectSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectSupervisor")
            .field("backoff", &self.backoff)
            .field("has_hook", &self.on_reconnected.is_some())
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

fn lock(armed: &Mutex<Option<ArmedLoop>>) -> MutexGuard<'_, Option<ArmedLoop>> {
    armed.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl ReconnectSupervisor {
    pub(crate) fn new(
        state: Arc<ConnectionState>,
        backoff: Duration,
        on_reconnected: Option<ReconnectedHook>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            state,
            backoff,
            on_reconnected,
            shutdown,
            armed: Mutex::new(None),
        }
    }

    /// Moves a connected link to Reconnecting and arms the retry loop.
    ///
    /// Returns true if this call armed a loop. Triggers while a loop is
    /// already running, on a link that was never connected, or after
    /// shutdown do nothing.
    pub async fn trigger(&self) -> bool {
        if self.shutdown.is_cancelled() {
            debug!("Ignoring reconnect trigger after shutdown");
            return false;
        }

        let mut guard = self.state.write().await;

        if guard.status() == ConnectionStatus::Disconnected {
            warn!(uri = %self.state.uri(), "Ignoring reconnect trigger on a link that is not connected");
            return false;
        }

        if guard.supervisor_running {
            debug!("Reconnect already in progress");
            return false;
        }

        guard.set_status(ConnectionStatus::Reconnecting);
        guard.supervisor_running = true;

        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(reconnect_loop(
            Arc::clone(&self.state),
            self.backoff,
            self.on_reconnected.clone(),
            guard.epoch,
            cancel.clone(),
        ));
        *lock(&self.armed) = Some(ArmedLoop { cancel, handle });
        drop(guard);

        info!(uri = %self.state.uri(), "Link lost, reconnecting in background");
        true
    }

    /// Returns true while a retry loop is armed.
    pub async fn is_running(&self) -> bool {
        self.state.read().await.supervisor_running
    }

    /// Cancels the armed loop, if any, and waits for it to exit.
    pub async fn stop(&self) {
        let armed = lock(&self.armed).take();
        if let Some(ArmedLoop { cancel, handle }) = armed {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Reconnect loop ended abnormally");
            }
        }
    }
}

async fn reconnect_loop(
    state: Arc<ConnectionState>,
    backoff: Duration,
    on_reconnected: Option<ReconnectedHook>,
    epoch: u64,
    cancel: CancellationToken,
) {
    let previous = {
        let mut guard = state.write().await;
        if guard.epoch != epoch {
            return;
        }
        guard.client.take()
    };
    if let Some(previous) = previous {
        // A dead client usually cannot close cleanly.
        if let Err(e) = previous.close().await {
            debug!(error = %e, "Failed to close previous client");
        }
    }

    let backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX);
    let mut attempt: u64 = 0;

    loop {
        if state.read().await.epoch != epoch {
            debug!(attempt, "Link torn down, abandoning reconnect");
            return;
        }

        attempt += 1;
        metrics::increment_reconnect_attempts();
        debug!(attempt, "Attempting to reconnect");

        let outcome = tokio::select! {
            () = cancel.cancelled() => None,
            result = state.dial_verified() => Some(result),
        };

        match outcome {
            None => break,
            Some(Ok(client)) => {
                let mut guard = state.write().await;
                if guard.epoch != epoch {
                    drop(guard);
                    if let Err(e) = client.close().await {
                        debug!(error = %e, "Failed to close client dialed after teardown");
                    }
                    return;
                }
                if cancel.is_cancelled() {
                    drop(guard);
                    if let Err(e) = client.close().await {
                        debug!(error = %e, "Failed to close client dialed after cancellation");
                    }
                    break;
                }

                let replaced = guard.install(client);
                guard.supervisor_running = false;
                drop(guard);

                if let Some(replaced) = replaced {
                    if let Err(e) = replaced.close().await {
                        debug!(error = %e, "Failed to close replaced client");
                    }
                }

                metrics::increment_reconnects();
                info!(attempt, uri = %state.uri(), "Reconnected");

                // Runs detached: a hook that fails or panics only ends its own task.
                if let Some(hook) = on_reconnected {
                    tokio::spawn(hook());
                }
                return;
            }
            Some(Err(e)) => {
                warn!(attempt, backoff_ms, error = %e, "Reconnect attempt failed");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }

    // The loop already took the client; a cancelled recovery leaves the
    // link Disconnected.
    let mut guard = state.write().await;
    if guard.epoch == epoch {
        guard.supervisor_running = false;
        if guard.status() == ConnectionStatus::Reconnecting && guard.client.is_none() {
            guard.set_status(ConnectionStatus::Disconnected);
            guard.indexed.clear();
        }
    }
    drop(guard);
    debug!(attempt, "Reconnect loop cancelled");
}
