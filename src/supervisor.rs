//! The tunnel supervisor: owns the live session set and diff-reconciles it
//! against the declarative config.
//!
//! [`TunnelSupervisor`] is the single authority for starting, restarting,
//! and stopping tunnel sessions. [`sync`](TunnelSupervisor::sync) compares
//! the declared tunnels (every open link of every open server group) with
//! the live map using a parameter fingerprint:
//!
//! - declared but not live → start a session;
//! - live with an unchanged fingerprint → leave it alone (cosmetic edits
//!   like names and notes never restart a tunnel);
//! - live with a changed fingerprint → stop the old session, start a new
//!   one;
//! - live but no longer declared → stop and remove.
//!
//! ## Concurrency
//!
//! The live map is behind an `RwLock`; `sync` holds the write lock for the
//! whole reconcile, so concurrent reconciles serialize. Each started
//! session gets a watcher task that waits for its terminal error; the
//! watcher takes the same write lock only after the session has already
//! terminated, so it can never deadlock an in-progress reconcile. A
//! session superseded by a later reconcile is recognized by its stale
//! fingerprint and left for the newer entry.
//!
//! Lifecycle events go to a bounded channel with a single consumer (the
//! host); emission never blocks, overflow is dropped with a warning.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

use crate::session::{self, HostKeyPolicy, RetryPolicy, SessionHandle, TunnelParams};
use crate::store::{Config, Link, ServerGroup};

/// Capacity of the lifecycle event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// One tunnel lifecycle notification for the host.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelEvent {
    pub tunnel_id: String,
    pub link_name: String,
    pub server_name: String,
    /// Empty when the event is purely informational.
    pub error_text: String,
    /// True on a graceful stop.
    pub is_stopped: bool,
}

/// Bookkeeping for one live session.
struct TunnelEntry {
    handle: SessionHandle,
    fingerprint: String,
    link_name: String,
    server_name: String,
}

/// Manages the set of live tunnel sessions.
///
/// Cloneable — all clones share the same live map and event channel.
#[derive(Clone)]
pub struct TunnelSupervisor {
    tunnels: Arc<RwLock<HashMap<String, TunnelEntry>>>,
    event_tx: mpsc::Sender<TunnelEvent>,
    forward_retry: RetryPolicy,
    reverse_retry: RetryPolicy,
}

/// Composite key of one declared tunnel: `<server id>_<link id>`.
pub fn tunnel_id(group: &ServerGroup, link: &Link) -> String {
    format!("{}_{}", group.id, link.id)
}

/// Deterministic digest of the behavior-affecting parameters.
///
/// Equality means "no restart needed"; display names, notes, and ordering
/// deliberately stay out.
fn fingerprint(group: &ServerGroup, link: &Link) -> String {
    format!(
        "{}|{}:{}@{}:{}|{}:{}->{}:{}",
        link.is_penetrate,
        group.username,
        group.password,
        group.server_host,
        group.server_port,
        link.local_host,
        link.local_port,
        link.remote_host,
        link.remote_port,
    )
}

/// Session parameters for one declared tunnel.
///
/// The supervisor opts in to `AcceptAll` host keys: there is no known-hosts
/// store, and the declared servers are the user's own.
fn tunnel_params(group: &ServerGroup, link: &Link) -> TunnelParams {
    let (bind_host, bind_port, target_host, target_port) = if link.is_penetrate {
        (
            link.remote_host.clone(),
            link.remote_port,
            link.local_host.clone(),
            link.local_port,
        )
    } else {
        (
            link.local_host.clone(),
            link.local_port,
            link.remote_host.clone(),
            link.remote_port,
        )
    };
    TunnelParams {
        ssh_host: group.server_host.clone(),
        ssh_port: group.server_port,
        username: group.username.clone(),
        password: group.password.clone(),
        bind_host,
        bind_port,
        target_host,
        target_port,
        host_key_policy: HostKeyPolicy::AcceptAll,
    }
}

impl TunnelSupervisor {
    /// Create a supervisor emitting events on `event_tx`.
    pub fn new(event_tx: mpsc::Sender<TunnelEvent>) -> Self {
        Self::with_retry_policies(event_tx, RetryPolicy::forward(), RetryPolicy::reverse())
    }

    /// Create a supervisor with custom retry schedules.
    pub fn with_retry_policies(
        event_tx: mpsc::Sender<TunnelEvent>,
        forward_retry: RetryPolicy,
        reverse_retry: RetryPolicy,
    ) -> Self {
        Self {
            tunnels: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            forward_retry,
            reverse_retry,
        }
    }

    /// Create the lifecycle event channel with the conventional capacity.
    pub fn event_channel() -> (mpsc::Sender<TunnelEvent>, mpsc::Receiver<TunnelEvent>) {
        mpsc::channel(EVENT_CHANNEL_CAPACITY)
    }

    /// Reconcile the live session set against `config`. Idempotent.
    pub async fn sync(&self, config: &Config) {
        let mut tunnels = self.tunnels.write().await;
        let mut visited: HashSet<String> = HashSet::new();

        for group in &config.servers {
            if !group.is_open {
                continue;
            }
            for link in &group.link_group {
                if !link.is_open {
                    continue;
                }

                let id = tunnel_id(group, link);
                visited.insert(id.clone());
                let new_fingerprint = fingerprint(group, link);

                match tunnels.get(&id) {
                    None => {
                        info!("Tunnel {id}: starting ({})", link.name);
                        self.start_locked(&mut tunnels, id, group, link, new_fingerprint);
                    }
                    Some(entry) if entry.fingerprint == new_fingerprint => {
                        // Unchanged parameters — cosmetic edits land here.
                    }
                    Some(_) => {
                        info!("Tunnel {id}: parameters changed, restarting ({})", link.name);
                        if let Some(old) = tunnels.remove(&id) {
                            old.handle.stop();
                        }
                        self.start_locked(&mut tunnels, id, group, link, new_fingerprint);
                    }
                }
            }
        }

        // Stop everything no longer declared open.
        let stale: Vec<String> = tunnels
            .keys()
            .filter(|id| !visited.contains(*id))
            .cloned()
            .collect();
        for id in stale {
            if let Some(entry) = tunnels.remove(&id) {
                info!("Tunnel {id}: removed from config, stopping");
                entry.handle.stop();
                self.emit(TunnelEvent {
                    tunnel_id: id,
                    link_name: entry.link_name,
                    server_name: entry.server_name,
                    error_text: String::new(),
                    is_stopped: true,
                });
            }
        }
    }

    /// Stop every live session and clear the map.
    pub async fn stop_all(&self) {
        let mut tunnels = self.tunnels.write().await;
        for (id, entry) in tunnels.drain() {
            entry.handle.stop();
            info!("Tunnel {id}: stopped");
            self.emit(TunnelEvent {
                tunnel_id: id,
                link_name: entry.link_name,
                server_name: entry.server_name,
                error_text: String::new(),
                is_stopped: true,
            });
        }
    }

    /// Snapshot of the live tunnel ids.
    pub async fn running_ids(&self) -> Vec<String> {
        self.tunnels.read().await.keys().cloned().collect()
    }

    /// Start a session and its watcher while holding the write lock.
    fn start_locked(
        &self,
        tunnels: &mut HashMap<String, TunnelEntry>,
        id: String,
        group: &ServerGroup,
        link: &Link,
        fingerprint: String,
    ) {
        let params = tunnel_params(group, link);
        let (handle, err_rx) = if link.is_penetrate {
            session::start_reverse(params, self.reverse_retry)
        } else {
            session::start_forward(params, self.forward_retry)
        };

        tunnels.insert(
            id.clone(),
            TunnelEntry {
                handle,
                fingerprint: fingerprint.clone(),
                link_name: link.name.clone(),
                server_name: group.server_name.clone(),
            },
        );

        // Watcher: waits for the session's terminal error. It locks the map
        // only after the session is gone, so it cannot contend with the
        // reconcile that spawned it.
        let tunnels_ref = Arc::clone(&self.tunnels);
        let event_tx = self.event_tx.clone();
        let link_name = link.name.clone();
        let server_name = group.server_name.clone();
        tokio::spawn(async move {
            let Ok(err) = err_rx.await else {
                // Channel closed with no value: clean stop.
                return;
            };
            error!("Tunnel {id}: terminal failure: {err}");
            {
                let mut tunnels = tunnels_ref.write().await;
                // Forget the session only if it has not been superseded by
                // a newer reconcile under the same id.
                if tunnels.get(&id).is_some_and(|e| e.fingerprint == fingerprint) {
                    tunnels.remove(&id);
                }
            }
            let event = TunnelEvent {
                tunnel_id: id,
                link_name,
                server_name,
                error_text: err.to_string(),
                is_stopped: false,
            };
            if let Err(e) = event_tx.try_send(event) {
                warn!("Dropping tunnel event: {e}");
            }
        });
    }

    /// Non-blocking event emission; overflow is dropped with a warning.
    fn emit(&self, event: TunnelEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("Dropping tunnel event: {e}");
        }
    }
}
