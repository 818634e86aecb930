//! One tunnel session: dial, authenticate, listen, relay, retry.
//!
//! [`start_forward`] and [`start_reverse`] spawn a supervised loop that
//! keeps one SSH connection alive for a single declared tunnel. Each
//! attempt dials the server (directly or through a SOCKS5 proxy), performs
//! password auth, binds the listener for its direction, and relays accepted
//! connections until the user stops it or the transport dies.
//!
//! Failed attempts are retried with a fixed delay up to a bounded count;
//! a session that stayed healthy for [`RetryPolicy::stable_uptime`] earns a
//! fresh retry budget before the next failure is counted. Only the terminal
//! [`SessionError::RetriesExhausted`] crosses the session boundary, on the
//! oneshot returned by the entry point. A clean stop closes that channel
//! with no value.
//!
//! Keepalive rides on russh: the client config emits
//! `keepalive@openssh.com` (want-reply) every 30 s and tears the transport
//! down after 3 unanswered probes. Transport death is observed through a
//! monitor channel and surfaces as [`SessionError::Keepalive`].

mod forward;
mod reverse;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, AuthResult, Msg};
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dial::Dialer;

/// SSH handshake + auth deadline per attempt.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Interval of the `keepalive@openssh.com` probe.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Unanswered probes tolerated before the transport is declared dead.
const KEEPALIVE_MAX: usize = 3;

/// What to do with an unrecognized server host key.
///
/// There is no known-hosts store, so `AcceptAll` is the only policy that
/// lets a session come up — callers must opt in to it explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Trust any server key presented.
    AcceptAll,
    /// Refuse the handshake.
    #[default]
    RejectUnknown,
}

/// Everything one session needs to run, independent of direction.
///
/// For a forward tunnel `bind` is the local listen address and `target` the
/// remote destination; for a reverse tunnel `bind` is the remote listen
/// address and `target` the local destination.
#[derive(Debug, Clone)]
pub struct TunnelParams {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub username: String,
    pub password: String,
    pub bind_host: String,
    pub bind_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub host_key_policy: HostKeyPolicy,
}

impl TunnelParams {
    pub(crate) fn ssh_addr(&self) -> String {
        format!("{}:{}", self.ssh_host, self.ssh_port)
    }

    pub(crate) fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.bind_port)
    }

    pub(crate) fn target_addr(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }
}

/// Bounded-retry schedule for the session outer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before giving up.
    pub max_retries: u32,
    /// Fixed wait between attempts.
    pub retry_delay: Duration,
    /// An attempt that lived at least this long resets the failure count.
    pub stable_uptime: Duration,
}

impl RetryPolicy {
    /// Schedule for forward tunnels: 5 attempts, 3 s apart.
    pub fn forward() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_secs(3),
            stable_uptime: Duration::from_secs(60),
        }
    }

    /// Schedule for reverse tunnels: 5 attempts, 5 s apart.
    pub fn reverse() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_secs(5),
            stable_uptime: Duration::from_secs(60),
        }
    }
}

/// Session failure kinds.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("tcp dial to {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("ssh handshake with {addr} failed: {reason}")]
    Handshake { addr: String, reason: String },
    #[error("local bind on {addr} failed: {source}")]
    LocalBind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("remote bind on {addr} refused: {reason}")]
    RemoteBind { addr: String, reason: String },
    #[error("ssh keepalive lost: {0}")]
    Keepalive(String),
    #[error("listener accept failed: {0}")]
    Accept(String),
    #[error("tunnel gave up after {attempts} failed attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<SessionError>,
    },
}

/// Idempotent cancellation handle for one session.
///
/// Cloning shares the same underlying token; calling [`stop`](Self::stop)
/// any number of times signals the session exactly once.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    stop: CancellationToken,
}

impl SessionHandle {
    /// Signal the session to unwind. Safe to call repeatedly.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Whether stop has been signalled.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

/// Tunnel direction, used only to dispatch the per-attempt runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Start a forward tunnel: listen on `bind`, relay accepted connections
/// through the SSH server to `target`.
///
/// Returns the stop handle and a receiver that yields at most one terminal
/// error; a user-initiated stop closes it without a value. Must be called
/// within a tokio runtime.
pub fn start_forward(
    params: TunnelParams,
    retry: RetryPolicy,
) -> (SessionHandle, oneshot::Receiver<SessionError>) {
    start(Direction::Forward, params, retry)
}

/// Start a reverse tunnel: have the SSH server listen on `bind` and relay
/// its connections back to the local `target`.
///
/// Same contract as [`start_forward`].
pub fn start_reverse(
    params: TunnelParams,
    retry: RetryPolicy,
) -> (SessionHandle, oneshot::Receiver<SessionError>) {
    start(Direction::Reverse, params, retry)
}

fn start(
    direction: Direction,
    params: TunnelParams,
    retry: RetryPolicy,
) -> (SessionHandle, oneshot::Receiver<SessionError>) {
    let stop = CancellationToken::new();
    let (err_tx, err_rx) = oneshot::channel();
    tokio::spawn(run_supervised(direction, params, retry, stop.clone(), err_tx));
    (SessionHandle { stop }, err_rx)
}

/// The outer loop: run attempts until stopped or the retry budget is spent.
async fn run_supervised(
    direction: Direction,
    params: TunnelParams,
    retry: RetryPolicy,
    stop: CancellationToken,
    err_tx: oneshot::Sender<SessionError>,
) {
    let tunnel = params.bind_addr();
    let mut failures: u32 = 0;

    loop {
        if stop.is_cancelled() {
            info!("Tunnel {tunnel}: stopped by user");
            return;
        }

        // The dialer is resolved per attempt so proxy env changes apply on
        // the next reconnect.
        let dialer = Dialer::from_env();
        info!(
            "Tunnel {tunnel}: connecting via {} (attempt {}/{})",
            dialer.mode(),
            failures + 1,
            retry.max_retries
        );

        let started = Instant::now();
        let result = match direction {
            Direction::Forward => forward::run_attempt(&params, &dialer, &stop).await,
            Direction::Reverse => reverse::run_attempt(&params, &dialer, &stop).await,
        };

        let err = match result {
            Ok(()) => {
                info!("Tunnel {tunnel}: stopped by user");
                return;
            }
            Err(err) => err,
        };

        if started.elapsed() >= retry.stable_uptime {
            // A long healthy run earns a fresh retry budget.
            failures = 0;
        }
        failures += 1;
        warn!("Tunnel {tunnel}: session ended: {err} (failure {failures}/{})", retry.max_retries);

        if failures >= retry.max_retries {
            let terminal = SessionError::RetriesExhausted {
                attempts: failures,
                last: Box::new(err),
            };
            error!("Tunnel {tunnel}: {terminal}");
            let _ = err_tx.send(terminal);
            return;
        }

        tokio::select! {
            () = tokio::time::sleep(retry.retry_delay) => {}
            () = stop.cancelled() => {
                info!("Tunnel {tunnel}: stopped by user");
                return;
            }
        }
    }
}

/// russh client handler shared by both directions.
///
/// Forward sessions only answer the host-key check; reverse sessions also
/// receive the server's forwarded connections and bridge each one to the
/// local target.
pub(crate) struct ClientHandler {
    host_key_policy: HostKeyPolicy,
    reverse: Option<ReverseTarget>,
}

/// Where a reverse session delivers forwarded connections.
pub(crate) struct ReverseTarget {
    pub local_addr: String,
    pub conn_cancel: CancellationToken,
}

impl ClientHandler {
    pub(crate) fn new(host_key_policy: HostKeyPolicy) -> Self {
        Self {
            host_key_policy,
            reverse: None,
        }
    }

    pub(crate) fn with_reverse_target(
        host_key_policy: HostKeyPolicy,
        local_addr: String,
        conn_cancel: CancellationToken,
    ) -> Self {
        Self {
            host_key_policy,
            reverse: Some(ReverseTarget {
                local_addr,
                conn_cancel,
            }),
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self.host_key_policy {
            HostKeyPolicy::AcceptAll => Ok(true),
            HostKeyPolicy::RejectUnknown => {
                warn!("Rejecting unverified server host key");
                Ok(false)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let Some(target) = &self.reverse else {
            warn!(
                "Dropping unexpected forwarded connection for {connected_address}:{connected_port}"
            );
            return Ok(());
        };
        debug!("Forwarded connection from {originator_address}:{originator_port}");
        let local_addr = target.local_addr.clone();
        let cancel = target.conn_cancel.child_token();
        tokio::spawn(async move {
            match TcpStream::connect(&local_addr).await {
                Ok(local) => relay_streams(channel.into_stream(), local, cancel).await,
                Err(e) => {
                    // Dropping the channel closes the remote side.
                    warn!("Failed to reach local target {local_addr}: {e}");
                }
            }
        });
        Ok(())
    }
}

/// Dial, handshake, and authenticate one SSH connection.
///
/// The whole sequence runs under [`HANDSHAKE_TIMEOUT`]; auth rejection is
/// reported as a handshake failure, like the transport-level errors it
/// travels with.
pub(crate) async fn connect_ssh(
    params: &TunnelParams,
    dialer: &Dialer,
    handler: ClientHandler,
) -> Result<client::Handle<ClientHandler>, SessionError> {
    let ssh_addr = params.ssh_addr();
    let stream = dialer
        .connect(&ssh_addr)
        .await
        .map_err(|source| SessionError::Dial {
            addr: ssh_addr.clone(),
            source,
        })?;

    let config = Arc::new(client::Config {
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        keepalive_max: KEEPALIVE_MAX,
        inactivity_timeout: None,
        ..client::Config::default()
    });

    let handshake = async {
        let mut handle = client::connect_stream(config, stream, handler)
            .await
            .map_err(|e| SessionError::Handshake {
                addr: ssh_addr.clone(),
                reason: e.to_string(),
            })?;
        match handle
            .authenticate_password(params.username.clone(), params.password.clone())
            .await
        {
            Ok(AuthResult::Success) => Ok(handle),
            Ok(AuthResult::Failure { .. }) => Err(SessionError::Handshake {
                addr: ssh_addr.clone(),
                reason: "password authentication rejected".to_string(),
            }),
            Err(e) => Err(SessionError::Handshake {
                addr: ssh_addr.clone(),
                reason: e.to_string(),
            }),
        }
    };

    match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::Handshake {
            addr: params.ssh_addr(),
            reason: format!("timed out after {}s", HANDSHAKE_TIMEOUT.as_secs()),
        }),
    }
}

/// Wait until an SSH channel reports EOF or close.
///
/// Used as a transport monitor: russh tears all channels down when the
/// connection dies (including after [`KEEPALIVE_MAX`] unanswered probes),
/// so a closing monitor channel means the session is gone.
pub(crate) async fn wait_for_channel_close(channel: Channel<Msg>) {
    let (mut rx, _tx) = channel.split();
    loop {
        match rx.wait().await {
            Some(ChannelMsg::Eof | ChannelMsg::Close) | None => break,
            _ => {}
        }
    }
}

/// Bridge one accepted connection with its counterpart.
///
/// Both directions are copied concurrently; the worker tears the pair down
/// as soon as either direction finishes (EOF or error) or the session is
/// cancelled. Per-connection failures never escalate past this function.
pub(crate) async fn relay_streams<A, B>(a: A, b: B, cancel: CancellationToken)
where
    A: AsyncRead + AsyncWrite + Send,
    B: AsyncRead + AsyncWrite + Send,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    tokio::select! {
        () = cancel.cancelled() => {}
        result = tokio::io::copy(&mut a_read, &mut b_write) => {
            if let Err(e) = result {
                debug!("Relay closed: {e}");
            }
        }
        result = tokio::io::copy(&mut b_read, &mut a_write) => {
            if let Err(e) = result {
                debug!("Relay closed: {e}");
            }
        }
    }
    // Dropping both halves closes both connections.
}
