//! Forward (`-L`) session attempt: local listener, remote connect.

use std::sync::Arc;

use russh::client;
use russh::Disconnect;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    connect_ssh, relay_streams, wait_for_channel_close, ClientHandler, SessionError, TunnelParams,
};
use crate::dial::Dialer;

/// Run one forward session until it fails or the user stops it.
///
/// `Ok(())` means stop was signalled; any error feeds the outer retry loop.
pub(crate) async fn run_attempt(
    params: &TunnelParams,
    dialer: &Dialer,
    stop: &CancellationToken,
) -> Result<(), SessionError> {
    let handler = ClientHandler::new(params.host_key_policy);
    let handle = Arc::new(connect_ssh(params, dialer, handler).await?);

    let bind_addr = params.bind_addr();
    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|source| SessionError::LocalBind {
            addr: bind_addr.clone(),
            source,
        })?;

    info!(
        "Tunnel up: {bind_addr} -> {} -> {}",
        params.ssh_addr(),
        params.target_addr()
    );

    // First error wins; later ones are dropped.
    let (err_tx, mut err_rx) = mpsc::channel::<SessionError>(1);

    // Workers are cancelled when this attempt unwinds, whatever the reason.
    let conn_cancel = CancellationToken::new();
    let _conn_guard = conn_cancel.clone().drop_guard();

    // Transport monitor: a closing channel means the connection died,
    // keepalive exhaustion included.
    let monitor_channel =
        handle
            .channel_open_session()
            .await
            .map_err(|e| SessionError::Handshake {
                addr: params.ssh_addr(),
                reason: format!("monitor channel: {e}"),
            })?;
    let monitor_tx = err_tx.clone();
    let monitor = tokio::spawn(async move {
        wait_for_channel_close(monitor_channel).await;
        let _ = monitor_tx.try_send(SessionError::Keepalive("ssh transport closed".to_string()));
    });

    // Accept loop: one worker per accepted connection.
    let accept_handle = Arc::clone(&handle);
    let accept_stop = stop.clone();
    let accept_cancel = conn_cancel.clone();
    let target_host = params.target_host.clone();
    let target_port = params.target_port;
    let accept = tokio::spawn(async move {
        loop {
            let (local, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    if !accept_stop.is_cancelled() {
                        let _ = err_tx.try_send(SessionError::Accept(e.to_string()));
                    }
                    return;
                }
            };
            debug!("Accepted {peer}");
            tokio::spawn(serve_connection(
                Arc::clone(&accept_handle),
                local,
                target_host.clone(),
                target_port,
                accept_cancel.child_token(),
            ));
        }
    });

    let result = tokio::select! {
        () = stop.cancelled() => Ok(()),
        err = err_rx.recv() => Err(err
            .unwrap_or_else(|| SessionError::Keepalive("session error channel closed".to_string()))),
    };

    monitor.abort();
    accept.abort();
    let _ = handle
        .disconnect(Disconnect::ByApplication, "tunnel stopped", "en")
        .await;
    result
}

/// Bridge one accepted local connection to the remote target through the
/// SSH session. Failures are per-connection: log, drop, done.
async fn serve_connection(
    handle: Arc<client::Handle<ClientHandler>>,
    local: TcpStream,
    target_host: String,
    target_port: u16,
    cancel: CancellationToken,
) {
    let channel = match handle
        .channel_open_direct_tcpip(&target_host, u32::from(target_port), "127.0.0.1", 0)
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            // Dropping `local` closes the accepted side.
            warn!("Failed to open channel to {target_host}:{target_port}: {e}");
            return;
        }
    };
    relay_streams(channel.into_stream(), local, cancel).await;
}
