//! Reverse (`-R`) session attempt: remote listener, local connect.
//!
//! The SSH server binds the remote address via `tcpip-forward` and streams
//! each accepted connection back as a `forwarded-tcpip` channel; the
//! handler installed in [`ClientHandler`] bridges those channels to the
//! local target, so this side has no accept loop of its own.

use russh::Disconnect;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{
    connect_ssh, wait_for_channel_close, ClientHandler, SessionError, TunnelParams,
};
use crate::dial::Dialer;

/// Run one reverse session until it fails or the user stops it.
///
/// `Ok(())` means stop was signalled; any error feeds the outer retry loop.
pub(crate) async fn run_attempt(
    params: &TunnelParams,
    dialer: &Dialer,
    stop: &CancellationToken,
) -> Result<(), SessionError> {
    // Workers are cancelled when this attempt unwinds, whatever the reason.
    let conn_cancel = CancellationToken::new();
    let _conn_guard = conn_cancel.clone().drop_guard();

    let handler = ClientHandler::with_reverse_target(
        params.host_key_policy,
        params.target_addr(),
        conn_cancel.clone(),
    );
    let mut handle = connect_ssh(params, dialer, handler).await?;

    let bind_addr = params.bind_addr();
    let bound_port = handle
        .tcpip_forward(params.bind_host.clone(), u32::from(params.bind_port))
        .await
        .map_err(|e| SessionError::RemoteBind {
            addr: bind_addr.clone(),
            reason: e.to_string(),
        })?;
    if bound_port != 0 && bound_port != u32::from(params.bind_port) {
        warn!("Requested remote port {} but server bound {bound_port}", params.bind_port);
    }

    info!(
        "Tunnel up: remote {bind_addr} -> {} -> local {}",
        params.ssh_addr(),
        params.target_addr()
    );

    // First error wins; later ones are dropped.
    let (err_tx, mut err_rx) = mpsc::channel::<SessionError>(1);

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
    let monitor = tokio::spawn(async move {
        wait_for_channel_close(monitor_channel).await;
        let _ = err_tx.try_send(SessionError::Keepalive("ssh transport closed".to_string()));
    });

    let result = tokio::select! {
        () = stop.cancelled() => Ok(()),
        err = err_rx.recv() => Err(err
            .unwrap_or_else(|| SessionError::Keepalive("session error channel closed".to_string()))),
    };

    monitor.abort();
    let _ = handle
        .disconnect(Disconnect::ByApplication, "tunnel stopped", "en")
        .await;
    result
}
