// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Edge user-listener (C3): accepts end-user TCP connections on the public
//! port and relays their bytes over the control channel as DATA frames
//! tagged with a freshly allocated UID.

use std::sync::{Arc, atomic::Ordering};

use anyhow::{Context, Result};
use tokio::{io::AsyncWriteExt, net::TcpListener};
use tracing::{debug, info, warn};

use crate::{
    protocol::MessageType,
    session::{FrameSink, SessionTable},
};

/// Read-side buffer size for the user-facing socket pump (§4.3).
const READ_BUF_LEN: usize = 1024;

/// Accepts connections on `bind_addr` forever, registering each one in
/// `sessions` and relaying its bytes through `sink`. Connections beyond
/// `max_sessions` are closed immediately without ever being registered
/// (runtime limit, §10). Returns only on a listener-level error (bind
/// failure, accept failure); individual connection errors are logged and
/// do not bring the listener down.
pub async fn run_user_listener(
    bind_addr: &str,
    sessions: Arc<SessionTable>,
    sink: FrameSink,
    max_sessions: u32,
) -> Result<()> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind user listener on {bind_addr}"))?;
    info!(%bind_addr, "user listener bound");

    loop {
        let (mut stream, peer) = listener.accept().await.context("accept failed")?;

        if sessions.len() >= max_sessions as usize {
            warn!(%peer, max_sessions, "session table full, rejecting connection");
            let _ = stream.shutdown().await;
            continue;
        }

        let sessions = Arc::clone(&sessions);
        let sink = sink.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_user_connection(stream, sessions, sink).await {
                warn!(%peer, %err, "user connection ended with error");
            }
        });
    }
}

async fn handle_user_connection(
    stream: tokio::net::TcpStream,
    sessions: Arc<SessionTable>,
    sink: FrameSink,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let uid = sessions.allocate();

    // No session is registered yet: if there's no active control channel
    // to carry NEW_CLIENT, close the user socket immediately rather than
    // leaking a table entry that nothing will ever tear down (§4.3).
    if let Err(err) = sink.send(uid, MessageType::NewClient, b"").await {
        warn!(uid, %err, "no active control channel, closing user connection");
        let _ = writer.shutdown().await;
        return Err(err);
    }

    let peer_closed = sessions.insert(uid, writer);
    debug!(uid, "user connection accepted");

    let mut buf = vec![0u8; READ_BUF_LEN];
    let result = loop {
        use tokio::io::AsyncReadExt;
        match reader.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => {
                if let Err(err) = sink.send(uid, MessageType::Data, &buf[..n]).await {
                    break Err(err);
                }
            }
            Err(err) => break Err(err.into()),
        }
    };

    if peer_closed.load(Ordering::SeqCst) {
        debug!(uid, "session already closed by peer DISCONNECT, not re-emitting");
    } else {
        sessions.remove(uid);
        let _ = sink.send(uid, MessageType::Disconnect, b"").await;
    }
    debug!(uid, "user connection closed");
    result
}
