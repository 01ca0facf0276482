// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Agent backend-dialer (C4): on NEW_CLIENT, opens a connection to the
//! backend service inside the NAT and relays its bytes as DATA frames
//! tagged with the UID the edge allocated for the originating user.

use std::sync::{Arc, atomic::Ordering};

use anyhow::Context;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::{
    protocol::MessageType,
    session::{FrameSink, SessionTable},
};

const READ_BUF_LEN: usize = 1024;

/// Dials `backend_addr`, registers the connection under `uid`, and pumps
/// bytes from it onto the control channel until it closes.
pub async fn dial_backend(
    uid: u32,
    backend_addr: String,
    sessions: Arc<SessionTable>,
    sink: FrameSink,
) {
    let stream = match TcpStream::connect(&backend_addr)
        .await
        .with_context(|| format!("failed to dial backend {backend_addr}"))
    {
        Ok(stream) => stream,
        Err(err) => {
            warn!(uid, %backend_addr, %err, "failed to dial backend");
            sessions.remove(uid);
            let _ = sink.send(uid, MessageType::Disconnect, b"").await;
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();
    let peer_closed = sessions.insert(uid, writer);
    debug!(uid, %backend_addr, "backend connection established");

    let mut buf = vec![0u8; READ_BUF_LEN];
    loop {
        use tokio::io::AsyncReadExt;
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(err) = sink.send(uid, MessageType::Data, &buf[..n]).await {
                    warn!(uid, %err, "failed to forward backend bytes onto control channel");
                    break;
                }
            }
            Err(err) => {
                warn!(uid, %backend_addr, %err, "backend connection ended with error");
                break;
            }
        }
    }

    // §8 invariant 3: if the peer already sent DISCONNECT for this UID,
    // absorb our own end-of-stream instead of re-emitting one.
    if peer_closed.load(Ordering::SeqCst) {
        debug!(uid, "session already closed by peer DISCONNECT, not re-emitting");
    } else {
        sessions.remove(uid);
        let _ = sink.send(uid, MessageType::Disconnect, b"").await;
    }
}
