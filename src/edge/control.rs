// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Edge control-session (C5): owns the single multiplexed channel to
//! whichever agent is currently connected, fans incoming frames out to
//! user sessions, and performs the hot-swap handshake described in §4.4
//! and §9 whenever a new agent control connection arrives.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
};
use tracing::{debug, info, warn};

use crate::{
    protocol::{FrameError, MessageType, read_frame},
    session::{FrameSink, SessionTable},
};

/// Owns the current control channel and the table of live user sessions
/// it fans DATA frames out to.
#[derive(Clone)]
pub struct EdgeControlSession {
    sink: FrameSink,
    sessions: Arc<SessionTable>,
}

impl EdgeControlSession {
    pub fn new(sessions: Arc<SessionTable>) -> Self {
        Self {
            sink: FrameSink::new(),
            sessions,
        }
    }

    /// A handle user-facing code (the listener) sends frames through.
    pub fn sink(&self) -> FrameSink {
        self.sink.clone()
    }

    /// Accepts and binds a freshly dialed agent control connection as the
    /// new current channel, atomically displacing whatever was current
    /// before (§4.4 "hot-swap", §9 Open Question: NEW_CONNECTION_ESTABLISHED
    /// is written unconditionally, matching the original implementation).
    pub async fn accept_control(&self, stream: TcpStream) -> Result<()> {
        let _ = stream.set_nodelay(true);
        let (reader, mut writer) = stream.into_split();

        writer
            .write_all(&crate::protocol::encode(0, MessageType::NewConnectionEstablished, b""))
            .await
            .context("failed to write NEW_CONNECTION_ESTABLISHED handshake")?;

        let (old_writer, generation) = self.sink.set(writer).await;
        if let Some(mut old) = old_writer {
            info!(generation, "hot-swapping agent control channel");
            let _ = old
                .write_all(&crate::protocol::encode(0, MessageType::EndOfConnection, b""))
                .await;
            let _ = old.shutdown().await;
        }

        let session = self.clone();
        tokio::spawn(async move {
            session.run_reader(reader, generation).await;
        });
        Ok(())
    }

    async fn run_reader(&self, mut reader: tokio::net::tcp::OwnedReadHalf, generation: u64) {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => {
                    if let Err(err) = self.dispatch(frame).await {
                        warn!(%err, "error handling frame from agent");
                    }
                }
                Ok(None) => {
                    debug!(generation, "agent control channel closed cleanly");
                    break;
                }
                Err(FrameError::Io(err)) => {
                    warn!(%err, generation, "io error reading from agent control channel");
                    break;
                }
                Err(err) => {
                    warn!(%err, generation, "protocol error reading from agent control channel");
                    break;
                }
            }
        }
        self.sink.clear_if(generation).await;
    }

    async fn dispatch(&self, frame: crate::protocol::Frame) -> Result<()> {
        match frame.msg_type {
            MessageType::Data => {
                if let Some(handle) = self.sessions.get(frame.uid) {
                    let write_result = {
                        let mut writer = handle.lock().await;
                        writer.write_all(&frame.payload).await
                    };
                    if let Err(err) = write_result {
                        warn!(uid = frame.uid, %err, "failed to write to user socket, closing session");
                        self.sessions.remove(frame.uid);
                        let mut writer = handle.lock().await;
                        let _ = writer.shutdown().await;
                        drop(writer);
                        self.sink.send(frame.uid, MessageType::Disconnect, b"").await?;
                    }
                } else {
                    debug!(uid = frame.uid, "DATA for unknown/closed session, dropping");
                }
            }
            MessageType::Disconnect => {
                if let Some(handle) = self.sessions.remove_peer_initiated(frame.uid) {
                    let mut writer = handle.lock().await;
                    let _ = writer.shutdown().await;
                }
            }
            MessageType::Ping => {
                self.sink.send(0, MessageType::Pong, b"").await?;
            }
            MessageType::Pong
            | MessageType::NewClient
            | MessageType::NewConnectionEstablished
            | MessageType::EndOfConnection => {
                debug!(msg_type = ?frame.msg_type, "unexpected frame from agent, ignoring");
            }
            MessageType::Unknown(code) => {
                debug!(code, "unknown message type from agent, ignoring");
            }
        }
        Ok(())
    }
}
