// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Agent control-session (C6, C7): dials out to the edge, keeps that
//! channel alive with periodic PING/PONG, and performs a make-before-break
//! hot-swap of the control channel on a fixed interval so that a single
//! connection is never kept open indefinitely (§4.6, §4.7).

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
    time::{Instant, interval, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    agent::dialer::dial_backend,
    cfg::config::AgentConfig,
    protocol::{Frame, MessageType, read_frame},
    session::{FrameSink, SessionTable},
};

/// Coarse observability state for the agent's control connection (C7).
/// Tracked explicitly even though it is driven by three cooperating tasks
/// rather than a single sequential step loop — the teacher's
/// request/response `StateMachine`/`Transition` pair models exactly one of
/// those shapes, so it isn't reused here; see DESIGN.md.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Dialing,
    Connected,
    SwapPreparing,
    Reconnecting,
}

struct Inner {
    edge_control_addr: String,
    backend_addr: String,
    ping_interval: Duration,
    pong_timeout: Duration,
    swap_interval: Duration,
    swap_backoff: Duration,

    sink: FrameSink,
    sessions: Arc<SessionTable>,

    current_reader: Mutex<Option<OwnedReadHalf>>,
    pending: Mutex<Option<(OwnedReadHalf, OwnedWriteHalf)>>,
    is_reconnecting: AtomicBool,
    last_pong: Mutex<Instant>,
    state: Mutex<AgentState>,
}

#[derive(Clone)]
pub struct AgentControlSession {
    inner: Arc<Inner>,
}

impl AgentControlSession {
    pub fn new(config: &AgentConfig, sessions: Arc<SessionTable>) -> Self {
        Self {
            inner: Arc::new(Inner {
                edge_control_addr: config.agent.edge_control_addr.clone(),
                backend_addr: config.agent.backend_addr.clone(),
                ping_interval: config.keepalive.ping_interval,
                pong_timeout: config.keepalive.pong_timeout,
                swap_interval: config.swap.interval,
                swap_backoff: config.swap.retry_backoff,
                sink: FrameSink::new(),
                sessions,
                current_reader: Mutex::new(None),
                pending: Mutex::new(None),
                is_reconnecting: AtomicBool::new(false),
                last_pong: Mutex::new(Instant::now()),
                state: Mutex::new(AgentState::Dialing),
            }),
        }
    }

    pub fn sink(&self) -> FrameSink {
        self.inner.sink.clone()
    }

    pub async fn state(&self) -> AgentState {
        *self.inner.state.lock().await
    }

    /// Establishes the initial connection, then drives the receiver,
    /// pinger, and periodic-dialer tasks concurrently until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.initial_connect(&cancel).await?;
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.receiver_loop(cancel.clone()) => {}
            _ = self.pinger_loop(cancel.clone()) => {}
            _ = self.periodic_dialer_loop(cancel.clone()) => {}
        }
        Ok(())
    }

    async fn initial_connect(&self, cancel: &CancellationToken) -> Result<()> {
        *self.inner.state.lock().await = AgentState::Dialing;
        let (reader, writer) = self.dial_with_retry(cancel).await?;
        *self.inner.current_reader.lock().await = Some(reader);
        self.inner.sink.set(writer).await;
        *self.inner.last_pong.lock().await = Instant::now();
        *self.inner.state.lock().await = AgentState::Connected;
        info!("agent control channel established");
        Ok(())
    }

    /// Dials the edge's control port, retrying every ~3s (§4.6) until
    /// success or cancellation.
    async fn dial_with_retry(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
        loop {
            if cancel.is_cancelled() {
                return Err(anyhow!("cancelled while dialing edge"));
            }
            match self.dial_once().await {
                Ok(pair) => return Ok(pair),
                Err(err) => {
                    warn!(%err, "failed to dial edge control port, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(anyhow!("cancelled while dialing edge")),
                        _ = sleep(Duration::from_secs(3)) => {}
                    }
                }
            }
        }
    }

    /// Connects once and consumes the NEW_CONNECTION_ESTABLISHED handshake
    /// tag the edge writes unprompted on every accepted control socket
    /// (§9 Open Question, resolved per the original implementation).
    async fn dial_once(&self) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
        let stream = TcpStream::connect(&self.inner.edge_control_addr)
            .await
            .with_context(|| format!("failed to connect to {}", self.inner.edge_control_addr))?;
        let _ = stream.set_nodelay(true);
        let (mut reader, writer) = stream.into_split();
        let frame = read_frame(&mut reader)
            .await
            .context("failed to read handshake from edge")?
            .ok_or_else(|| anyhow!("edge closed connection before handshake"))?;
        if frame.msg_type != MessageType::NewConnectionEstablished {
            warn!(
                msg_type = ?frame.msg_type,
                "unexpected first frame from edge, expected handshake"
            );
        }
        Ok((reader, writer))
    }

    async fn receiver_loop(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let mut reader = {
                let mut guard = self.inner.current_reader.lock().await;
                match guard.take() {
                    Some(r) => r,
                    None => {
                        // a reconnect is in flight; wait for it to land a reader.
                        sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                }
            };

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                res = read_frame(&mut reader) => res,
            };

            match outcome {
                Ok(Some(frame)) if frame.msg_type == MessageType::EndOfConnection => {
                    debug!("received END_OF_CONNECTION, promoting staged channel");
                    self.promote_pending(reader, &cancel).await;
                }
                Ok(Some(frame)) => {
                    self.dispatch(frame).await;
                    *self.inner.current_reader.lock().await = Some(reader);
                }
                Ok(None) => {
                    warn!("edge control channel closed cleanly, forcing reconnect");
                    drop(reader);
                    self.force_reconnect(&cancel).await;
                }
                Err(err) => {
                    warn!(%err, "error reading from edge control channel, forcing reconnect");
                    drop(reader);
                    self.force_reconnect(&cancel).await;
                }
            }
        }
    }

    async fn dispatch(&self, frame: Frame) {
        match frame.msg_type {
            MessageType::NewClient => {
                let uid = frame.uid;
                let sessions = Arc::clone(&self.inner.sessions);
                let sink = self.inner.sink.clone();
                let backend_addr = self.inner.backend_addr.clone();
                tokio::spawn(async move {
                    dial_backend(uid, backend_addr, sessions, sink).await;
                });
            }
            MessageType::Data => {
                if let Some(handle) = self.inner.sessions.get(frame.uid) {
                    let write_result = {
                        let mut writer = handle.lock().await;
                        writer.write_all(&frame.payload).await
                    };
                    if let Err(err) = write_result {
                        warn!(uid = frame.uid, %err, "failed to write to backend, closing session");
                        self.inner.sessions.remove(frame.uid);
                        let mut writer = handle.lock().await;
                        let _ = writer.shutdown().await;
                        drop(writer);
                        let _ = self.inner.sink.send(frame.uid, MessageType::Disconnect, b"").await;
                    }
                } else {
                    debug!(uid = frame.uid, "DATA for unknown/closed session, dropping");
                }
            }
            MessageType::Disconnect => {
                if let Some(handle) = self.inner.sessions.remove_peer_initiated(frame.uid) {
                    let mut writer = handle.lock().await;
                    let _ = writer.shutdown().await;
                }
            }
            MessageType::Pong => {
                *self.inner.last_pong.lock().await = Instant::now();
            }
            MessageType::Ping => {
                let _ = self.inner.sink.send(0, MessageType::Pong, b"").await;
            }
            MessageType::NewConnectionEstablished | MessageType::EndOfConnection => {
                debug!(msg_type = ?frame.msg_type, "unexpected frame from edge here, ignoring");
            }
            MessageType::Unknown(code) => {
                debug!(code, "unknown message type from edge, ignoring");
            }
        }
    }

    /// Path B of the hot-swap (§4.6): a replacement channel was already
    /// staged by `periodic_dialer_loop`, so the swap is just a pointer flip.
    async fn promote_pending(&self, mut old_reader: OwnedReadHalf, cancel: &CancellationToken) {
        let pending = self.inner.pending.lock().await.take();
        match pending {
            Some((new_reader, new_writer)) => {
                *self.inner.state.lock().await = AgentState::SwapPreparing;
                self.inner.sink.set(new_writer).await;
                *self.inner.current_reader.lock().await = Some(new_reader);
                *self.inner.last_pong.lock().await = Instant::now();
                *self.inner.state.lock().await = AgentState::Connected;
                info!("hot-swapped to staged control channel");
                use tokio::io::AsyncReadExt as _;
                let mut discard = [0u8; 1];
                let _ = old_reader.read(&mut discard).await;
            }
            None => {
                warn!("END_OF_CONNECTION with no channel staged, forcing reconnect");
                drop(old_reader);
                self.force_reconnect(cancel).await;
            }
        }
    }

    /// Path A of the hot-swap (§4.6): the current channel is unusable and
    /// nothing was staged, so dial a brand new one from scratch. Guarded so
    /// that a concurrent pinger-triggered and receiver-triggered reconnect
    /// never race each other.
    async fn force_reconnect(&self, cancel: &CancellationToken) {
        if self.inner.is_reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.inner.state.lock().await = AgentState::Reconnecting;
        self.inner.sink.take().await;
        *self.inner.current_reader.lock().await = None;

        match self.dial_with_retry(cancel).await {
            Ok((reader, writer)) => {
                *self.inner.current_reader.lock().await = Some(reader);
                self.inner.sink.set(writer).await;
                *self.inner.last_pong.lock().await = Instant::now();
                *self.inner.state.lock().await = AgentState::Connected;
                info!("reconnected to edge control channel");
            }
            Err(err) => {
                warn!(%err, "gave up reconnecting to edge");
            }
        }
        self.inner.is_reconnecting.store(false, Ordering::SeqCst);
    }

    async fn pinger_loop(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.inner.ping_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let _ = self.inner.sink.send(0, MessageType::Ping, b"").await;
            let stale = {
                let last = *self.inner.last_pong.lock().await;
                last.elapsed() > self.inner.pong_timeout
            };
            if stale {
                warn!("PONG timeout exceeded, forcing reconnect");
                self.force_reconnect(&cancel).await;
            }
        }
    }

    /// Every `swap.interval`, dials a fresh control connection and stashes
    /// it for `promote_pending` to pick up, so the channel is refreshed
    /// before it is ever forced to (§4.6).
    #[cfg(test)]
    fn test_config() -> AgentConfig {
        AgentConfig {
            agent: crate::cfg::config::AgentEndpoints {
                edge_control_addr: "127.0.0.1:1".to_string(),
                backend_addr: "127.0.0.1:1".to_string(),
            },
            keepalive: crate::cfg::config::KeepaliveTimers {
                ping_interval: Duration::from_secs(5),
                pong_timeout: Duration::from_secs(30),
            },
            swap: crate::cfg::config::SwapTimers {
                interval: Duration::from_secs(3600),
                retry_backoff: Duration::from_secs(300),
            },
        }
    }

    async fn periodic_dialer_loop(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(self.inner.swap_interval) => {}
            }
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                match self.dial_once().await {
                    Ok((reader, writer)) => {
                        *self.inner.pending.lock().await = Some((reader, writer));
                        info!("staged replacement control channel for hot-swap");
                        break;
                    }
                    Err(err) => {
                        warn!(%err, "failed to stage replacement channel, retrying");
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = sleep(self.inner.swap_backoff) => {}
                        }
                    }
                }
            }
        }
    }
}
