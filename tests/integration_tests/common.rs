// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tunnelmux::{
    agent::AgentControlSession,
    cfg::config::{AgentConfig, AgentEndpoints, KeepaliveTimers, SwapTimers},
    edge::{EdgeControlSession, run_user_listener},
    session::SessionTable,
};

/// A backend that echoes every byte it receives back to the sender,
/// standing in for "the opaque service behind the NAT" (§1).
pub async fn start_echo_backend() -> Result<std::net::SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    Ok(addr)
}

pub struct EdgeHandle {
    pub public_addr: std::net::SocketAddr,
    pub control_addr: std::net::SocketAddr,
    pub sessions: Arc<SessionTable>,
    pub sink: tunnelmux::session::FrameSink,
    pub cancel: CancellationToken,
}

/// Starts a full edge (C3 listener + C5 control session) on ephemeral
/// ports, mirroring `src/bin/edge.rs` without going through a config file.
pub async fn start_edge() -> Result<EdgeHandle> {
    start_edge_with_max_sessions(10_000).await
}

/// Like [`start_edge`], but with an explicit session cap so tests can
/// exercise the "table full" rejection path (§10).
pub async fn start_edge_with_max_sessions(max_sessions: u32) -> Result<EdgeHandle> {
    let sessions = Arc::new(SessionTable::new());
    let control = EdgeControlSession::new(Arc::clone(&sessions));
    let cancel = CancellationToken::new();

    let public_listener = TcpListener::bind("127.0.0.1:0").await?;
    let public_addr = public_listener.local_addr()?;
    {
        let sessions = Arc::clone(&sessions);
        let sink = control.sink();
        let bind_addr = public_addr.to_string();
        drop(public_listener);
        tokio::spawn(async move {
            let _ = run_user_listener(&bind_addr, sessions, sink, max_sessions).await;
        });
    }

    let control_listener = TcpListener::bind("127.0.0.1:0").await?;
    let control_addr = control_listener.local_addr()?;
    {
        let control = control.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    accepted = control_listener.accept() => {
                        let Ok((stream, _)) = accepted else { return };
                        let _ = control.accept_control(stream).await;
                    }
                }
            }
        });
    }

    Ok(EdgeHandle {
        public_addr,
        control_addr,
        sessions,
        sink: control.sink(),
        cancel,
    })
}

pub struct AgentHandle {
    pub control: AgentControlSession,
    pub cancel: CancellationToken,
}

/// Starts a full agent (C4 dialer + C6/C7 control session) against a given
/// edge control address and backend address, using short timers suited to
/// a test environment.
pub async fn start_agent(
    edge_control_addr: std::net::SocketAddr,
    backend_addr: std::net::SocketAddr,
    ping_interval: Duration,
    pong_timeout: Duration,
    swap_interval: Duration,
    swap_backoff: Duration,
) -> AgentHandle {
    let cfg = AgentConfig {
        agent: AgentEndpoints {
            edge_control_addr: edge_control_addr.to_string(),
            backend_addr: backend_addr.to_string(),
        },
        keepalive: KeepaliveTimers {
            ping_interval,
            pong_timeout,
        },
        swap: SwapTimers {
            interval: swap_interval,
            retry_backoff: swap_backoff,
        },
    };
    let sessions = Arc::new(SessionTable::new());
    let control = AgentControlSession::new(&cfg, sessions);
    let cancel = CancellationToken::new();
    {
        let control = control.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = control.run(cancel).await;
        });
    }
    AgentHandle { control, cancel }
}

/// Polls `cond` until it returns true or `timeout` elapses, for assertions
/// about asynchronous state that settles on its own schedule.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    cond()
}

pub async fn connect_user(public_addr: std::net::SocketAddr) -> Result<TcpStream> {
    Ok(TcpStream::connect(public_addr).await?)
}

/// Async-predicate variant of [`wait_until`], for conditions that must
/// themselves be awaited (e.g. `FrameSink::is_active`).
pub async fn wait_until_async<F, Fut>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond().await {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    cond().await
}
