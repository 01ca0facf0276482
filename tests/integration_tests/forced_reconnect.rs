// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};
use tunnelmux::{
    agent::AgentState,
    protocol::{MessageType, encode},
};

use super::common::{start_agent, start_echo_backend, wait_until_async};

/// S5: when the current control channel dies without a replacement
/// staged (Path A of §4.6), the agent forces a brand new connection
/// rather than staying wedged in `Reconnecting` forever.
#[tokio::test(flavor = "multi_thread")]
async fn dead_channel_forces_a_fresh_reconnect() {
    let backend_addr = start_echo_backend().await.expect("backend");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind flaky edge");
    let control_addr = listener.local_addr().expect("addr");

    let agent = start_agent(
        control_addr,
        backend_addr,
        Duration::from_secs(5),
        Duration::from_secs(30),
        Duration::from_secs(3600),
        Duration::from_secs(300),
    )
    .await;

    // First accept: hand the agent a connection, then drop it without
    // ever answering further frames.
    let (mut first, _) = listener.accept().await.expect("first accept");
    first
        .write_all(&encode(0, MessageType::NewConnectionEstablished, b""))
        .await
        .expect("handshake");

    let connected = wait_until_async(Duration::from_secs(2), || {
        let control = agent.control.clone();
        async move { control.state().await == AgentState::Connected }
    })
    .await;
    assert!(connected, "agent should connect to the first channel");

    drop(first);

    // Second accept: the agent should dial again on its own.
    let (mut second, _) = listener.accept().await.expect("second accept");
    second
        .write_all(&encode(0, MessageType::NewConnectionEstablished, b""))
        .await
        .expect("handshake");

    let reconnected = wait_until_async(Duration::from_secs(5), || {
        let control = agent.control.clone();
        async move { control.state().await == AgentState::Connected }
    })
    .await;
    assert!(reconnected, "agent should force a fresh reconnect");

    // Keep the second socket alive until the assertion above has had a
    // chance to observe a PING, so the test doesn't race a spurious EOF.
    let mut scratch = [0u8; 9];
    let _ = tokio::time::timeout(Duration::from_millis(50), second.read(&mut scratch)).await;
}
