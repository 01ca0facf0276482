// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use tunnelmux::agent::AgentState;

use super::common::{start_agent, start_echo_backend, start_edge, wait_until_async};

/// S4: with a responsive edge, PING/PONG keeps the agent's control
/// channel marked `Connected` across several keep-alive cycles — it is
/// never forced into `Reconnecting` just because time passes.
#[tokio::test(flavor = "multi_thread")]
async fn keepalive_holds_the_channel_connected() {
    let backend_addr = start_echo_backend().await.expect("backend");
    let edge = start_edge().await.expect("edge");
    let agent = start_agent(
        edge.control_addr,
        backend_addr,
        Duration::from_millis(80),
        Duration::from_millis(400),
        Duration::from_secs(3600),
        Duration::from_secs(300),
    )
    .await;

    let connected = wait_until_async(Duration::from_secs(2), || {
        let control = agent.control.clone();
        async move { control.state().await == AgentState::Connected }
    })
    .await;
    assert!(connected, "agent should reach Connected");

    // Outlast several ping intervals; the edge answers every PING with a
    // PONG, so the agent must never go stale.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(agent.control.state().await, AgentState::Connected);
}
