// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::common::{connect_user, start_agent, start_echo_backend, start_edge, wait_until_async};

/// Testable property #7 (§8): DATA round-trips correctly well beyond the
/// size of a single frame or relay read-buffer chunk.
#[tokio::test(flavor = "multi_thread")]
async fn large_payload_round_trips_intact() {
    let backend_addr = start_echo_backend().await.expect("backend");
    let edge = start_edge().await.expect("edge");
    let _agent = start_agent(
        edge.control_addr,
        backend_addr,
        Duration::from_secs(5),
        Duration::from_secs(30),
        Duration::from_secs(3600),
        Duration::from_secs(300),
    )
    .await;

    wait_until_async(Duration::from_secs(2), || {
        let sink = edge.sink.clone();
        async move { sink.is_active().await }
    })
    .await;

    let client = connect_user(edge.public_addr).await.expect("connect");
    let (mut read_half, mut write_half) = client.into_split();

    let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    let payload_clone = payload.clone();

    // Write and read concurrently: the relay's small per-hop buffers mean
    // a strictly write-then-read client would deadlock against its own
    // echo once the kernel's socket buffers fill.
    let writer = tokio::spawn(async move {
        write_half.write_all(&payload_clone).await.expect("write full payload");
    });

    let mut received = vec![0u8; payload.len()];
    read_half
        .read_exact(&mut received)
        .await
        .expect("read full echo");
    writer.await.expect("writer task");

    assert_eq!(received, payload);
}
