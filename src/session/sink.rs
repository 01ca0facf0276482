// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The "frame sink" capability (§9): a handle that resolves the current
//! control channel at each write, so per-session tasks never hold a
//! back-reference to the owning control session directly. Swaps are
//! atomic with respect to a single frame emission (§5).

use anyhow::{Result, bail};
use tokio::{io::AsyncWriteExt, net::tcp::OwnedWriteHalf, sync::Mutex};

use crate::protocol::{MessageType, encode};

struct SinkState {
    writer: Option<OwnedWriteHalf>,
    generation: u64,
}

/// Clonable handle onto the "current" control channel writer. Multiple
/// tasks (the user-listener, the backend-dialer, the pinger) send frames
/// through the same `FrameSink` without ever needing to know whether a
/// hot-swap has happened in between two calls.
#[derive(Clone)]
pub struct FrameSink {
    inner: std::sync::Arc<Mutex<SinkState>>,
}

impl FrameSink {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(Mutex::new(SinkState {
                writer: None,
                generation: 0,
            })),
        }
    }

    pub async fn is_active(&self) -> bool {
        self.inner.lock().await.writer.is_some()
    }

    /// Installs `writer` as the current channel, returning whatever was
    /// previously current (if any) along with the new generation number.
    pub async fn set(&self, writer: OwnedWriteHalf) -> (Option<OwnedWriteHalf>, u64) {
        let mut state = self.inner.lock().await;
        state.generation += 1;
        (state.writer.replace(writer), state.generation)
    }

    /// Clears the current writer, but only if it is still at `generation`
    /// — guards against a reader task that raced a hot-swap from clearing
    /// a channel that has already been superseded.
    pub async fn clear_if(&self, generation: u64) -> Option<OwnedWriteHalf> {
        let mut state = self.inner.lock().await;
        if state.generation == generation {
            state.writer.take()
        } else {
            None
        }
    }

    pub async fn take(&self) -> Option<OwnedWriteHalf> {
        self.inner.lock().await.writer.take()
    }

    /// Encodes and writes one frame on whichever channel is current right
    /// now, draining the write before returning (§4.3: "must drain writes
    /// before considering the byte delivered").
    pub async fn send(&self, uid: u32, msg_type: MessageType, payload: &[u8]) -> Result<()> {
        let mut state = self.inner.lock().await;
        let Some(writer) = state.writer.as_mut() else {
            bail!("no active control channel");
        };
        let frame = encode(uid, msg_type, payload);
        writer.write_all(&frame).await?;
        Ok(())
    }
}

impl Default for FrameSink {
    fn default() -> Self {
        Self::new()
    }
}
