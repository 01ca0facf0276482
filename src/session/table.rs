// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Session table (C2): `uid -> write half` of the socket this side owns
//! for that session (the user socket on the edge, the backend socket on
//! the agent). Modeled on the teacher's `client::pool_sessions::Pool`
//! `DashMap`-keyed table.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use dashmap::DashMap;
use tokio::{net::tcp::OwnedWriteHalf, sync::Mutex};

struct SessionEntry {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    /// Set when this session was torn down because the *peer* sent
    /// DISCONNECT, so the local read pump that owns this flag's other
    /// clone knows to absorb its own end-of-stream rather than re-emit a
    /// second DISCONNECT for a session the peer already knows is gone
    /// (invariant 3, §8).
    peer_closed: Arc<AtomicBool>,
}

/// Maps session UID to the write half this process owns for that session.
///
/// `allocate` is only ever called on the edge side (§4.2: "allocate() ->
/// new UID (edge only)"); the agent only `insert`s under UIDs it received
/// from the edge.
pub struct SessionTable {
    sessions: DashMap<u32, SessionEntry>,
    next_uid: AtomicU32,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_uid: AtomicU32::new(1),
        }
    }

    /// Returns the next UID, strictly increasing and unique for the
    /// lifetime of this table (invariant 2 of the spec).
    pub fn allocate(&self) -> u32 {
        self.next_uid.fetch_add(1, Ordering::SeqCst)
    }

    /// Inserts a session, returning the `peer_closed` flag the owning read
    /// pump should check before emitting its own DISCONNECT.
    pub fn insert(&self, uid: u32, writer: OwnedWriteHalf) -> Arc<AtomicBool> {
        let peer_closed = Arc::new(AtomicBool::new(false));
        self.sessions.insert(uid, SessionEntry {
            writer: Arc::new(Mutex::new(writer)),
            peer_closed: Arc::clone(&peer_closed),
        });
        peer_closed
    }

    pub fn get(&self, uid: u32) -> Option<Arc<Mutex<OwnedWriteHalf>>> {
        self.sessions.get(&uid).map(|entry| Arc::clone(&entry.value().writer))
    }

    /// Local teardown: this side discovered the session is dead (its own
    /// socket hit EOF/error, or a write to it failed) and the peer needs
    /// to be told via DISCONNECT. Idempotent: removing an absent UID is a
    /// no-op (invariant 8).
    pub fn remove(&self, uid: u32) -> Option<Arc<Mutex<OwnedWriteHalf>>> {
        self.sessions.remove(&uid).map(|(_, entry)| entry.writer)
    }

    /// Peer-initiated teardown: the other side already sent DISCONNECT for
    /// this UID, so the local read pump must not re-emit one once its own
    /// socket eventually closes. Marks `peer_closed` before removing so
    /// that pump observes it even if it's still mid-read.
    pub fn remove_peer_initiated(&self, uid: u32) -> Option<Arc<Mutex<OwnedWriteHalf>>> {
        self.sessions.remove(&uid).map(|(_, entry)| {
            entry.peer_closed.store(true, Ordering::SeqCst);
            entry.writer
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drains the table, shutting down every still-open socket. Used on
    /// process shutdown after the background tasks have been cancelled
    /// (§5: "user sessions are then closed").
    pub async fn close_all(&self) {
        let handles: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(&entry.value().writer))
            .collect();
        self.sessions.clear();
        for handle in handles {
            use tokio::io::AsyncWriteExt;
            let mut writer = handle.lock().await;
            let _ = writer.shutdown().await;
        }
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}
