// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tunnelmux::{
    cfg::{cli::resolve_config_path, config::EdgeConfig, logger::init_logger},
    edge::{EdgeControlSession, run_user_listener},
    session::SessionTable,
};

#[tokio::main]
async fn main() -> Result<()> {
    let _logger_guard = init_logger("config/edge.logger.yaml")?;

    let cfg = resolve_config_path("config/edge.yaml")
        .and_then(EdgeConfig::load_from_file)
        .context("failed to resolve or load edge config")?;

    let sessions = Arc::new(SessionTable::new());
    let control = EdgeControlSession::new(Arc::clone(&sessions));
    let cancel = CancellationToken::new();

    let listener_handle = {
        let sessions = Arc::clone(&sessions);
        let sink = control.sink();
        let bind_addr = cfg.edge.public_bind.clone();
        let max_sessions = cfg.runtime.max_sessions;
        tokio::spawn(async move { run_user_listener(&bind_addr, sessions, sink, max_sessions).await })
    };

    let control_listener = TcpListener::bind(&cfg.edge.control_bind)
        .await
        .with_context(|| format!("failed to bind control listener on {}", cfg.edge.control_bind))?;
    info!(control_bind = %cfg.edge.control_bind, "control listener bound");

    let accept_handle = {
        let control = control.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = control_listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                info!(%peer, "agent control connection accepted");
                                if let Err(err) = control.accept_control(stream).await {
                                    tracing::warn!(%err, "failed to bind agent control connection");
                                }
                            }
                            Err(err) => {
                                tracing::warn!(%err, "failed to accept agent control connection");
                            }
                        }
                    }
                }
            }
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        res = listener_handle => {
            res.context("user listener task panicked")??;
        }
    }

    cancel.cancel();
    let _ = accept_handle.await;
    sessions.close_all().await;
    Ok(())
}
