// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tunnelmux::{
    agent::AgentControlSession,
    cfg::{cli::resolve_config_path, config::AgentConfig, logger::init_logger},
    session::SessionTable,
};

#[tokio::main]
async fn main() -> Result<()> {
    let _logger_guard = init_logger("config/agent.logger.yaml")?;

    let cfg = resolve_config_path("config/agent.yaml")
        .and_then(AgentConfig::load_from_file)
        .context("failed to resolve or load agent config")?;

    let sessions = Arc::new(SessionTable::new());
    let control = AgentControlSession::new(&cfg, sessions.clone());
    let cancel = CancellationToken::new();

    let run_handle = {
        let control = control.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { control.run(cancel).await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        res = run_handle => {
            res.context("control session task panicked")??;
        }
    }

    cancel.cancel();
    sessions.close_all().await;
    Ok(())
}
