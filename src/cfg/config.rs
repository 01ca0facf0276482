// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// Configuration for the publicly reachable edge process.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EdgeConfig {
    pub edge: EdgeEndpoints,
    #[serde(default)]
    pub runtime: RuntimeLimits,
}

/// Configuration for the NAT-side agent process.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct AgentConfig {
    pub agent: AgentEndpoints,
    #[serde(default)]
    pub keepalive: KeepaliveTimers,
    #[serde(default)]
    pub swap: SwapTimers,
}

/// Addresses the edge binds for user traffic and for the agent's control
/// channel (§6: "only the control port (12345) ... contractual" — the
/// public port is left to configuration).
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EdgeEndpoints {
    #[serde(rename = "PublicBind")]
    pub public_bind: String,
    #[serde(rename = "ControlBind")]
    pub control_bind: String,
}

/// Addresses the agent dials: the edge's control port, and the backend
/// service inside the NAT.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct AgentEndpoints {
    #[serde(rename = "EdgeControlAddr")]
    pub edge_control_addr: String,
    #[serde(rename = "BackendAddr")]
    pub backend_addr: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeLimits {
    #[serde(rename = "MaxSessions", default = "default_max_sessions")]
    pub max_sessions: u32,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
        }
    }
}

fn default_max_sessions() -> u32 {
    10_000
}

/// PING/PONG timing (§4.6/§4.7 — agent side only).
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct KeepaliveTimers {
    #[serde(rename = "PingInterval", with = "serde_secs", default = "default_ping_interval")]
    pub ping_interval: Duration,
    #[serde(rename = "PongTimeout", with = "serde_secs", default = "default_pong_timeout")]
    pub pong_timeout: Duration,
}

impl Default for KeepaliveTimers {
    fn default() -> Self {
        Self {
            ping_interval: default_ping_interval(),
            pong_timeout: default_pong_timeout(),
        }
    }
}

fn default_ping_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_pong_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Periodic hot-swap dialer timing (§4.6).
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SwapTimers {
    #[serde(rename = "Interval", with = "serde_secs", default = "default_swap_interval")]
    pub interval: Duration,
    #[serde(rename = "RetryBackoff", with = "serde_secs", default = "default_swap_backoff")]
    pub retry_backoff: Duration,
}

impl Default for SwapTimers {
    fn default() -> Self {
        Self {
            interval: default_swap_interval(),
            retry_backoff: default_swap_backoff(),
        }
    }
}

fn default_swap_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_swap_backoff() -> Duration {
    Duration::from_secs(300)
}

impl EdgeConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: EdgeConfig =
            serde_yaml::from_str(&s).context("failed to parse edge config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(!self.edge.public_bind.is_empty(), "edge.PublicBind must not be empty");
        ensure!(
            !self.edge.control_bind.is_empty(),
            "edge.ControlBind must not be empty"
        );
        ensure!(self.runtime.max_sessions >= 1, "runtime.MaxSessions must be >= 1");
        Ok(())
    }
}

impl AgentConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: AgentConfig =
            serde_yaml::from_str(&s).context("failed to parse agent config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            !self.agent.edge_control_addr.is_empty(),
            "agent.EdgeControlAddr must not be empty"
        );
        ensure!(
            !self.agent.backend_addr.is_empty(),
            "agent.BackendAddr must not be empty"
        );
        ensure!(
            self.keepalive.pong_timeout > self.keepalive.ping_interval,
            "keepalive.PongTimeout must be greater than keepalive.PingInterval"
        );
        ensure!(
            self.swap.retry_backoff > Duration::ZERO,
            "swap.RetryBackoff must be > 0"
        );
        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
