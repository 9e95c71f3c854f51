//! Process configuration, loaded from a TOML file at startup.
//!
//! 与 `jnx-flow::config` 同一套 `serde` + `toml::from_str` 惯例；新增的字段对应
//! 按 facade 地址是否命中规则/应用/健康服务器划分的三档会话超时（`TimeoutPolicy`）。
//! 健康探测端口不在这里配置，探测目标始终是被探测服务器所属 `Application` 自己的
//! facade 端口，随应用配置下发。

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use crate::worker::TimeoutPolicy;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Address the control channel listens on for the management process.
    pub control_listen_addr: SocketAddr,
    /// Number of packet-worker tasks.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Capacity of the shared `FlowEntry` slab, in entries.
    #[serde(default = "default_arena_capacity")]
    pub arena_capacity: usize,
    /// Ager sweep period in seconds.
    #[serde(default = "default_periodic_secs")]
    pub periodic_secs: u64,
    /// Timeout assigned to a flow that matched a direct rule, bypassing
    /// application selection entirely.
    #[serde(default = "default_rule_match_secs")]
    pub rule_match_timeout_secs: u32,
    /// Timeout assigned to a flow whose destination matched no rule and no
    /// application facade (the "non-application" placeholder).
    #[serde(default = "default_non_application_secs")]
    pub non_application_timeout_secs: u32,
    /// Timeout assigned to a flow whose application had no `Up` server at
    /// classification time (the "all-servers-down" placeholder).
    #[serde(default = "default_all_servers_down_secs")]
    pub all_servers_down_timeout_secs: u32,
    /// TCP port the health prober connects to on every backend server. Every
    /// server behind every application is assumed to serve HTTP on the same
    /// port (the original probes the application's own facade port against
    /// the backend address instead of a separately configured one).
    #[serde(default = "default_probe_port")]
    pub probe_port: u16,
}

fn default_worker_count() -> usize {
    4
}

fn default_arena_capacity() -> usize {
    1 << 16
}

fn default_periodic_secs() -> u64 {
    5
}

fn default_rule_match_secs() -> u32 {
    20
}

fn default_non_application_secs() -> u32 {
    300
}

fn default_all_servers_down_secs() -> u32 {
    60
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.as_ref().display()))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.as_ref().display()))?;
        Ok(config)
    }

    pub fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy {
            rule_match_secs: self.rule_match_timeout_secs,
            non_application_secs: self.non_application_timeout_secs,
            all_servers_down_secs: self.all_servers_down_timeout_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_when_omitted() {
        let raw = r#"control_listen_addr = "127.0.0.1:9002""#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.rule_match_timeout_secs, 20);
        assert_eq!(config.non_application_timeout_secs, 300);
        assert_eq!(config.all_servers_down_timeout_secs, 60);
    }
}
