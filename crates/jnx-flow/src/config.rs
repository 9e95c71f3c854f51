//! Process configuration, loaded from a TOML file at startup.
//!
//! 布局与反序列化方式：`serde` 派生 + `toml::from_str`，在进程启动时一次性
//! 加载，运行期不支持热加载。

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Address the control channel listens on for the management process.
    pub control_listen_addr: SocketAddr,
    /// Number of packet-worker tasks; mirrors the original's
    /// `JNX_FLOW_DATA_PKT_THREAD_COUNT` upper bound of 32.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Capacity of the shared `FlowEntry` slab, in entries.
    #[serde(default = "default_arena_capacity")]
    pub arena_capacity: usize,
    /// Default per-flow idle timeout in seconds
    /// (`JNX_FLOW_DATA_FLOW_EXPIRY_TIME_SEC` in the original).
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u32,
    /// Ager sweep period in seconds (`JNX_FLOW_DATA_PERIODIC_SEC`).
    #[serde(default = "default_periodic_secs")]
    pub periodic_secs: u64,
}

fn default_worker_count() -> usize {
    4
}

fn default_arena_capacity() -> usize {
    1 << 16
}

fn default_timeout_secs() -> u32 {
    20
}

fn default_periodic_secs() -> u64 {
    5
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.as_ref().display()))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.as_ref().display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_when_omitted() {
        let raw = r#"control_listen_addr = "127.0.0.1:9001""#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.default_timeout_secs, 20);
        assert_eq!(config.periodic_secs, 5);
    }
}
