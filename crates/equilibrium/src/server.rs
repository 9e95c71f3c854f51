//! Application/server catalogue and least-load server selection.
//!
//! # 设计背景（Why）
//! - 字段直接对应原始 `equilibrium-data_config.h` 的 `update_application`/
//!   `add_server`/`eq_smon_t`：一个 `Application` 绑定一个 facade
//!   地址+端口（供客户端连接）、一个会话超时、一套健康探测参数
//!   （连接间隔/超时/允许超时次数/下线重试间隔），下挂若干 `Server`。
//! - `get_app_name`/`get_app_session_timeout` 这对"按 facade 地址反查应用"的函数
//!   在这里对应 [`ApplicationCatalog::lookup_by_facade`]：C4 rewrite 变种在
//!   快路径上先按 `(svc_set_id, facade_addr, facade_port)` 找到 `Application`，
//!   再从其 `servers` 里选出负载最低且处于 Up 状态的一个。
//!
//! # 契约说明（What）
//! - [`Server::state`] 由 C6 健康探测器驱动（见 [`crate::health`]）；
//! - [`Application::select_server`] 返回负载最小的 Up 服务器，并原子递增其负载
//!   计数——调用方在会话失败/结束时应调用 [`Server::release`] 归还负载配额。

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use flow_core::error::{EngineError, EngineResult};
use flow_core::policy::Registry;
use parking_lot::Mutex;

/// Health-prober tuning, ported verbatim from `eq_smon_t`.
#[derive(Clone, Copy, Debug)]
pub struct MonitorConfig {
    pub connection_interval_secs: u16,
    pub connection_timeout_secs: u16,
    pub timeouts_allowed: u8,
    pub down_retry_interval_secs: u16,
}

/// Per-server health state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServerState {
    Idle,
    Connecting,
    AwaitingResponse,
    BackingOff,
    Up,
    Down,
}

pub struct Server {
    pub addr: Ipv4Addr,
    state: Mutex<ServerState>,
    load: AtomicU32,
    consecutive_timeouts: AtomicU8,
}

impl Server {
    pub fn new(addr: Ipv4Addr) -> Self {
        Self {
            addr,
            state: Mutex::new(ServerState::Idle),
            load: AtomicU32::new(0),
            consecutive_timeouts: AtomicU8::new(0),
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ServerState) {
        *self.state.lock() = state;
    }

    pub fn load(&self) -> u32 {
        self.load.load(Ordering::Relaxed)
    }

    pub fn is_up(&self) -> bool {
        matches!(self.state(), ServerState::Up)
    }

    fn acquire(&self) -> u32 {
        self.load.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Return one unit of load after a session using this server ends.
    pub fn release(&self) {
        self.load
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)))
            .ok();
    }

    /// Zero out the load counter on a down transition, so the server
    /// doesn't resume selection carrying a stale session count.
    pub fn reset_load(&self) {
        self.load.store(0, Ordering::Relaxed);
    }

    pub fn record_probe_success(&self) {
        self.consecutive_timeouts.store(0, Ordering::Relaxed);
        self.set_state(ServerState::Up);
    }

    /// Returns `true` if this failure pushed the server over its allowed
    /// timeout count and it should transition to `Down`/`BackingOff`.
    pub fn record_probe_timeout(&self, timeouts_allowed: u8) -> bool {
        let count = self.consecutive_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
        count >= timeouts_allowed
    }
}

pub struct Application {
    pub svc_set_id: u32,
    pub name: String,
    pub facade_addr: Ipv4Addr,
    pub facade_port: u16,
    pub session_timeout_secs: u16,
    /// `None` mirrors `update_application` being called with
    /// `connection_interval == 0`: every server added to this application is
    /// considered permanently `Up` and is never probed (`server_mon_params`
    /// stays `NULL` in the original).
    pub monitor: Option<MonitorConfig>,
    servers: Mutex<Vec<Arc<Server>>>,
}

impl Application {
    pub fn new(
        svc_set_id: u32,
        name: impl Into<String>,
        facade_addr: Ipv4Addr,
        facade_port: u16,
        session_timeout_secs: u16,
        monitor: Option<MonitorConfig>,
    ) -> Self {
        Self {
            svc_set_id,
            name: name.into(),
            facade_addr,
            facade_port,
            session_timeout_secs,
            monitor,
            servers: Mutex::new(Vec::new()),
        }
    }

    pub fn facade_key(&self) -> (u32, Ipv4Addr, u16) {
        (self.svc_set_id, self.facade_addr, self.facade_port)
    }

    /// Register `server`, placing it straight into `Up` when this
    /// application has no monitor configured (it is never probed).
    pub fn add_server(&self, server: Arc<Server>) {
        if self.monitor.is_none() {
            server.set_state(ServerState::Up);
        }
        self.servers.lock().push(server);
    }

    pub fn remove_server(&self, addr: Ipv4Addr) -> Option<Arc<Server>> {
        let mut servers = self.servers.lock();
        let idx = servers.iter().position(|s| s.addr == addr)?;
        Some(servers.remove(idx))
    }

    pub fn remove_all_servers(&self) -> Vec<Arc<Server>> {
        std::mem::take(&mut *self.servers.lock())
    }

    pub fn servers(&self) -> Vec<Arc<Server>> {
        self.servers.lock().clone()
    }

    /// Least-load selection among currently `Up` servers: scan, pick the
    /// minimum-load `Up` server, and account for the new session before
    /// returning it.
    pub fn select_server(&self) -> EngineResult<Arc<Server>> {
        let servers = self.servers.lock();
        let chosen = servers
            .iter()
            .filter(|s| s.is_up())
            .min_by_key(|s| s.load())
            .cloned()
            .ok_or_else(|| EngineError::NoServersUp {
                app: self.name.clone(),
            })?;
        chosen.acquire();
        Ok(chosen)
    }
}

/// Two-way catalogue: by `(svc_set_id, app_name)` for config operations, by
/// `(svc_set_id, facade_addr, facade_port)` for the packet-time lookup
/// (`get_app_name`/`get_app_session_timeout` in the original).
#[derive(Default)]
pub struct ApplicationCatalog {
    by_name: Registry<(u32, String), Application>,
    by_facade: Registry<(u32, Ipv4Addr, u16), String>,
}

impl ApplicationCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, svc_set_id: u32, name: &str) -> Option<Arc<Application>> {
        self.by_name.get(&(svc_set_id, name.to_string()))
    }

    pub fn lookup_by_facade(&self, svc_set_id: u32, addr: Ipv4Addr, port: u16) -> Option<Arc<Application>> {
        let name = self.by_facade.get(&(svc_set_id, addr, port))?;
        self.lookup(svc_set_id, &name)
    }

    /// Every application currently registered under `svc_set_id` (used when a
    /// whole service-set is torn down and its applications must cascade too).
    pub fn apps_for_service(&self, svc_set_id: u32) -> Vec<Arc<Application>> {
        self.by_name
            .values()
            .into_iter()
            .filter(|app| app.svc_set_id == svc_set_id)
            .collect()
    }

    pub fn upsert(&self, app: Application) -> Arc<Application> {
        let app = Arc::new(app);
        let facade_key = app.facade_key();
        let name_key = (app.svc_set_id, app.name.clone());
        self.by_name.mutate(|m| {
            m.insert(name_key, app.clone());
        });
        self.by_facade.mutate(|m| {
            m.insert(facade_key, Arc::new(app.name.clone()));
        });
        app
    }

    pub fn delete(&self, svc_set_id: u32, name: &str) {
        if let Some(app) = self.lookup(svc_set_id, name) {
            let facade_key = app.facade_key();
            self.by_facade.mutate(|m| {
                m.remove(&facade_key);
            });
        }
        self.by_name.mutate(|m| {
            m.remove(&(svc_set_id, name.to_string()));
        });
    }

    /// Drop every application and facade alias, regardless of service-set.
    /// Used on a full configuration reset (`DELETE_ALL`, or a control-channel
    /// reconnect that must start the next resync from an empty catalog); the
    /// caller is responsible for cancelling any health-prober task still
    /// running against a server this wipes out.
    pub fn clear_all(&self) {
        self.by_name.mutate(|m| m.clear());
        self.by_facade.mutate(|m| m.clear());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> MonitorConfig {
        MonitorConfig {
            connection_interval_secs: 5,
            connection_timeout_secs: 2,
            timeouts_allowed: 3,
            down_retry_interval_secs: 10,
        }
    }

    #[test]
    fn select_server_picks_least_loaded_up_server() {
        let app = Application::new(1, "web", Ipv4Addr::new(10, 0, 0, 1), 80, 60, Some(monitor()));
        let a = Arc::new(Server::new(Ipv4Addr::new(10, 0, 1, 1)));
        let b = Arc::new(Server::new(Ipv4Addr::new(10, 0, 1, 2)));
        a.set_state(ServerState::Up);
        b.set_state(ServerState::Up);
        app.add_server(a.clone());
        app.add_server(b.clone());

        // Drive `a` to carry more load.
        a.acquire();
        a.acquire();

        let chosen = app.select_server().unwrap();
        assert_eq!(chosen.addr, b.addr, "b has lower load and should be chosen");
        assert_eq!(b.load(), 1);
    }

    #[test]
    fn select_server_skips_down_servers() {
        let app = Application::new(1, "web", Ipv4Addr::new(10, 0, 0, 1), 80, 60, Some(monitor()));
        let down = Arc::new(Server::new(Ipv4Addr::new(10, 0, 1, 1)));
        let up = Arc::new(Server::new(Ipv4Addr::new(10, 0, 1, 2)));
        down.set_state(ServerState::Down);
        up.set_state(ServerState::Up);
        app.add_server(down);
        app.add_server(up.clone());

        let chosen = app.select_server().unwrap();
        assert_eq!(chosen.addr, up.addr);
    }

    #[test]
    fn select_server_fails_when_none_up() {
        let app = Application::new(1, "web", Ipv4Addr::new(10, 0, 0, 1), 80, 60, Some(monitor()));
        app.add_server(Arc::new(Server::new(Ipv4Addr::new(10, 0, 1, 1))));
        assert!(matches!(app.select_server(), Err(EngineError::NoServersUp { .. })));
    }

    #[test]
    fn probe_timeout_threshold_trips_after_allowed_count() {
        let server = Server::new(Ipv4Addr::new(10, 0, 1, 1));
        assert!(!server.record_probe_timeout(3));
        assert!(!server.record_probe_timeout(3));
        assert!(server.record_probe_timeout(3), "third consecutive timeout trips the threshold");
    }

    #[test]
    fn clear_all_empties_catalog_and_facade_index() {
        let catalog = ApplicationCatalog::new();
        let app = Application::new(1, "web", Ipv4Addr::new(192, 168, 0, 1), 80, 60, None);
        catalog.upsert(app);
        assert!(catalog.lookup(1, "web").is_some());
        assert!(catalog.lookup_by_facade(1, Ipv4Addr::new(192, 168, 0, 1), 80).is_some());

        catalog.clear_all();

        assert!(catalog.lookup(1, "web").is_none());
        assert!(catalog.lookup_by_facade(1, Ipv4Addr::new(192, 168, 0, 1), 80).is_none());
    }
}
