//! C6 — Health prober.
//!
//! # 设计背景（Why）
//! - 每台 `Server` 有一个独立的探测任务，状态机为：
//!   `Idle --(到期)--> Connecting --(成功)--> Up`
//!   `Connecting --(超时/拒绝)--> 计数 --(未达阈值)--> Idle`
//!   `计数达到 timeouts_allowed --> Down/BackingOff --(down_retry_interval)--> Connecting`。
//! - 每服务器一个 `tokio::spawn` 任务、`tokio::time::timeout` 包裹连接尝试。
//! - 探测不是裸连接，是发一条最简 `GET / HTTP/1.1` 并确认响应以 `"HTTP"` 开头；
//!   下线转换还要顺带把该服务器名下的会话清空（见 [`crate::clear::clear_for_server`]）
//!   并把负载计数清零（[`Server::reset_load`]），否则它的槽位一旦恢复就会带着
//!   陈旧负载重新参与最小负载选择。

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use flow_core::arena::Slab;
use flow_core::control::Frame;
use flow_core::flow_table::{FlowEntry, FlowTable};
use flow_core::policy::PolicyStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::clear;
use crate::messages;
use crate::server::{MonitorConfig, Server, ServerState};

/// Everything one prober task needs to know about the server it watches and
/// the application it belongs to (the latter only to fill in the `app_addr`/
/// `app_port`/`svc_set_id` fields of the `SERVER_UPDATE` frames it emits).
#[derive(Clone)]
pub struct ProbeTarget {
    pub server: Arc<Server>,
    pub monitor: MonitorConfig,
    pub svc_set_id: u16,
    pub app_addr: Ipv4Addr,
    pub app_port: u16,
    pub probe_port: u16,
}

const PROBE_REQUEST_PREFIX: &str = "GET / HTTP/1.1\r\nHost: ";
const HTTP_SIGNATURE: &[u8; 4] = b"HTTP";

/// Probe one server's health forever, driving its [`ServerState`] through the
/// Idle/Connecting/Up/Down/BackingOff cycle and pushing a `SERVER_UPDATE`
/// frame over `events` on every up/down transition. On a confirmed down
/// transition, also evicts every session currently routed to this server and
/// resets its load counter.
pub async fn run_health_prober(
    target: ProbeTarget,
    table: Arc<FlowTable>,
    arena: Arc<Slab<FlowEntry>>,
    policy: Arc<PolicyStore>,
    events: UnboundedSender<Frame>,
) {
    let ProbeTarget {
        server,
        monitor,
        svc_set_id,
        app_addr,
        app_port,
        probe_port,
    } = target;

    loop {
        server.set_state(ServerState::Idle);
        tokio::time::sleep(Duration::from_secs(u64::from(monitor.connection_interval_secs.max(1)))).await;

        server.set_state(ServerState::Connecting);
        let addr = SocketAddr::V4(SocketAddrV4::new(server.addr, probe_port));
        let timeout = Duration::from_secs(u64::from(monitor.connection_timeout_secs.max(1)));

        let was_up = server.is_up();
        match tokio::time::timeout(timeout, probe_once(addr, server.addr)).await {
            Ok(Ok(())) => {
                server.record_probe_success();
                debug!(%addr, "health probe succeeded");
                if !was_up {
                    emit_status(&events, svc_set_id, app_addr, app_port, server.addr, true);
                }
            }
            Ok(Err(err)) => {
                handle_probe_failure(&server, &monitor, &table, &arena, &policy, &events, svc_set_id, app_addr, app_port, addr, &err).await;
            }
            Err(_elapsed) => {
                handle_probe_failure(
                    &server,
                    &monitor,
                    &table,
                    &arena,
                    &policy,
                    &events,
                    svc_set_id,
                    app_addr,
                    app_port,
                    addr,
                    "connection attempt timed out",
                )
                .await;
            }
        }
    }
}

/// Connect, send the probe request, and confirm the response starts with
/// `"HTTP"` (`read_http_response` in the original treats anything else,
/// including a short read, as a failed probe).
async fn probe_once(addr: SocketAddr, server_addr: Ipv4Addr) -> Result<(), String> {
    let mut stream = TcpStream::connect(addr).await.map_err(|e| e.to_string())?;
    let request = format!("{PROBE_REQUEST_PREFIX}{server_addr}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.map_err(|e| e.to_string())?;

    let mut signature = [0u8; 4];
    stream.read_exact(&mut signature).await.map_err(|e| e.to_string())?;
    if &signature != HTTP_SIGNATURE {
        return Err(format!("unexpected response prefix {signature:?}"));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_probe_failure(
    server: &Arc<Server>,
    monitor: &MonitorConfig,
    table: &Arc<FlowTable>,
    arena: &Arc<Slab<FlowEntry>>,
    policy: &Arc<PolicyStore>,
    events: &UnboundedSender<Frame>,
    svc_set_id: u16,
    app_addr: Ipv4Addr,
    app_port: u16,
    addr: SocketAddr,
    reason: &str,
) {
    let tripped = server.record_probe_timeout(monitor.timeouts_allowed);
    if tripped {
        warn!(%addr, reason, "server marked down after exceeding allowed probe timeouts");
        server.set_state(ServerState::Down);
        server.reset_load();
        let freed = clear::clear_for_server(table, arena, policy, server.addr);
        info!(%addr, freed, "evicted sessions for downed server");
        emit_status(events, svc_set_id, app_addr, app_port, server.addr, false);
        tokio::time::sleep(Duration::from_secs(u64::from(monitor.down_retry_interval_secs.max(1)))).await;
        server.set_state(ServerState::BackingOff);
    } else {
        debug!(%addr, reason, "health probe failed, within allowed timeout budget");
        server.set_state(ServerState::Idle);
    }
}

/// Push a `SERVER_UPDATE` frame; the receiver side (`main.rs`'s control-channel
/// loop) is an unbounded channel, so a disconnected receiver (service
/// shutting down) just drops the send instead of panicking.
fn emit_status(events: &UnboundedSender<Frame>, svc_set_id: u16, app_addr: Ipv4Addr, app_port: u16, server_addr: Ipv4Addr, up: bool) {
    let frame = messages::server_update_frame(messages::ServerStatusPayload {
        svc_set_id,
        app_addr,
        app_port,
        server_addr,
        status: u8::from(up),
    });
    let _ = events.send(frame);
}
