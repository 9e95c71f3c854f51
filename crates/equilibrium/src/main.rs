//! equilibrium-data: the HTTP reverse-proxy load balancer process entry point.
//!
//! # 架构定位（Where/Architecture）
//! - 与 `jnx-flow-data` 共用同一套启动骨架（加载配置 → 建共享 arena/flow-table/
//!   policy-store → 拆分老化/管理器连接/包处理三类并发任务），额外多出两块：
//!   这个变种独有的 `ApplicationCatalog`（C6 健康探测器按 `CONF_SERVER` 消息
//!   动态为每台服务器派生探测任务，见 [`equilibrium::messages::EquilibriumMessageHandler::handle_conf_server`]），
//!   以及一条从健康探测器/周期任务流向管理器的出站事件通道
//!   （`SERVER_UPDATE`/`STATUS_UPDATE`）。
//! - 数据包来源同样由宿主平台决定，这里用一个 MPSC 通道替代：调用方把解析好的
//!   IPv4 数据报 `Vec<u8>`、入接口和方向送进来即可。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use equilibrium::config::Config;
use equilibrium::messages::EquilibriumMessageHandler;
use equilibrium::server::ApplicationCatalog;
use equilibrium::worker::EquilibriumEngine;
use flow_core::ager::Ager;
use flow_core::clock::SystemClock;
use flow_core::control::{self, ControlChannel, Frame};
use flow_core::flow_table::Direction;
use flow_core::policy::PolicyStore;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// One packet arriving on an interface, queued for a worker task.
pub struct IngressPacket {
    pub data: Vec<u8>,
    pub iif: u32,
    pub direction: Direction,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "equilibrium.toml".into());
    let config = Config::from_path(&config_path).context("loading equilibrium configuration")?;
    info!(path = %config_path, workers = config.worker_count, "equilibrium starting");

    let policy = Arc::new(PolicyStore::new());
    let catalog = Arc::new(ApplicationCatalog::new());
    let clock = Arc::new(SystemClock::new());
    // One extra worker slot reserved for the ager's own local free-list, so
    // its frees never contend with a packet worker's.
    let ager_worker_id = config.worker_count;
    let engine = Arc::new(EquilibriumEngine::new(
        config.arena_capacity,
        config.worker_count + 1,
        policy.clone(),
        catalog.clone(),
        clock.clone(),
    ));

    let (tx, rx) = mpsc::channel::<IngressPacket>(4096);
    spawn_workers(engine.clone(), rx, config.worker_count, config.timeout_policy());
    spawn_ager(
        engine.clone(),
        clock,
        policy.clone(),
        Duration::from_secs(config.periodic_secs),
        ager_worker_id,
    );

    // Unbounded: a `SERVER_UPDATE`/`STATUS_UPDATE` push is dropped with the
    // control channel (never queued indefinitely) only when the process is
    // shutting down, at which point there is nobody left to deliver it to.
    let (events_tx, events_rx) = mpsc::unbounded_channel::<Frame>();
    let handler = Arc::new(EquilibriumMessageHandler {
        policy,
        table: engine.table.clone(),
        arena: engine.arena.clone(),
        catalog,
        events: events_tx,
        probe_port: config.probe_port,
        probes: dashmap::DashMap::new(),
    });
    run_control_channel(config.control_listen_addr, handler, events_rx).await;

    drop(tx);
    Ok(())
}

fn spawn_workers(
    engine: Arc<EquilibriumEngine<SystemClock>>,
    rx: mpsc::Receiver<IngressPacket>,
    worker_count: usize,
    timeouts: equilibrium::worker::TimeoutPolicy,
) {
    // A single shared receiver, wrapped so every worker task can pull the
    // next packet; this spreads arrivals across workers without a specific
    // interface-to-worker pinning scheme.
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    for worker_id in 0..worker_count.max(1) {
        let engine = engine.clone();
        let rx = rx.clone();
        tokio::spawn(async move {
            loop {
                let packet = { rx.lock().await.recv().await };
                let Some(mut packet) = packet else { break };
                match engine.process_packet(worker_id, &mut packet.data, packet.iif, packet.direction, timeouts) {
                    Ok(_action) => {}
                    Err(err) => warn!(worker_id, %err, "packet classification failed"),
                }
            }
        });
    }
}

fn spawn_ager(
    engine: Arc<EquilibriumEngine<SystemClock>>,
    clock: Arc<SystemClock>,
    policy: Arc<PolicyStore>,
    period: Duration,
    ager_worker_id: usize,
) {
    tokio::spawn(async move {
        let ager = Ager::new(clock.clone(), engine.table.clone(), engine.arena.clone(), policy, ager_worker_id);
        let mut ticker = tokio::time::interval(period);
        let period_secs = period.as_secs().max(1);
        loop {
            ticker.tick().await;
            clock.tick(period_secs);
            let stats = ager.sweep_once();
            if stats.expired > 0 {
                info!(expired = stats.expired, freed = stats.freed, "ager sweep");
            }
        }
    });
}

/// C7 connection loop: connect out to the manager, retry on failure with
/// [`control::RECONNECT_INTERVAL`] backoff, dispatch every inbound frame
/// through `handler`, and forward any outbound `SERVER_UPDATE`/`STATUS_UPDATE`
/// frame while ESTABLISHED. Events that arrive while `Connecting`/
/// `Disconnected` are buffered in `channel`'s pending FIFO and replayed, in
/// order, right after the next `mark_established`.
///
/// Every transition into `Disconnected` — a failed connect, a read error, a
/// write error on either the response or health/status path — also calls
/// [`EquilibriumMessageHandler::reset_configuration`], so the next connection
/// attempt starts from an empty `PolicyStore`/`ApplicationCatalog` ready for
/// the manager's full resync rather than serving traffic against stale
/// configuration for however long the manager stays unreachable.
async fn run_control_channel(addr: std::net::SocketAddr, handler: Arc<EquilibriumMessageHandler>, mut events_rx: mpsc::UnboundedReceiver<Frame>) {
    let mut channel = ControlChannel::new();
    loop {
        channel.mark_connecting();
        // Anything queued by a health prober while we were disconnected
        // arrived on `events_rx`, not in `channel`'s own FIFO yet; pull it
        // over before we decide what to replay.
        while let Ok(event) = events_rx.try_recv() {
            channel.enqueue(event);
        }

        match TcpStream::connect(addr).await {
            Ok(mut stream) => {
                channel.mark_established();
                info!(%addr, "control channel established");

                let mut disconnected = false;
                for event in channel.drain_pending() {
                    if let Err(err) = control::write_frame(&mut stream, &event).await {
                        error!(%err, "failed replaying buffered event after reconnect");
                        disconnected = true;
                        break;
                    }
                }

                while !disconnected {
                    tokio::select! {
                        frame = control::read_frame(&mut stream) => {
                            match frame {
                                Ok(frame) => {
                                    let response = handler.handle(&frame);
                                    if let Err(err) = control::write_frame(&mut stream, &response).await {
                                        error!(%err, "failed writing control response");
                                        disconnected = true;
                                    }
                                }
                                Err(err) => {
                                    warn!(%err, "control channel read failed, reconnecting");
                                    disconnected = true;
                                }
                            }
                        }
                        Some(event) = events_rx.recv() => {
                            if let Err(err) = control::write_frame(&mut stream, &event).await {
                                error!(%err, "failed writing health/status event, reconnecting");
                                disconnected = true;
                            }
                        }
                    }
                }
            }
            Err(err) => {
                warn!(%err, %addr, "control channel connect failed");
            }
        }
        channel.mark_disconnected();
        // A dropped or never-established control channel means the manager
        // may resync us from scratch once it's back; starting the next
        // connection attempt with stale ServiceSet/Rule/Application/Server
        // config (and the sessions built from it) would leave the data side
        // serving traffic against configuration the manager no longer has.
        handler.reset_configuration();
        tokio::time::sleep(control::RECONNECT_INTERVAL).await;
    }
}
