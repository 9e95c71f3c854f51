//! jnx-flow-data: the 5-tuple flow classifier process entry point.
//!
//! # 架构定位（Where/Architecture）
//! - 启动时加载配置、创建共享的 arena/flow-table/policy-store，随后拆成三类
//!   并发任务：老化任务（周期推进时钟 + 扫描）、管理器连接任务（C7，内含
//!   60 秒重连退避与建联前 FIFO 缓冲）、以及包处理任务集（C4，从一个 MPSC
//!   通道消费数据包，真实部署中的抓包/下发路径由宿主平台决定，这里用信道替代，
//!   调用方把解析好的 IPv4 数据报 `Vec<u8>` 和入接口送进来即可）。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use flow_core::ager::Ager;
use flow_core::clock::SystemClock;
use flow_core::control::{self, ControlChannel};
use flow_core::flow_table::Direction;
use flow_core::policy::PolicyStore;
use jnx_flow::config::Config;
use jnx_flow::messages::JnxFlowMessageHandler;
use jnx_flow::worker::JnxFlowEngine;
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

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "jnx-flow.toml".into());
    let config = Config::from_path(&config_path).context("loading jnx-flow configuration")?;
    info!(path = %config_path, workers = config.worker_count, "jnx-flow starting");

    let policy = Arc::new(PolicyStore::new());
    let clock = Arc::new(SystemClock::new());
    // One extra worker slot reserved for the ager's own local free-list, so
    // its frees never contend with a packet worker's.
    let ager_worker_id = config.worker_count;
    let engine = Arc::new(JnxFlowEngine::new(
        config.arena_capacity,
        config.worker_count + 1,
        policy.clone(),
        clock.clone(),
    ));

    let (tx, rx) = mpsc::channel::<IngressPacket>(4096);
    spawn_workers(engine.clone(), rx, config.worker_count, config.default_timeout_secs);
    spawn_ager(
        engine.clone(),
        clock,
        policy.clone(),
        Duration::from_secs(config.periodic_secs),
        ager_worker_id,
    );

    let handler = Arc::new(JnxFlowMessageHandler {
        policy,
        table: engine.table.clone(),
        arena: engine.arena.clone(),
    });
    run_control_channel(config.control_listen_addr, handler).await;

    drop(tx);
    Ok(())
}

fn spawn_workers(
    engine: Arc<JnxFlowEngine<SystemClock>>,
    rx: mpsc::Receiver<IngressPacket>,
    worker_count: usize,
    default_timeout_secs: u32,
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
                let Some(packet) = packet else { break };
                match engine.process_packet(worker_id, &packet.data, packet.iif, packet.direction, default_timeout_secs) {
                    Ok(_action) => {}
                    Err(err) => warn!(worker_id, %err, "packet classification failed"),
                }
            }
        });
    }
}

fn spawn_ager(
    engine: Arc<JnxFlowEngine<SystemClock>>,
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
/// [`control::RECONNECT_INTERVAL`] backoff, and dispatch every inbound frame
/// through `handler`.
async fn run_control_channel(addr: std::net::SocketAddr, handler: Arc<JnxFlowMessageHandler>) {
    let mut channel = ControlChannel::new();
    loop {
        channel.mark_connecting();
        match TcpStream::connect(addr).await {
            Ok(mut stream) => {
                channel.mark_established();
                info!(%addr, "control channel established");
                loop {
                    match control::read_frame(&mut stream).await {
                        Ok(frame) => {
                            let response = handler.handle(&frame);
                            if let Err(err) = control::write_frame(&mut stream, &response).await {
                                error!(%err, "failed writing control response");
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(%err, "control channel read failed, reconnecting");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(%err, %addr, "control channel connect failed");
            }
        }
        channel.mark_disconnected();
        tokio::time::sleep(control::RECONNECT_INTERVAL).await;
    }
}
