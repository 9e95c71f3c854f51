//! C4 — Packet worker, equilibrium's rewrite variant.
//!
//! # 设计背景（Why）
//! - 与 jnx-flow 的 ALLOW/DROP 变体共用同一套 C1/C2/C5 基础设施，但慢路径的判定
//!   依据不同：这里不是规则匹配，而是按 `(service_set, facade_addr, facade_port)`
//!   找到 [`crate::server::Application`]，再用 [`crate::server::Application::select_server`]
//!   选出负载最小的 Up 服务器。
//! - 命中快路径时不重新选择服务器：转发方向把目的地址从 facade 改写成已经选定的
//!   后端地址，回程方向把源地址从后端地址改写回 facade 地址，客户端全程只看到
//!   facade，这是一个反向代理最基本的不变量。地址只有 4 字节会变，按 RFC 1624
//!   增量调整 IP 首部校验和与（如果存在）TCP/UDP 校验和，不必重算整包。
//! - 未找到 `Application` 时视为配置缺失，按 DROP 缓存一个 300s 的
//!   "non-application" 占位条目（直到操作员下发配置变更）；找到了 `Application`
//!   但没有 Up 服务器时同样缓存一个 DROP 占位条目，只是超时缩短到 60s，因为
//!   服务器健康状态会随探测结果频繁翻转，用更短的超时让后续报文更快重新尝试选择。
//!
//! # 契约说明（What）
//! - [`EquilibriumEngine::process_packet`] 是每个 worker 线程的唯一入口，`data`
//!   是可变切片：ALLOW 判定会就地改写目的/源地址和校验和；
//! - 非首分片复用首分片已经缓存的改写决策（`fragment_group`），本身不重新选择服务器。

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use flow_core::arena::{Slab, SlotIndex};
use flow_core::clock::Clock;
use flow_core::error::{EngineError, EngineResult};
use flow_core::flow_table::{Action, Direction, FlowEntry, FlowKey, FlowStatus, FlowTable, ServiceDiscriminator};
use flow_core::packet::Ipv4View;
use flow_core::policy::{PolicyStore, RuleDirection, ServiceSetKind};

use crate::checksum;
use crate::server::ApplicationCatalog;

/// The three timeout tiers `aging_cleanup()` distinguished by sentinel
/// facade address in the original (`faddr==0` for non-application,
/// `faddr==(in_addr_t)-1` for all-servers-down); here each `FlowEntry`
/// simply carries its own `timeout_secs`, chosen by the slow path from one
/// of these three values instead of encoding it in the facade address.
#[derive(Clone, Copy, Debug)]
pub struct TimeoutPolicy {
    /// Applied when a rule matched directly (bypassing application lookup
    /// entirely, same as `jnx-flow`'s uniform per-process timeout).
    pub rule_match_secs: u32,
    /// "Non-application" placeholder: no rule matched and no application's
    /// facade matched the packet's destination.
    pub non_application_secs: u32,
    /// "All-servers-down" placeholder: an application matched but had no
    /// `Up` server to select.
    pub all_servers_down_secs: u32,
}

pub struct EquilibriumEngine<C: Clock> {
    pub arena: Arc<Slab<FlowEntry>>,
    pub table: Arc<FlowTable>,
    pub policy: Arc<PolicyStore>,
    pub catalog: Arc<ApplicationCatalog>,
    pub clock: Arc<C>,
}

impl<C: Clock> EquilibriumEngine<C> {
    pub fn new(
        capacity: usize,
        worker_count: usize,
        policy: Arc<PolicyStore>,
        catalog: Arc<ApplicationCatalog>,
        clock: Arc<C>,
    ) -> Self {
        Self {
            arena: Arc::new(Slab::new("equilibrium-entry", capacity, worker_count)),
            table: Arc::new(FlowTable::new()),
            policy,
            catalog,
            clock,
        }
    }

    /// Classify and, on ALLOW, rewrite one IPv4 datagram arriving on
    /// interface `iif`. `data` is mutated in place when the verdict is
    /// `Allow`; a `Drop` verdict leaves `data` untouched.
    pub fn process_packet(
        &self,
        worker_id: usize,
        data: &mut [u8],
        iif: u32,
        direction: Direction,
        timeouts: TimeoutPolicy,
    ) -> EngineResult<Action> {
        let (key, ip_id, bytes, offsets) = {
            let view = Ipv4View::parse(data)?;
            let discriminator = ServiceDiscriminator::Interface(iif);
            let bytes = u64::from(view.total_len);

            if view.is_fragment() && !view.is_first_fragment() {
                let probe_key = FlowKey {
                    src_addr: view.src_addr,
                    dst_addr: view.dst_addr,
                    src_port: 0,
                    dst_port: 0,
                    proto: 0,
                    service: discriminator,
                };
                let offsets = RewriteOffsets::from_view(&view);
                let ip_id = view.ip_id;
                drop(view);
                let slot = self
                    .table
                    .lookup_fragment(&self.arena, &probe_key, ip_id)
                    .ok_or(EngineError::MalformedPacket(
                        "non-first fragment arrived before its session was established",
                    ))?;
                return self.hit(slot, data, bytes, offsets);
            }

            let (src_port, dst_port) = view
                .ports()
                .ok_or(EngineError::MalformedPacket("missing transport ports for first fragment"))?;
            let key = FlowKey {
                src_addr: view.src_addr,
                dst_addr: view.dst_addr,
                src_port,
                dst_port,
                proto: view.proto,
                service: discriminator,
            };
            let offsets = RewriteOffsets::from_view(&view);
            (key, view.ip_id, bytes, offsets)
        };

        if let Some(slot) = self.table.lookup(&self.arena, &key) {
            return self.hit(slot, data, bytes, offsets);
        }

        self.slow_path(worker_id, data, key, direction, ip_id, bytes, offsets, timeouts)
    }

    /// Apply the cached verdict for an already-classified flow.
    fn hit(&self, slot: SlotIndex, data: &mut [u8], bytes: u64, offsets: RewriteOffsets) -> EngineResult<Action> {
        let now = self.clock.now();
        let snapshot = self
            .arena
            .get(slot, |entry| {
                entry.touch(now);
                (entry.action, entry.direction, *entry.facade_addr.lock(), *entry.reverse.lock())
            })
            .ok_or(EngineError::MalformedPacket("flow entry vanished between lookup and hit"))?;
        let (action, direction, facade_addr, reverse) = snapshot;

        if action == Action::Drop {
            self.arena.get(slot, |e| e.stats.add_dropped(bytes));
            return Ok(Action::Drop);
        }

        match direction {
            Direction::Output => {
                let facade = facade_addr.ok_or(EngineError::MalformedPacket("forward entry missing facade address"))?;
                let backend = self
                    .arena
                    .get(reverse, |e| e.key.src_addr)
                    .ok_or(EngineError::MalformedPacket("reverse entry vanished for forward leg"))?;
                offsets.rewrite(data, 16, facade, backend);
            }
            Direction::Input => {
                let facade = facade_addr.ok_or(EngineError::MalformedPacket("reverse entry missing facade address"))?;
                let backend = self
                    .arena
                    .get(slot, |e| e.key.src_addr)
                    .ok_or(EngineError::MalformedPacket("flow entry vanished while reading backend address"))?;
                offsets.rewrite(data, 12, backend, facade);
            }
            Direction::Any => {}
        }

        self.arena.get(slot, |e| e.stats.add_in(bytes));
        Ok(Action::Allow)
    }

    /// A unified slow path: a direct rule match (on either
    /// service) wins outright and terminates the walk, exactly like
    /// `jnx-flow`; only when no rule matched does this variant fall through
    /// to application/backend selection, installing one of the three
    /// placeholder-or-matched timeout tiers described by [`TimeoutPolicy`].
    fn slow_path(
        &self,
        worker_id: usize,
        data: &mut [u8],
        key: FlowKey,
        direction: Direction,
        ip_id: u16,
        bytes: u64,
        offsets: RewriteOffsets,
        timeouts: TimeoutPolicy,
    ) -> EngineResult<Action> {
        let iif = match key.service {
            ServiceDiscriminator::Interface(id) => id,
            ServiceDiscriminator::Nexthop(id) => id,
        };
        let set = self.policy.service_set_by_composite((ServiceSetKind::Interface, iif));

        let rule_direction = match direction {
            Direction::Input => RuleDirection::Input,
            Direction::Output => RuleDirection::Output,
            Direction::Any => RuleDirection::Any,
        };
        let rule_match = set.as_ref().and_then(|set| {
            let src = u32::from(key.src_addr);
            let dst = u32::from(key.dst_addr);
            self.policy
                .match_rule(set, rule_direction, src, dst, key.proto, key.src_port, key.dst_port)
        });

        let (action, service_set_id, rule_id, egress_subunit, backend_addr, timeout_secs);
        if let Some(rule) = rule_match {
            let set = set.as_ref().expect("rule_match only returns Some when set is Some");
            action = rule.action;
            service_set_id = set.id;
            rule_id = rule.id;
            egress_subunit = set.oif;
            backend_addr = None;
            timeout_secs = timeouts.rule_match_secs;
        } else {
            let app = set
                .as_ref()
                .and_then(|set| self.catalog.lookup_by_facade(set.id, key.dst_addr, key.dst_port));
            match (&set, &app) {
                (Some(set), Some(app)) => match app.select_server() {
                    Ok(server) => {
                        action = Action::Allow;
                        service_set_id = set.id;
                        rule_id = 0;
                        egress_subunit = set.oif;
                        backend_addr = Some(server.addr);
                        timeout_secs = u32::from(app.session_timeout_secs);
                    }
                    Err(EngineError::NoServersUp { app: app_name }) => {
                        tracing::warn!(app = %app_name, "no servers up, installing all-servers-down placeholder");
                        action = Action::Drop;
                        service_set_id = set.id;
                        rule_id = 0;
                        egress_subunit = set.oif;
                        backend_addr = None;
                        timeout_secs = timeouts.all_servers_down_secs;
                    }
                    Err(other) => return Err(other),
                },
                _ => {
                    action = Action::Drop;
                    service_set_id = set.as_ref().map(|s| s.id).unwrap_or(0);
                    rule_id = 0;
                    egress_subunit = set.as_ref().and_then(|s| s.oif);
                    backend_addr = None;
                    timeout_secs = timeouts.non_application_secs;
                }
            }
        }

        // A rival worker may have installed this exact key while we were
        // still selecting a backend; if it already reached UP, ride its
        // cached rewrite instead of racing a second entry into the same
        // bucket.
        if let Some(winner) = self.table.lookup(&self.arena, &key) {
            return self.hit(winner, data, bytes, offsets);
        }

        let rev_direction = match direction {
            Direction::Input => Direction::Output,
            Direction::Output => Direction::Input,
            Direction::Any => Direction::Any,
        };
        let rev_key = match backend_addr {
            Some(backend) => FlowKey {
                src_addr: backend,
                dst_addr: key.src_addr,
                src_port: key.dst_port,
                dst_port: key.src_port,
                proto: key.proto,
                service: key.service,
            },
            None => key.swapped(),
        };

        // The other leg of this session may already be live, installed by
        // the worker that classified the reverse-direction packet first; it
        // is now stale relative to the session we are about to build, so
        // mark the stale entry DOWN and drop this packet instead of
        // cross-linking against it.
        if let Some(stale_reverse) = self.table.lookup(&self.arena, &rev_key) {
            self.arena.get(stale_reverse, |e| *e.status.lock() = FlowStatus::Down);
            return Ok(Action::Drop);
        }

        let now = self.clock.now();
        let facade_addr = key.dst_addr;
        let fwd_entry = FlowEntry::new(key, action, direction, service_set_id, rule_id, egress_subunit, now, timeout_secs);
        let fwd_slot = self.arena.allocate(worker_id, fwd_entry)?;
        self.table.insert(&self.arena, fwd_slot);

        let rev_entry = FlowEntry::new(rev_key, action, rev_direction, service_set_id, rule_id, egress_subunit, now, timeout_secs);
        let rev_slot = match self.arena.allocate(worker_id, rev_entry) {
            Ok(slot) => slot,
            Err(err) => {
                // Fail-safe: the forward leg is already linked into the
                // table; mark it DELETE so the ager reclaims it instead of
                // leaving a half-built session with no reverse leg.
                self.arena.get(fwd_slot, |e| *e.status.lock() = FlowStatus::Delete);
                return Err(err);
            }
        };

        self.arena.get(fwd_slot, |e| {
            *e.status.lock() = FlowStatus::Up;
            *e.reverse.lock() = rev_slot;
            *e.facade_addr.lock() = Some(facade_addr);
            e.fragment_group.store(u32::from(ip_id), Ordering::Relaxed);
        });
        self.arena.get(rev_slot, |e| {
            *e.status.lock() = FlowStatus::Up;
            *e.reverse.lock() = fwd_slot;
            *e.facade_addr.lock() = Some(facade_addr);
            e.fragment_group.store(u32::from(ip_id), Ordering::Relaxed);
        });
        self.table.insert(&self.arena, rev_slot);

        if let Some(set) = &set {
            set.counters.total_flow_count.fetch_add(2, Ordering::Relaxed);
            set.counters.active_flow_count.fetch_add(2, Ordering::Relaxed);
            if rule_id != 0 {
                set.counters.applied_rule_count.fetch_add(1, Ordering::Relaxed);
            }
        }

        match (action, backend_addr) {
            (Action::Allow, Some(backend)) => {
                offsets.rewrite(data, 16, facade_addr, backend);
                self.arena.get(fwd_slot, |e| e.stats.add_in(bytes));
            }
            _ => {
                self.arena.get(fwd_slot, |e| e.stats.add_dropped(bytes));
            }
        }

        Ok(action)
    }
}

/// Byte offsets needed to rewrite an address and its dependent checksums,
/// captured while the immutable [`Ipv4View`] borrow is still alive so the
/// caller can drop it and re-borrow `data` mutably.
#[derive(Clone, Copy)]
struct RewriteOffsets {
    ip_checksum_offset: usize,
    transport_checksum_offset: Option<usize>,
}

impl RewriteOffsets {
    fn from_view(view: &Ipv4View<'_>) -> Self {
        Self {
            ip_checksum_offset: view.ip_header_checksum_offset(),
            transport_checksum_offset: view.transport_checksum_offset(),
        }
    }

    /// Rewrite the 4-byte address at `addr_offset` (12 = source, 16 =
    /// destination) from `old` to `new`, incrementally adjusting the IP
    /// header checksum and, if present, the transport checksum.
    fn rewrite(&self, data: &mut [u8], addr_offset: usize, old: Ipv4Addr, new: Ipv4Addr) {
        let old_word = u32::from(old);
        let new_word = u32::from(new);

        let ip_off = self.ip_checksum_offset;
        let old_ip_csum = u16::from_be_bytes([data[ip_off], data[ip_off + 1]]);
        let new_ip_csum = checksum::adjust_addr(old_ip_csum, old_word, new_word);
        data[ip_off..ip_off + 2].copy_from_slice(&new_ip_csum.to_be_bytes());

        data[addr_offset..addr_offset + 4].copy_from_slice(&new.octets());

        if let Some(t_off) = self.transport_checksum_offset {
            let old_t_csum = u16::from_be_bytes([data[t_off], data[t_off + 1]]);
            let new_t_csum = checksum::adjust_addr(old_t_csum, old_word, new_word);
            data[t_off..t_off + 2].copy_from_slice(&new_t_csum.to_be_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Application, MonitorConfig, Server, ServerState};
    use flow_core::clock::ManualClock;
    use flow_core::policy::{ServiceSetAttrs, ServiceSetKind};

    fn tcp_packet(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 40];
        buf[0] = 0x45;
        buf[2..4].copy_from_slice(&40u16.to_be_bytes());
        buf[4..6].copy_from_slice(&7u16.to_be_bytes());
        buf[9] = flow_core::packet::PROTO_TCP;
        buf[12..16].copy_from_slice(&src);
        buf[16..20].copy_from_slice(&dst);
        buf[20..22].copy_from_slice(&sport.to_be_bytes());
        buf[22..24].copy_from_slice(&dport.to_be_bytes());
        buf
    }

    fn monitor() -> MonitorConfig {
        MonitorConfig {
            connection_interval_secs: 5,
            connection_timeout_secs: 2,
            timeouts_allowed: 3,
            down_retry_interval_secs: 10,
        }
    }

    fn timeouts() -> TimeoutPolicy {
        TimeoutPolicy {
            rule_match_secs: 20,
            non_application_secs: 300,
            all_servers_down_secs: 60,
        }
    }

    fn make_engine() -> (EquilibriumEngine<ManualClock>, Arc<PolicyStore>, Arc<ApplicationCatalog>) {
        let policy = Arc::new(PolicyStore::new());
        policy
            .service_set_add(ServiceSetAttrs {
                id: 1,
                name: "ss1".into(),
                kind: ServiceSetKind::Interface,
                iif: None,
                oif: Some(5),
            })
            .unwrap();
        let catalog = Arc::new(ApplicationCatalog::new());
        let engine = EquilibriumEngine::new(64, 1, policy.clone(), catalog.clone(), Arc::new(ManualClock::new()));
        (engine, policy, catalog)
    }

    #[test]
    fn allow_rewrites_destination_to_selected_backend() {
        let (engine, _policy, catalog) = make_engine();
        let app = Application::new(1, "web", Ipv4Addr::new(192, 168, 0, 1), 80, 60, monitor());
        let server = Arc::new(Server::new(Ipv4Addr::new(10, 0, 1, 1)));
        server.set_state(ServerState::Up);
        app.add_server(server.clone());
        catalog.upsert(app);

        let mut pkt = tcp_packet([10, 0, 0, 1], [192, 168, 0, 1], 40000, 80);
        let action = engine.process_packet(0, &mut pkt, 1, Direction::Output, timeouts()).unwrap();
        assert_eq!(action, Action::Allow);
        assert_eq!(&pkt[16..20], &[10, 0, 1, 1]);
    }

    #[test]
    fn missing_application_defaults_to_drop_and_is_cached() {
        let (engine, _policy, _catalog) = make_engine();
        let mut pkt = tcp_packet([10, 0, 0, 1], [192, 168, 0, 1], 40000, 80);
        let original = pkt.clone();
        let action = engine.process_packet(0, &mut pkt, 1, Direction::Output, timeouts()).unwrap();
        assert_eq!(action, Action::Drop);
        assert_eq!(pkt, original, "dropped packets are left untouched");

        let action2 = engine.process_packet(0, &mut pkt, 1, Direction::Output, timeouts()).unwrap();
        assert_eq!(action2, Action::Drop);
    }

    #[test]
    fn no_servers_up_installs_short_lived_drop_placeholder() {
        let (engine, _policy, catalog) = make_engine();
        let app = Application::new(1, "web", Ipv4Addr::new(192, 168, 0, 1), 80, 60, monitor());
        app.add_server(Arc::new(Server::new(Ipv4Addr::new(10, 0, 1, 1))));
        catalog.upsert(app);

        let mut pkt = tcp_packet([10, 0, 0, 1], [192, 168, 0, 1], 40000, 80);
        let action = engine.process_packet(0, &mut pkt, 1, Direction::Output, timeouts()).unwrap();
        assert_eq!(action, Action::Drop);
        let slot = engine
            .table
            .lookup(
                &engine.arena,
                &FlowKey {
                    src_addr: Ipv4Addr::new(10, 0, 0, 1),
                    dst_addr: Ipv4Addr::new(192, 168, 0, 1),
                    src_port: 40000,
                    dst_port: 80,
                    proto: 6,
                    service: ServiceDiscriminator::Interface(1),
                },
            )
            .expect("an all-servers-down placeholder is cached so the next packet takes the fast path");
        engine.arena.get(slot, |e| {
            assert_eq!(e.timeout_secs, timeouts().all_servers_down_secs);
        });
    }

    #[test]
    fn reverse_leg_rewrites_source_back_to_facade() {
        let (engine, _policy, catalog) = make_engine();
        let app = Application::new(1, "web", Ipv4Addr::new(192, 168, 0, 1), 80, 60, monitor());
        let server = Arc::new(Server::new(Ipv4Addr::new(10, 0, 1, 1)));
        server.set_state(ServerState::Up);
        app.add_server(server.clone());
        catalog.upsert(app);

        let mut fwd = tcp_packet([10, 0, 0, 1], [192, 168, 0, 1], 40000, 80);
        engine.process_packet(0, &mut fwd, 1, Direction::Output, timeouts()).unwrap();

        let mut rev = tcp_packet([10, 0, 1, 1], [10, 0, 0, 1], 80, 40000);
        let action = engine.process_packet(0, &mut rev, 1, Direction::Input, timeouts()).unwrap();
        assert_eq!(action, Action::Allow);
        assert_eq!(&rev[12..16], &[192, 168, 0, 1], "client must see the facade address as the source");
    }
}
