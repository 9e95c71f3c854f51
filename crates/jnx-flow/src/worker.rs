//! C4 — Packet worker, jnx-flow's ALLOW/DROP variant.
//!
//! # 设计背景（Why）
//! - 快路径：5 元组命中既有会话时直接返回缓存的 `flow_action`，不重新走规则匹配，
//!   即先查哈希表，未命中才落到规则匹配的慢路径。
//! - 慢路径对新会话做一次规则匹配，随后把结果（ALLOW 或 DROP）连同正反两个方向的
//!   `FlowEntry` 一起写入流表：即使规则判定是 DROP，后续同一 5 元组的报文也要走
//!   快路径直接丢弃，而不必每个包都重新匹配规则一遍。
//! - 未命中任何 `ServiceSet`、或命中 `ServiceSet` 但没有规则匹配，默认判定为 DROP
//!   （显式允许策略优先于隐式放行，没有默认放行）。
//!
//! # 契约说明（What）
//! - [`JnxFlowEngine::process_packet`] 是每个 worker 线程调用的唯一入口；
//! - 非首分片只能走 [`flow_core::flow_table::FlowTable::lookup_fragment`]，找不到
//!   匹配会话即视为格式错误（首分片必须先于非首分片到达并建立会话）。

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use flow_core::arena::{Slab, SlotIndex};
use flow_core::clock::Clock;
use flow_core::error::{EngineError, EngineResult};
use flow_core::flow_table::{Action, Direction, FlowEntry, FlowKey, FlowStatus, FlowTable, ServiceDiscriminator};
use flow_core::packet::Ipv4View;
use flow_core::policy::{PolicyStore, RuleDirection, ServiceSetKind};

pub struct JnxFlowEngine<C: Clock> {
    pub arena: Arc<Slab<FlowEntry>>,
    pub table: Arc<FlowTable>,
    pub policy: Arc<PolicyStore>,
    pub clock: Arc<C>,
}

impl<C: Clock> JnxFlowEngine<C> {
    pub fn new(capacity: usize, worker_count: usize, policy: Arc<PolicyStore>, clock: Arc<C>) -> Self {
        Self {
            arena: Arc::new(Slab::new("jnx-flow-entry", capacity, worker_count)),
            table: Arc::new(FlowTable::new()),
            policy,
            clock,
        }
    }

    /// Classify one IPv4 datagram arriving on interface `iif`, returning the
    /// action to apply (ALLOW: forward, DROP: discard).
    pub fn process_packet(
        &self,
        worker_id: usize,
        data: &[u8],
        iif: u32,
        direction: Direction,
        default_timeout_secs: u32,
    ) -> EngineResult<Action> {
        let view = Ipv4View::parse(data)?;
        let discriminator = ServiceDiscriminator::Interface(iif);
        let bytes = u64::from(view.total_len);

        if view.is_fragment() && !view.is_first_fragment() {
            let probe_key = self.probe_key(view.src_addr, view.dst_addr, discriminator);
            return match self.table.lookup_fragment(&self.arena, &probe_key, view.ip_id) {
                Some(slot) => Ok(self.hit(slot, bytes)),
                None => Err(EngineError::MalformedPacket(
                    "non-first fragment arrived before its session was established",
                )),
            };
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

        if let Some(slot) = self.table.lookup(&self.arena, &key) {
            return Ok(self.hit(slot, bytes));
        }

        self.slow_path(worker_id, key, direction, view.ip_id, bytes, default_timeout_secs)
    }

    fn probe_key(&self, src_addr: Ipv4Addr, dst_addr: Ipv4Addr, service: ServiceDiscriminator) -> FlowKey {
        FlowKey {
            src_addr,
            dst_addr,
            src_port: 0,
            dst_port: 0,
            proto: 0,
            service,
        }
    }

    fn hit(&self, slot: SlotIndex, bytes: u64) -> Action {
        let now = self.clock.now();
        self.arena
            .get(slot, |entry| {
                entry.touch(now);
                match entry.action {
                    Action::Allow => entry.stats.add_in(bytes),
                    Action::Drop => entry.stats.add_dropped(bytes),
                }
                entry.action
            })
            .unwrap_or(Action::Drop)
    }

    fn slow_path(
        &self,
        worker_id: usize,
        key: FlowKey,
        direction: Direction,
        ip_id: u16,
        bytes: u64,
        default_timeout_secs: u32,
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

        let (action, service_set_id, rule_id, egress_subunit) = match &set {
            Some(set) => {
                let src = u32::from(key.src_addr);
                let dst = u32::from(key.dst_addr);
                match self
                    .policy
                    .match_rule(set, rule_direction, src, dst, key.proto, key.src_port, key.dst_port)
                {
                    Some(rule) => (rule.action, set.id, rule.id, set.oif),
                    None => (Action::Drop, set.id, 0, set.oif),
                }
            }
            None => (Action::Drop, 0, 0, None),
        };

        // A rival worker may have installed this exact key while we were
        // still matching rules; if it already reached UP, ride its verdict
        // instead of racing a second entry into the same bucket.
        if let Some(winner) = self.table.lookup(&self.arena, &key) {
            let winner_action = self.arena.get(winner, |e| e.action).unwrap_or(Action::Drop);
            return Ok(winner_action);
        }

        let rev_key = key.swapped();
        let rev_direction = match direction {
            Direction::Input => Direction::Output,
            Direction::Output => Direction::Input,
            Direction::Any => Direction::Any,
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
        let fwd_entry = FlowEntry::new(key, action, direction, service_set_id, rule_id, egress_subunit, now, default_timeout_secs);
        let fwd_slot = self.arena.allocate(worker_id, fwd_entry)?;
        self.table.insert(&self.arena, fwd_slot);

        let rev_entry = FlowEntry::new(rev_key, action, rev_direction, service_set_id, rule_id, egress_subunit, now, default_timeout_secs);
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
            e.fragment_group.store(u32::from(ip_id), Ordering::Relaxed);
        });
        self.arena.get(rev_slot, |e| {
            *e.status.lock() = FlowStatus::Up;
            *e.reverse.lock() = fwd_slot;
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

        match action {
            Action::Allow => self.arena.get(fwd_slot, |e| e.stats.add_in(bytes)),
            Action::Drop => self.arena.get(fwd_slot, |e| e.stats.add_dropped(bytes)),
        };

        Ok(action)
    }
}
