//! C5 — Ager.
//!
//! # 设计背景（Why）
//! - 老化线程周期性推进一个单调刻度，并扫描整张流表，淘汰超过各自
//!   `timeout_secs` 未被触达的条目；正反两个方向的 `FlowEntry` 属于同一个会话，
//!   只有当两侧都超时才真正删除，如果只有一侧到期而另一侧仍在被触达，说明会话
//!   仍然存活（只是单向流量），这一侧应当从对侧的 `last_seen` 续期而不是被摘链、
//!   回收，否则会把仍有反向流量的会话提前杀死。
//! - 复用 C1 的 `Slab::reclaim`（把各 worker 的本地空闲链表合并回全局池）
//!   和 C2 的 `FlowTable::for_each_bucket`（老化专用的全表遍历入口，逐桶持锁）。
//!
//! # 契约说明（What）
//! - [`Ager::sweep_once`] 是一次完整的扫描：发现到期条目 → 标记 `Delete`（使并发的
//!   快路径查找立即将其视为未命中）→ 摘链 → 释放槽位 → 递减所属 `ServiceSet` 的
//!   `active_flow_count` → 级联淘汰反向条目；扫描结束后触发一次 `Slab::reclaim`。
//! - 时钟推进（`Clock::tick`，仅 [`crate::clock::SystemClock`] 暴露）由调用方的周期
//!   任务负责，`Ager` 本身只读取 [`Clock::now`]，这样测试可以用 `ManualClock` 精确
//!   控制老化发生的时间点而不依赖真实睡眠。

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::arena::{Slab, SlotIndex};
use crate::clock::Clock;
use crate::flow_table::{FlowEntry, FlowStatus, FlowTable};
use crate::policy::PolicyStore;

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepStats {
    /// 本轮扫描中被判定到期、由本方向触发淘汰的条目数。
    pub expired: u32,
    /// 本轮扫描中实际释放的槽位总数（含级联淘汰的反向条目）。
    pub freed: u32,
}

pub struct Ager<C: Clock> {
    clock: Arc<C>,
    table: Arc<FlowTable>,
    arena: Arc<Slab<FlowEntry>>,
    policy: Arc<PolicyStore>,
    worker_id: usize,
}

impl<C: Clock> Ager<C> {
    pub fn new(
        clock: Arc<C>,
        table: Arc<FlowTable>,
        arena: Arc<Slab<FlowEntry>>,
        policy: Arc<PolicyStore>,
        worker_id: usize,
    ) -> Self {
        Self {
            clock,
            table,
            arena,
            policy,
            worker_id,
        }
    }

    /// Run one full table sweep, expiring every entry whose idle time has
    /// reached its `timeout_secs`. Safe to call repeatedly from a periodic
    /// task; cheap no-op work when nothing is due.
    pub fn sweep_once(&self) -> SweepStats {
        let now = self.clock.now();

        let mut due = Vec::new();
        self.table.for_each_bucket(&self.arena, |hash, slot| {
            let is_due = self
                .arena
                .get(slot, |entry| {
                    let last = entry.last_seen.load(Ordering::Relaxed);
                    now.saturating_sub(last) >= u64::from(entry.timeout_secs)
                })
                .unwrap_or(false);
            if is_due {
                due.push((hash, slot));
            }
        });

        let mut stats = SweepStats::default();
        for (hash, slot) in due {
            if let Some(freed) = self.expire(hash, slot, now) {
                stats.expired += 1;
                stats.freed += freed;
            }
        }

        self.arena.reclaim();
        stats
    }

    /// Mark `slot` deleted, unlink it, free it, decrement its service-set's
    /// live counter, then cascade to its reverse-direction partner, but only
    /// when BOTH directions have exceeded their timeout. If the
    /// reverse leg is still alive within its own budget, this direction is
    /// spared and its `last_seen` is refreshed from the reverse instead, so a
    /// one-way-idle session doesn't get torn down out from under active
    /// traffic running the other way.
    /// Returns `None` if the slot had already been reclaimed by a racing
    /// sweep pass, or if the entry was spared and refreshed instead of freed.
    fn expire(&self, hash: u32, slot: SlotIndex, now: u64) -> Option<u32> {
        let reverse_slot = self.arena.get(slot, |entry| *entry.reverse.lock())?;

        if !reverse_slot.is_null() {
            let reverse_due = self.arena.get(reverse_slot, |entry| {
                let status = *entry.status.lock();
                if status != FlowStatus::Up {
                    return None;
                }
                let last = entry.last_seen.load(Ordering::Relaxed);
                Some(now.saturating_sub(last) >= u64::from(entry.timeout_secs))
            }).flatten();

            if reverse_due == Some(false) {
                if let Some(reverse_last_seen) = self.arena.get(reverse_slot, |e| e.last_seen.load(Ordering::Relaxed)) {
                    self.arena.get(slot, |e| e.last_seen.store(reverse_last_seen, Ordering::Relaxed));
                }
                return None;
            }
        }

        let outcome = self.arena.get(slot, |entry| {
            let mut status = entry.status.lock();
            if *status == FlowStatus::Delete {
                return None;
            }
            *status = FlowStatus::Delete;
            Some((entry.key.hash(), *entry.reverse.lock(), entry.service_set_id))
        })?;
        let (key_hash, reverse, service_set_id) = outcome?;
        debug_assert_eq!(key_hash, hash, "sweep hash must match entry's own bucket");

        self.table.unlink(&self.arena, hash, slot);
        self.arena.free(slot, self.worker_id);
        if let Some(set) = self.policy.service_set_by_id(service_set_id) {
            set.counters.active_flow_count.fetch_sub(1, Ordering::Relaxed);
        }

        let mut freed = 1;
        if !reverse.is_null() {
            freed += self.expire_linked(reverse);
        }
        Some(freed)
    }

    /// Expire a partner entry reached via `reverse`. Only called once the
    /// caller has already established both directions are due.
    fn expire_linked(&self, slot: SlotIndex) -> u32 {
        let outcome = self.arena.get(slot, |entry| {
            let mut status = entry.status.lock();
            if *status == FlowStatus::Delete {
                return None;
            }
            *status = FlowStatus::Delete;
            Some((entry.key.hash(), entry.service_set_id))
        });
        let Some(Some((hash, service_set_id))) = outcome else {
            return 0;
        };
        self.table.unlink(&self.arena, hash, slot);
        self.arena.free(slot, self.worker_id);
        if let Some(set) = self.policy.service_set_by_id(service_set_id) {
            set.counters.active_flow_count.fetch_sub(1, Ordering::Relaxed);
        }
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::flow_table::{Action, Direction, FlowKey, ServiceDiscriminator};
    use crate::policy::{ServiceSetAttrs, ServiceSetKind};
    use std::net::Ipv4Addr;

    fn key(a: u8, b: u8) -> FlowKey {
        FlowKey {
            src_addr: Ipv4Addr::new(10, 0, 0, a),
            dst_addr: Ipv4Addr::new(192, 168, 0, b),
            src_port: 40000,
            dst_port: 80,
            proto: 6,
            service: ServiceDiscriminator::Interface(1),
        }
    }

    fn setup() -> (Arc<ManualClock>, Arc<FlowTable>, Arc<Slab<FlowEntry>>, Arc<PolicyStore>) {
        let clock = Arc::new(ManualClock::new());
        let table = Arc::new(FlowTable::new());
        let arena = Arc::new(Slab::new("flow", 16, 1));
        let policy = Arc::new(PolicyStore::new());
        policy
            .service_set_add(ServiceSetAttrs {
                id: 1,
                name: "ss1".into(),
                kind: ServiceSetKind::Interface,
                iif: None,
                oif: None,
            })
            .unwrap();
        policy
            .service_set_by_id(1)
            .unwrap()
            .counters
            .active_flow_count
            .fetch_add(2, Ordering::Relaxed);
        (clock, table, arena, policy)
    }

    #[test]
    fn untouched_entry_survives_before_timeout() {
        let (clock, table, arena, policy) = setup();
        let entry = FlowEntry::new(key(1, 1), Action::Allow, Direction::Output, 1, 1, None, 0, 20);
        let slot = arena.allocate(0, entry).unwrap();
        arena.get(slot, |e| *e.status.lock() = FlowStatus::Up);
        table.insert(&arena, slot);

        let ager = Ager::new(clock.clone(), table.clone(), arena.clone(), policy, 0);
        clock.advance(19);
        let stats = ager.sweep_once();
        assert_eq!(stats.expired, 0);
        assert!(table.lookup(&arena, &key(1, 1)).is_some());
    }

    #[test]
    fn expired_entry_is_unlinked_and_freed() {
        let (clock, table, arena, policy) = setup();
        let entry = FlowEntry::new(key(1, 1), Action::Allow, Direction::Output, 1, 1, None, 0, 20);
        let slot = arena.allocate(0, entry).unwrap();
        arena.get(slot, |e| *e.status.lock() = FlowStatus::Up);
        table.insert(&arena, slot);

        let ager = Ager::new(clock.clone(), table.clone(), arena.clone(), policy.clone(), 0);
        clock.advance(20);
        let stats = ager.sweep_once();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.freed, 1);
        assert!(table.lookup(&arena, &key(1, 1)).is_none());
        assert_eq!(
            policy
                .service_set_by_id(1)
                .unwrap()
                .counters
                .active_flow_count
                .load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn reverse_direction_is_cascaded_when_both_are_due() {
        let (clock, table, arena, policy) = setup();
        let fwd_key = key(1, 1);
        let rev_key = fwd_key.swapped();

        let fwd = FlowEntry::new(fwd_key, Action::Allow, Direction::Output, 1, 1, None, 0, 20);
        let fwd_slot = arena.allocate(0, fwd).unwrap();
        let rev = FlowEntry::new(rev_key, Action::Allow, Direction::Input, 1, 1, None, 0, 20);
        let rev_slot = arena.allocate(0, rev).unwrap();

        arena.get(fwd_slot, |e| {
            *e.status.lock() = FlowStatus::Up;
            *e.reverse.lock() = rev_slot;
        });
        arena.get(rev_slot, |e| {
            *e.status.lock() = FlowStatus::Up;
            *e.reverse.lock() = fwd_slot;
        });
        table.insert(&arena, fwd_slot);
        table.insert(&arena, rev_slot);

        let ager = Ager::new(clock.clone(), table.clone(), arena.clone(), policy.clone(), 0);
        clock.advance(20);
        let stats = ager.sweep_once();

        assert_eq!(stats.expired, 1, "only the forward leg was scanned as individually due");
        assert_eq!(stats.freed, 2, "the reverse leg was also past its own timeout, so it cascades");
        assert!(table.lookup(&arena, &fwd_key).is_none());
        assert!(table.lookup(&arena, &rev_key).is_none());
        assert_eq!(
            policy
                .service_set_by_id(1)
                .unwrap()
                .counters
                .active_flow_count
                .load(Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn idle_direction_is_spared_and_refreshed_while_reverse_is_still_active() {
        let (clock, table, arena, policy) = setup();
        let fwd_key = key(1, 1);
        let rev_key = fwd_key.swapped();

        let fwd = FlowEntry::new(fwd_key, Action::Allow, Direction::Output, 1, 1, None, 0, 20);
        let fwd_slot = arena.allocate(0, fwd).unwrap();
        let rev = FlowEntry::new(rev_key, Action::Allow, Direction::Input, 1, 1, None, 0, 20);
        let rev_slot = arena.allocate(0, rev).unwrap();

        arena.get(fwd_slot, |e| {
            *e.status.lock() = FlowStatus::Up;
            *e.reverse.lock() = rev_slot;
        });
        arena.get(rev_slot, |e| {
            *e.status.lock() = FlowStatus::Up;
            *e.reverse.lock() = fwd_slot;
            // Reverse traffic kept arriving until tick 15, well within its
            // own 20s budget, while the forward leg went quiet at tick 0.
            e.last_seen.store(15, Ordering::Relaxed);
        });
        table.insert(&arena, fwd_slot);
        table.insert(&arena, rev_slot);

        let ager = Ager::new(clock.clone(), table.clone(), arena.clone(), policy.clone(), 0);
        clock.advance(20);
        let stats = ager.sweep_once();

        assert_eq!(stats.expired, 0, "forward alone is due but its reverse is still live");
        assert_eq!(stats.freed, 0);
        assert!(table.lookup(&arena, &fwd_key).is_some(), "session survives on the still-active reverse leg");
        assert!(table.lookup(&arena, &rev_key).is_some());
        arena.get(fwd_slot, |e| {
            assert_eq!(
                e.last_seen.load(Ordering::Relaxed),
                15,
                "forward's timestamp is refreshed from the reverse leg instead of being left stale"
            );
        });
        assert_eq!(
            policy
                .service_set_by_id(1)
                .unwrap()
                .counters
                .active_flow_count
                .load(Ordering::Relaxed),
            2,
            "neither leg was reclaimed"
        );

        // Once the reverse leg also goes quiet past its own budget, the pair
        // expires together on a later sweep.
        clock.advance(20);
        let stats = ager.sweep_once();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.freed, 2);
        assert!(table.lookup(&arena, &fwd_key).is_none());
        assert!(table.lookup(&arena, &rev_key).is_none());
    }
}
