//! Clear-session support shared by the `CLEAR_INFO`/`DELETE_*` control-message
//! handlers and by the health prober's down-transition eviction.
//!
//! # 设计背景（Why）
//! - 原始 `equilibrium-data_config.c` 的 `delete_service_set`/`delete_application`/
//!   `delete_server`/`delete_all_servers` 都以"先改配置，再把受影响的会话清掉"的
//!   顺序执行。C5 ager 已经有"标记删除 → 摘链 → 释放 → 级联反向"这套动作序列（见
//!   `flow-core::ager`），这里复用同样的动作序列，避免淘汰逻辑分叉成两套。
//! - 一条会话由哪个后端服务器承载，记录在其反向方向条目的 `key.src_addr`
//!   （该条目的源地址就是被选中的后端地址，参见 `worker::slow_path` 对
//!   `rev_key` 的构造）；按规则直接匹配（未经应用选择）的会话没有后端地址，
//!   天然不会被 [`clear_for_server`] 选中。

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use flow_core::arena::{Slab, SlotIndex};
use flow_core::flow_table::{FlowEntry, FlowStatus, FlowTable};
use flow_core::policy::PolicyStore;

/// Mark, unlink, and free `slot`, cascading to its reverse partner; mirrors
/// `flow-core::ager::Ager::expire` but triggered by a configuration change or
/// a server transitioning to `Down` instead of idle-timeout.
fn clear_one(table: &FlowTable, arena: &Slab<FlowEntry>, policy: &PolicyStore, hash: u32, slot: SlotIndex) -> u32 {
    let outcome = arena.get(slot, |entry| {
        let mut status = entry.status.lock();
        if *status == FlowStatus::Delete {
            return None;
        }
        *status = FlowStatus::Delete;
        Some((*entry.reverse.lock(), entry.service_set_id))
    });
    let Some(Some((reverse, service_set_id))) = outcome else {
        return 0;
    };
    table.unlink(arena, hash, slot);
    arena.free(slot, 0);
    if let Some(set) = policy.service_set_by_id(service_set_id) {
        set.counters.active_flow_count.fetch_sub(1, Ordering::Relaxed);
    }
    let mut freed = 1;
    if !reverse.is_null() {
        if let Some(Some((rev_hash, rev_service_set_id))) = arena.get(reverse, |entry| {
            let mut status = entry.status.lock();
            if *status == FlowStatus::Delete {
                return None;
            }
            *status = FlowStatus::Delete;
            Some((entry.key.hash(), entry.service_set_id))
        }) {
            table.unlink(arena, rev_hash, reverse);
            arena.free(reverse, 0);
            if let Some(set) = policy.service_set_by_id(rev_service_set_id) {
                set.counters.active_flow_count.fetch_sub(1, Ordering::Relaxed);
            }
            freed += 1;
        }
    }
    freed
}

fn sweep(table: &FlowTable, arena: &Slab<FlowEntry>, policy: &PolicyStore, predicate: impl Fn(&FlowEntry) -> bool) -> u32 {
    let mut victims = Vec::new();
    table.for_each_bucket(arena, |hash, slot| {
        if arena.get(slot, |e| predicate(e)).unwrap_or(false) {
            victims.push((hash, slot));
        }
    });
    victims
        .into_iter()
        .map(|(hash, slot)| clear_one(table, arena, policy, hash, slot))
        .sum()
}

/// `DELETE_ALL`: tear down every live session (service-set deletion cascades
/// here too, since a whole service-set being removed implies every session
/// under it is gone).
pub fn clear_all(table: &Arc<FlowTable>, arena: &Arc<Slab<FlowEntry>>, policy: &Arc<PolicyStore>) -> u32 {
    sweep(table, arena, policy, |_| true)
}

/// `DELETE_SS`: tear down every session under service-set `ss_id`.
pub fn clear_for_service(table: &Arc<FlowTable>, arena: &Arc<Slab<FlowEntry>>, policy: &Arc<PolicyStore>, ss_id: u32) -> u32 {
    sweep(table, arena, policy, |e| e.service_set_id == ss_id)
}

/// `DELETE_APP`: tear down every session whose forward leg's destination was
/// `facade_addr:facade_port` under service-set `ss_id` (an application's
/// sessions are keyed by its facade, not by name, at the flow-table level).
pub fn clear_for_app(
    table: &Arc<FlowTable>,
    arena: &Arc<Slab<FlowEntry>>,
    policy: &Arc<PolicyStore>,
    ss_id: u32,
    facade_addr: Ipv4Addr,
    facade_port: u16,
) -> u32 {
    sweep(table, arena, policy, |e| {
        e.service_set_id == ss_id && e.key.dst_port == facade_port && *e.facade_addr.lock() == Some(facade_addr)
    })
}

/// `DELETE_SERVER`/health-prober down transition: tear down every session
/// currently routed to backend `server_addr`.
pub fn clear_for_server(table: &Arc<FlowTable>, arena: &Arc<Slab<FlowEntry>>, policy: &Arc<PolicyStore>, server_addr: Ipv4Addr) -> u32 {
    sweep(table, arena, policy, |e| e.key.src_addr == server_addr)
}

/// `DELETE_ALL_SERVERS`: tear down every session for any server currently
/// backing application `ss_id`/`facade_addr:facade_port` (used when an
/// application's whole server pool is cleared at once).
pub fn clear_all_servers(
    table: &Arc<FlowTable>,
    arena: &Arc<Slab<FlowEntry>>,
    policy: &Arc<PolicyStore>,
    ss_id: u32,
    facade_addr: Ipv4Addr,
    facade_port: u16,
) -> u32 {
    clear_for_app(table, arena, policy, ss_id, facade_addr, facade_port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_core::arena::Slab;
    use flow_core::flow_table::{Action, Direction, FlowKey, ServiceDiscriminator};
    use flow_core::policy::{ServiceSetAttrs, ServiceSetKind};

    fn key(server: Ipv4Addr, client: Ipv4Addr) -> FlowKey {
        FlowKey {
            src_addr: server,
            dst_addr: client,
            src_port: 80,
            dst_port: 41000,
            proto: 6,
            service: ServiceDiscriminator::Interface(1),
        }
    }

    #[test]
    fn clear_for_server_removes_only_its_sessions() {
        let table = Arc::new(FlowTable::new());
        let arena = Arc::new(Slab::new("flow", 8, 1));
        let policy = Arc::new(PolicyStore::new());
        policy
            .service_set_add(ServiceSetAttrs {
                id: 1,
                name: "ss".into(),
                kind: ServiceSetKind::Interface,
                iif: None,
                oif: None,
            })
            .unwrap();

        let server_a = Ipv4Addr::new(10, 0, 1, 1);
        let server_b = Ipv4Addr::new(10, 0, 1, 2);
        let client = Ipv4Addr::new(192, 168, 0, 1);

        let entry_a = FlowEntry::new(key(server_a, client), Action::Allow, Direction::Input, 1, 0, None, 0, 20);
        let slot_a = arena.allocate(0, entry_a).unwrap();
        arena.get(slot_a, |e| *e.status.lock() = FlowStatus::Up);
        table.insert(&arena, slot_a);

        let entry_b = FlowEntry::new(key(server_b, client), Action::Allow, Direction::Input, 1, 0, None, 0, 20);
        let slot_b = arena.allocate(0, entry_b).unwrap();
        arena.get(slot_b, |e| *e.status.lock() = FlowStatus::Up);
        table.insert(&arena, slot_b);

        let freed = clear_for_server(&table, &arena, &policy, server_a);
        assert_eq!(freed, 1);
        assert!(table.lookup(&arena, &key(server_a, client)).is_none());
        assert!(table.lookup(&arena, &key(server_b, client)).is_some());
    }
}
