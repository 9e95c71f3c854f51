//! Clear-flow support shared by the `CLEAR_INFO` control-message handlers.
//!
//! # 设计背景（Why）
//! - 原始 `jnx_flow_msg_clear_type_t` 把"清除会话"分成 ALL / ENTRY / FOR_RULE /
//!   FOR_SERVICE / SERVICE_TYPE 五种粒度。C5 ager 已经有"标记删除 → 摘链 → 释放 →
//!   级联反向"这套动作（见 `flow-core::ager`），这里抽出同样的动作序列供管理器发起
//!   的清除命令复用，避免两套几乎相同的淘汰逻辑分叉。

use std::sync::atomic::Ordering;
use std::sync::Arc;

use flow_core::arena::{Slab, SlotIndex};
use flow_core::flow_table::{FlowEntry, FlowStatus, FlowTable};
use flow_core::policy::PolicyStore;

/// Mark, unlink, and free `slot`, cascading to its reverse partner; mirrors
/// `flow-core::ager::Ager::expire` but triggered by an operator command
/// instead of idle-timeout.
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

/// `CLEAR_FLOW_ALL`: tear down every live session.
pub fn clear_all(table: &Arc<FlowTable>, arena: &Arc<Slab<FlowEntry>>, policy: &Arc<PolicyStore>) -> u32 {
    let mut victims = Vec::new();
    table.for_each_bucket(arena, |hash, slot| victims.push((hash, slot)));
    victims
        .into_iter()
        .map(|(hash, slot)| clear_one(table, arena, policy, hash, slot))
        .sum()
}

/// `CLEAR_FLOW_FOR_RULE`: tear down every session classified by `rule_id`.
pub fn clear_for_rule(table: &Arc<FlowTable>, arena: &Arc<Slab<FlowEntry>>, policy: &Arc<PolicyStore>, rule_id: u32) -> u32 {
    let mut victims = Vec::new();
    table.for_each_bucket(arena, |hash, slot| {
        if arena.get(slot, |e| e.rule_id == rule_id).unwrap_or(false) {
            victims.push((hash, slot));
        }
    });
    victims
        .into_iter()
        .map(|(hash, slot)| clear_one(table, arena, policy, hash, slot))
        .sum()
}

/// `CLEAR_FLOW_FOR_SERVICE`: tear down every session under service-set `ss_id`.
pub fn clear_for_service(table: &Arc<FlowTable>, arena: &Arc<Slab<FlowEntry>>, policy: &Arc<PolicyStore>, ss_id: u32) -> u32 {
    let mut victims = Vec::new();
    table.for_each_bucket(arena, |hash, slot| {
        if arena.get(slot, |e| e.service_set_id == ss_id).unwrap_or(false) {
            victims.push((hash, slot));
        }
    });
    victims
        .into_iter()
        .map(|(hash, slot)| clear_one(table, arena, policy, hash, slot))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_core::flow_table::{Action, Direction, FlowKey, ServiceDiscriminator};
    use flow_core::policy::{ServiceSetAttrs, ServiceSetKind};
    use std::net::Ipv4Addr;

    fn key(a: u8) -> FlowKey {
        FlowKey {
            src_addr: Ipv4Addr::new(10, 0, 0, a),
            dst_addr: Ipv4Addr::new(192, 168, 0, a),
            src_port: 1000,
            dst_port: 80,
            proto: 6,
            service: ServiceDiscriminator::Interface(1),
        }
    }

    #[test]
    fn clear_all_removes_every_session() {
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

        let entry = FlowEntry::new(key(1), Action::Allow, Direction::Output, 1, 1, None, 0, 20);
        let slot = arena.allocate(0, entry).unwrap();
        arena.get(slot, |e| *e.status.lock() = FlowStatus::Up);
        table.insert(&arena, slot);

        let freed = clear_all(&table, &arena, &policy);
        assert_eq!(freed, 1);
        assert!(table.lookup(&arena, &key(1)).is_none());
    }
}
