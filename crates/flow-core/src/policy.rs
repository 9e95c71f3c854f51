//! C3 — Policy store.
//!
//! # 设计背景（Why）
//! - 两张 `ServiceSet` 索引（按 `svc_id`、按 `(svc_type, id_or_iif)`）外加一张
//!   规则索引，读写不互相阻塞、也不会读到"撕裂"的多步更新：单写者 + 写时克隆
//!   （clone-on-write）+ 原子整表替换（`ArcSwap::store`）策略。唯一的写者是
//!   C7 线程，在持有内部 `write_lock` 期间克隆受影响的表、修改克隆、再整体
//!   `store` 回去；包工作线程通过 `ArcSwap::load` 读取，永远拿到某个时刻的完整
//!   快照，不会看到半途的插入/删除（不变式 I5）。
//!
//! # 契约说明（What）
//! - [`Registry`] 是一个通用的键值注册表抽象；
//! - [`PolicyStore`] 组合两张 `ServiceSet` 索引和一张 `Rule` 索引，暴露每个
//!   配置操作，并保持规则引用计数不变式 I3。

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::flow_table::ServiceDiscriminator;

/// Copy-on-write map behind an `ArcSwap`: readers never block, writers serialize
/// through an external lock (see [`PolicyStore::write_lock`]) and publish the
/// whole map atomically.
pub struct Registry<K, V> {
    snapshot: ArcSwap<HashMap<K, Arc<V>>>,
}

impl<K, V> Default for Registry<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(HashMap::new()),
        }
    }
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.snapshot.load().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.snapshot.load().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    /// Clone the current map, apply `mutate`, then publish atomically. Caller
    /// is responsible for serializing concurrent writers externally (e.g. via
    /// a writer-side mutex); `Registry` itself only guarantees atomic,
    /// torn-free publication of whatever the closure produces.
    pub fn mutate(&self, mutate: impl FnOnce(&mut HashMap<K, Arc<V>>)) {
        let mut next = (**self.snapshot.load()).clone();
        mutate(&mut next);
        self.snapshot.store(Arc::new(next));
    }

    pub fn values(&self) -> Vec<Arc<V>> {
        self.snapshot.load().values().cloned().collect()
    }
}

impl<K, V> Clone for Registry<K, V> {
    fn clone(&self) -> Self {
        Self {
            snapshot: ArcSwap::new(self.snapshot.load_full()),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServiceSetKind {
    Interface,
    Nexthop,
}

/// Composite key used for packet-time lookup.
pub type CompositeKey = (ServiceSetKind, u32);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RuleAction {
    Allow,
    Drop,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RuleDirection {
    Input,
    Output,
    Any,
}

/// 5-tuple match definition; `0` in `proto`/ports and an all-zero mask
/// encode a wildcard.
#[derive(Clone, Copy, Debug)]
pub struct RuleMatch {
    pub src_addr: u32,
    pub src_mask: u32,
    pub dst_addr: u32,
    pub dst_mask: u32,
    pub proto: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

impl RuleMatch {
    pub fn matches(
        &self,
        src_addr: u32,
        dst_addr: u32,
        proto: u8,
        src_port: u16,
        dst_port: u16,
    ) -> bool {
        (src_addr & self.src_mask) == (self.src_addr & self.src_mask)
            && (dst_addr & self.dst_mask) == (self.dst_addr & self.dst_mask)
            && (self.proto == 0 || self.proto == proto)
            && (self.src_port == 0 || self.src_port == src_port)
            && (self.dst_port == 0 || self.dst_port == dst_port)
    }
}

pub struct Rule {
    pub id: u32,
    pub name: String,
    pub action: RuleAction,
    pub direction: RuleDirection,
    pub rule_match: RuleMatch,
    ref_count: AtomicU32,
}

impl Rule {
    pub fn new(id: u32, name: impl Into<String>, action: RuleAction, direction: RuleDirection, rule_match: RuleMatch) -> Self {
        Self {
            id,
            name: name.into(),
            action,
            direction,
            rule_match,
            ref_count: AtomicU32::new(0),
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Relaxed)
    }

    fn incref(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    fn decref(&self) {
        self.ref_count.fetch_sub(1, Ordering::Relaxed);
    }
}

/// An ordered, 1-based binding of a rule into a service-set's rule list.
#[derive(Clone, Copy, Debug)]
pub struct ServiceRuleBinding {
    pub position: u32,
    pub rule_id: u32,
}

/// Cumulative + live counters a `ServiceSet` exposes.
#[derive(Default)]
pub struct ServiceSetCounters {
    pub applied_rule_count: AtomicU64,
    pub total_flow_count: AtomicU64,
    pub active_flow_count: AtomicU64,
}

pub struct ServiceSet {
    pub id: u32,
    pub name: String,
    pub kind: ServiceSetKind,
    pub iif: Option<u32>,
    pub oif: Option<u32>,
    pub bindings: Mutex<Vec<ServiceRuleBinding>>,
    pub counters: ServiceSetCounters,
}

impl ServiceSet {
    pub fn composite_key(&self) -> CompositeKey {
        let id_or_iif = match self.kind {
            ServiceSetKind::Interface => self.id,
            ServiceSetKind::Nexthop => self.iif.unwrap_or(self.id),
        };
        (self.kind, id_or_iif)
    }

    pub fn discriminator(&self) -> ServiceDiscriminator {
        match self.kind {
            ServiceSetKind::Interface => ServiceDiscriminator::Interface(self.id),
            ServiceSetKind::Nexthop => ServiceDiscriminator::Nexthop(self.iif.unwrap_or(self.id)),
        }
    }
}

/// Attributes needed to construct or re-key a `ServiceSet`.
pub struct ServiceSetAttrs {
    pub id: u32,
    pub name: String,
    pub kind: ServiceSetKind,
    pub iif: Option<u32>,
    pub oif: Option<u32>,
}

pub struct PolicyStore {
    by_id: Registry<u32, ServiceSet>,
    by_composite: Registry<CompositeKey, u32>,
    rules: Registry<u32, Rule>,
    write_lock: Mutex<()>,
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyStore {
    pub fn new() -> Self {
        Self {
            by_id: Registry::default(),
            by_composite: Registry::default(),
            rules: Registry::default(),
            write_lock: Mutex::new(()),
        }
    }

    // ---- packet-path reads (lock-free) ----

    pub fn service_set_by_id(&self, id: u32) -> Option<Arc<ServiceSet>> {
        self.by_id.get(&id)
    }

    pub fn service_set_by_composite(&self, key: CompositeKey) -> Option<Arc<ServiceSet>> {
        let id = self.by_composite.get(&key)?;
        self.by_id.get(&id)
    }

    pub fn rule_by_id(&self, id: u32) -> Option<Arc<Rule>> {
        self.rules.get(&id)
    }

    // ---- C7-driven mutations (serialized through `write_lock`) ----

    pub fn service_set_add(&self, attrs: ServiceSetAttrs) -> EngineResult<()> {
        let _guard = self.write_lock.lock();
        if self.by_id.contains(&attrs.id) {
            return Err(EngineError::AlreadyExists(format!("service-set {}", attrs.id)));
        }
        let set = Arc::new(ServiceSet {
            id: attrs.id,
            name: attrs.name,
            kind: attrs.kind,
            iif: attrs.iif,
            oif: attrs.oif,
            bindings: Mutex::new(Vec::new()),
            counters: ServiceSetCounters::default(),
        });
        let composite = set.composite_key();
        self.by_id.mutate(|m| {
            m.insert(set.id, set.clone());
        });
        self.by_composite.mutate(|m| {
            m.insert(composite, set.id);
        });
        Ok(())
    }

    pub fn service_set_delete(&self, id: u32) -> EngineResult<()> {
        let _guard = self.write_lock.lock();
        let set = self
            .by_id
            .get(&id)
            .ok_or_else(|| EngineError::NotFound(format!("service-set {id}")))?;
        for binding in set.bindings.lock().iter() {
            if let Some(rule) = self.rules.get(&binding.rule_id) {
                rule.decref();
            }
        }
        let composite = set.composite_key();
        self.by_id.mutate(|m| {
            m.remove(&id);
        });
        self.by_composite.mutate(|m| {
            m.remove(&composite);
        });
        Ok(())
    }

    /// Re-key a service-set after its type/iif/oif/name changed.
    pub fn service_set_change(&self, attrs: ServiceSetAttrs) -> EngineResult<()> {
        let _guard = self.write_lock.lock();
        let old = self
            .by_id
            .get(&attrs.id)
            .ok_or_else(|| EngineError::NotFound(format!("service-set {}", attrs.id)))?;
        let old_composite = old.composite_key();
        let bindings = old.bindings.lock().clone();

        let new_set = Arc::new(ServiceSet {
            id: attrs.id,
            name: attrs.name,
            kind: attrs.kind,
            iif: attrs.iif,
            oif: attrs.oif,
            bindings: Mutex::new(bindings),
            counters: ServiceSetCounters::default(),
        });
        let new_composite = new_set.composite_key();

        self.by_id.mutate(|m| {
            m.insert(new_set.id, new_set.clone());
        });
        self.by_composite.mutate(|m| {
            m.remove(&old_composite);
            m.insert(new_composite, new_set.id);
        });
        Ok(())
    }

    pub fn rule_add(&self, rule: Rule) -> EngineResult<()> {
        let _guard = self.write_lock.lock();
        if self.rules.contains(&rule.id) {
            return Err(EngineError::AlreadyExists(format!("rule {}", rule.id)));
        }
        self.rules.mutate(|m| {
            m.insert(rule.id, Arc::new(rule));
        });
        Ok(())
    }

    pub fn rule_delete(&self, id: u32) -> EngineResult<()> {
        let _guard = self.write_lock.lock();
        let rule = self
            .rules
            .get(&id)
            .ok_or_else(|| EngineError::NotFound(format!("rule {id}")))?;
        if rule.ref_count() != 0 {
            return Err(EngineError::RuleInUse {
                rule_id: id,
                ref_count: rule.ref_count(),
            });
        }
        self.rules.mutate(|m| {
            m.remove(&id);
        });
        Ok(())
    }

    pub fn rule_change(&self, rule: Rule) -> EngineResult<()> {
        let _guard = self.write_lock.lock();
        let existing = self
            .rules
            .get(&rule.id)
            .ok_or_else(|| EngineError::NotFound(format!("rule {}", rule.id)))?;
        rule.ref_count.store(existing.ref_count(), Ordering::Relaxed);
        self.rules.mutate(|m| {
            m.insert(rule.id, Arc::new(rule));
        });
        Ok(())
    }

    /// `service_rule_add`: insert or replace the binding at `position`.
    pub fn service_rule_add(&self, ss_id: u32, position: u32, rule_id: u32) -> EngineResult<()> {
        let _guard = self.write_lock.lock();
        let set = self
            .by_id
            .get(&ss_id)
            .ok_or_else(|| EngineError::NotFound(format!("service-set {ss_id}")))?;
        let rule = self
            .rules
            .get(&rule_id)
            .ok_or_else(|| EngineError::NotFound(format!("rule {rule_id}")))?;

        let mut bindings = set.bindings.lock();
        if let Some(existing) = bindings.iter_mut().find(|b| b.position == position) {
            if let Some(old_rule) = self.rules.get(&existing.rule_id) {
                old_rule.decref();
            }
            existing.rule_id = rule_id;
        } else {
            bindings.push(ServiceRuleBinding { position, rule_id });
        }
        rule.incref();
        Ok(())
    }

    /// `service_rule_delete`: fails if the binding at `position` does not
    /// reference `rule_id`.
    pub fn service_rule_delete(&self, ss_id: u32, position: u32, rule_id: u32) -> EngineResult<()> {
        let _guard = self.write_lock.lock();
        let set = self
            .by_id
            .get(&ss_id)
            .ok_or_else(|| EngineError::NotFound(format!("service-set {ss_id}")))?;
        let mut bindings = set.bindings.lock();
        let idx = bindings
            .iter()
            .position(|b| b.position == position && b.rule_id == rule_id)
            .ok_or_else(|| {
                EngineError::NotFound(format!("binding {ss_id}/{position} -> rule {rule_id}"))
            })?;
        bindings.remove(idx);
        if let Some(rule) = self.rules.get(&rule_id) {
            rule.decref();
        }
        Ok(())
    }

    /// Ordered rule-match walk for a service-set, used on the slow path.
    /// Returns the first matching binding: first-match-wins, and DROP vs
    /// ALLOW is just the winning rule's action.
    pub fn match_rule(
        &self,
        set: &ServiceSet,
        direction: RuleDirection,
        src_addr: u32,
        dst_addr: u32,
        proto: u8,
        src_port: u16,
        dst_port: u16,
    ) -> Option<Arc<Rule>> {
        let bindings = set.bindings.lock().clone();
        for binding in bindings {
            let Some(rule) = self.rules.get(&binding.rule_id) else {
                continue;
            };
            let direction_ok = matches!(rule.direction, RuleDirection::Any) || rule.direction == direction;
            if direction_ok
                && rule
                    .rule_match
                    .matches(src_addr, dst_addr, proto, src_port, dst_port)
            {
                return Some(rule);
            }
        }
        None
    }

    /// Wipe every `ServiceSet`, composite-key alias, and `Rule` unconditionally,
    /// bypassing the ref-count check `rule_delete` enforces. Used for a full
    /// configuration reset (`DELETE_ALL`, or a manager reconnect that demands
    /// a clean slate before the next resync): the original never checks
    /// `ref_count` before walking `services_conf` for a full reset, since
    /// every affected session is torn down in the same sweep.
    pub fn clear_all(&self) {
        let _guard = self.write_lock.lock();
        self.by_id.mutate(|m| m.clear());
        self.by_composite.mutate(|m| m.clear());
        self.rules.mutate(|m| m.clear());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wildcard_match(src: u32, dst: u32, proto: u8, sport: u16, dport: u16) -> RuleMatch {
        RuleMatch {
            src_addr: src,
            src_mask: if src == 0 { 0 } else { u32::MAX },
            dst_addr: dst,
            dst_mask: if dst == 0 { 0 } else { u32::MAX },
            proto,
            src_port: sport,
            dst_port: dport,
        }
    }

    #[test]
    fn service_rule_add_replace_transfers_refcount() {
        let store = PolicyStore::new();
        store
            .service_set_add(ServiceSetAttrs {
                id: 7,
                name: "ss7".into(),
                kind: ServiceSetKind::Interface,
                iif: None,
                oif: None,
            })
            .unwrap();
        store
            .rule_add(Rule::new(1, "r1", RuleAction::Allow, RuleDirection::Any, wildcard_match(0, 0, 0, 0, 0)))
            .unwrap();
        store
            .rule_add(Rule::new(2, "r2", RuleAction::Drop, RuleDirection::Any, wildcard_match(0, 0, 0, 0, 0)))
            .unwrap();

        store.service_rule_add(7, 1, 1).unwrap();
        assert_eq!(store.rule_by_id(1).unwrap().ref_count(), 1);

        // Replace position 1 with rule 2: ref transfers.
        store.service_rule_add(7, 1, 2).unwrap();
        assert_eq!(store.rule_by_id(1).unwrap().ref_count(), 0);
        assert_eq!(store.rule_by_id(2).unwrap().ref_count(), 1);
    }

    #[test]
    fn rule_delete_fails_while_referenced() {
        let store = PolicyStore::new();
        store
            .service_set_add(ServiceSetAttrs {
                id: 1,
                name: "a".into(),
                kind: ServiceSetKind::Interface,
                iif: None,
                oif: None,
            })
            .unwrap();
        store
            .rule_add(Rule::new(10, "r", RuleAction::Allow, RuleDirection::Any, wildcard_match(0, 0, 0, 0, 0)))
            .unwrap();
        store.service_rule_add(1, 1, 10).unwrap();
        assert!(matches!(store.rule_delete(10), Err(EngineError::RuleInUse { .. })));
        store.service_rule_delete(1, 1, 10).unwrap();
        store.rule_delete(10).unwrap();
    }

    #[test]
    fn rule_match_precedence_first_match_wins() {
        let store = PolicyStore::new();
        store
            .service_set_add(ServiceSetAttrs {
                id: 7,
                name: "ss7".into(),
                kind: ServiceSetKind::Interface,
                iif: None,
                oif: None,
            })
            .unwrap();
        // Rule 1: allow 10.0.0.0/8 -> any:80
        store
            .rule_add(Rule::new(
                1,
                "allow-http",
                RuleAction::Allow,
                RuleDirection::Any,
                RuleMatch {
                    src_addr: u32::from_be_bytes([10, 0, 0, 0]),
                    src_mask: u32::from_be_bytes([255, 0, 0, 0]),
                    dst_addr: 0,
                    dst_mask: 0,
                    proto: 6,
                    src_port: 0,
                    dst_port: 80,
                },
            ))
            .unwrap();
        store.service_rule_add(7, 1, 1).unwrap();

        let set = store.service_set_by_id(7).unwrap();
        let src = u32::from_be_bytes([10, 0, 0, 5]);
        let dst = u32::from_be_bytes([192, 168, 1, 9]);
        let matched = store
            .match_rule(&set, RuleDirection::Output, src, dst, 6, 40000, 80)
            .unwrap();
        assert_eq!(matched.id, 1);
        assert_eq!(matched.action, RuleAction::Allow);

        // Non-matching dest port: no rule matches.
        assert!(store
            .match_rule(&set, RuleDirection::Output, src, dst, 6, 40000, 443)
            .is_none());
    }

    #[test]
    fn readers_see_whole_snapshot_never_torn() {
        let store = PolicyStore::new();
        store
            .service_set_add(ServiceSetAttrs {
                id: 1,
                name: "a".into(),
                kind: ServiceSetKind::Interface,
                iif: None,
                oif: None,
            })
            .unwrap();
        assert!(store.service_set_by_id(1).is_some());
        assert!(store.service_set_by_composite((ServiceSetKind::Interface, 1)).is_some());
    }

    #[test]
    fn clear_all_wipes_service_sets_and_rules_even_if_referenced() {
        let store = PolicyStore::new();
        store
            .service_set_add(ServiceSetAttrs {
                id: 1,
                name: "a".into(),
                kind: ServiceSetKind::Interface,
                iif: None,
                oif: None,
            })
            .unwrap();
        store
            .rule_add(Rule::new(10, "r", RuleAction::Allow, RuleDirection::Any, wildcard_match(0, 0, 0, 0, 0)))
            .unwrap();
        store.service_rule_add(1, 1, 10).unwrap();
        assert!(matches!(store.rule_delete(10), Err(EngineError::RuleInUse { .. })));

        store.clear_all();

        assert!(store.service_set_by_id(1).is_none());
        assert!(store.service_set_by_composite((ServiceSetKind::Interface, 1)).is_none());
        assert!(store.rule_by_id(10).is_none());
    }
}
