//! C2 — Flow hash table.
//!
//! # 设计背景（Why）
//! - 哈希表固定 `512*1024` = 2^19 个桶，每桶一把锁加一条单向链表；哈希函数
//!   是一个以 `0x5f5f` 为种子、对 5 个 32 位字做 `hash = ((hash<<5)+hash) ^ key[n]`
//!   的 DJB 变体，最后与桶数掩码取与。
//! - 桶锁 → 条目锁的加锁顺序，以及"状态非 UP 视为未命中"的查找语义。
//! - 桶锁使用 `parking_lot::Mutex`（少量自旋后转入队等待，适合通用操作系统内核），
//!   区别于专用数据面内核上的纯自旋锁。

use std::net::Ipv4Addr;

use parking_lot::Mutex;

use crate::arena::SlotIndex;

/// 2^19 个桶。
pub const BUCKET_COUNT: usize = 1 << 19;
const HASH_MASK: u32 = (BUCKET_COUNT as u32) - 1;
const HASH_MAGIC: u32 = 0x5f5f;

/// 服务集判别键：类型 + （接口 id / NEXTHOP 入方向 subunit）。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ServiceDiscriminator {
    Interface(u32),
    Nexthop(u32),
}

impl ServiceDiscriminator {
    fn as_word(self) -> u32 {
        match self {
            ServiceDiscriminator::Interface(id) => id,
            ServiceDiscriminator::Nexthop(iif) => (1 << 31) | (iif & 0x7fff_ffff),
        }
    }
}

/// 5 元组 + 服务集判别键，作为流表的查找/比较键。
///
/// 固定折叠成 5 个 32 位字喂给哈希函数：
/// `[src_addr, dst_addr, (src_port<<16|dst_port), proto, discriminator]`。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FlowKey {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
    pub service: ServiceDiscriminator,
}

impl FlowKey {
    pub fn swapped(&self) -> FlowKey {
        let service = match self.service {
            ServiceDiscriminator::Interface(id) => ServiceDiscriminator::Interface(id),
            // NEXTHOP services swap ingress/egress subunit on the reverse leg; the
            // caller supplies the swapped iif via `with_service`, this helper only
            // flips the address/port pair.
            ServiceDiscriminator::Nexthop(iif) => ServiceDiscriminator::Nexthop(iif),
        };
        FlowKey {
            src_addr: self.dst_addr,
            dst_addr: self.src_addr,
            src_port: self.dst_port,
            dst_port: self.src_port,
            proto: self.proto,
            service,
        }
    }

    pub fn with_service(mut self, service: ServiceDiscriminator) -> Self {
        self.service = service;
        self
    }

    fn words(&self) -> [u32; 5] {
        [
            u32::from(self.src_addr),
            u32::from(self.dst_addr),
            (u32::from(self.src_port) << 16) | u32::from(self.dst_port),
            u32::from(self.proto),
            self.service.as_word(),
        ]
    }

    /// Bit-exact port of `jnx_flow_data_get_flow_hash`.
    pub fn hash(&self) -> u32 {
        let mut hash = HASH_MAGIC;
        for word in self.words() {
            hash = hash.wrapping_shl(5).wrapping_add(hash) ^ word;
        }
        hash & HASH_MASK
    }

    /// Fragment-path lookup key: non-first fragments carry no ports, so matching
    /// instead uses `(src, dst, service, fragment_group == ip_id)`.
    pub fn fragment_lookup_words(&self, ip_id: u16) -> [u32; 5] {
        [
            u32::from(self.src_addr),
            u32::from(self.dst_addr),
            u32::from(ip_id),
            u32::from(self.proto),
            self.service.as_word(),
        ]
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlowStatus {
    Init,
    Up,
    Down,
    Delete,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    Allow,
    Drop,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Input,
    Output,
    Any,
}

/// Per-entry traffic counters, mutated with relaxed atomics so concurrent
/// fetch-adds never tear (property §8 "No-torn counter").
#[derive(Default, Debug)]
pub struct FlowStats {
    pub pkts_in: std::sync::atomic::AtomicU64,
    pub bytes_in: std::sync::atomic::AtomicU64,
    pub pkts_out: std::sync::atomic::AtomicU64,
    pub bytes_out: std::sync::atomic::AtomicU64,
    pub pkts_dropped: std::sync::atomic::AtomicU64,
    pub bytes_dropped: std::sync::atomic::AtomicU64,
}

impl FlowStats {
    pub fn add_in(&self, bytes: u64) {
        self.pkts_in.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn add_out(&self, bytes: u64) {
        self.pkts_out.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn add_dropped(&self, bytes: u64) {
        self.pkts_dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.bytes_dropped.fetch_add(bytes, std::sync::atomic::Ordering::Relaxed);
    }
}

/// One direction of a session.
///
/// The `equilibrium`-only fields (`facade_addr`, `fragment_group`) are carried
/// unconditionally: `jnx-flow` simply never populates `facade_addr`. The two
/// services share an identical structural core, so the entry type is not
/// forked per service.
pub struct FlowEntry {
    pub key: FlowKey,
    pub status: Mutex<FlowStatus>,
    pub action: Action,
    pub direction: Direction,
    pub service_set_id: u32,
    pub rule_id: u32,
    pub egress_subunit: Option<u32>,
    pub last_seen: std::sync::atomic::AtomicU64,
    pub stats: FlowStats,
    pub reverse: Mutex<SlotIndex>,
    pub facade_addr: Mutex<Option<Ipv4Addr>>,
    pub fragment_group: std::sync::atomic::AtomicU32,
    pub timeout_secs: u32,
    next: Mutex<Option<SlotIndex>>,
}

impl FlowEntry {
    pub fn new(
        key: FlowKey,
        action: Action,
        direction: Direction,
        service_set_id: u32,
        rule_id: u32,
        egress_subunit: Option<u32>,
        now: u64,
        timeout_secs: u32,
    ) -> Self {
        Self {
            key,
            status: Mutex::new(FlowStatus::Init),
            action,
            direction,
            service_set_id,
            rule_id,
            egress_subunit,
            last_seen: std::sync::atomic::AtomicU64::new(now),
            stats: FlowStats::default(),
            reverse: Mutex::new(SlotIndex::NULL),
            facade_addr: Mutex::new(None),
            fragment_group: std::sync::atomic::AtomicU32::new(0),
            timeout_secs,
            next: Mutex::new(None),
        }
    }

    pub fn touch(&self, now: u64) {
        self.last_seen.store(now, std::sync::atomic::Ordering::Relaxed);
    }
}

struct Bucket {
    head: Option<SlotIndex>,
}

/// The fixed 2^19-bucket table. Generic over the arena so jnx-flow and
/// equilibrium each own their own `Slab<FlowEntry>` sizing.
pub struct FlowTable {
    buckets: Vec<Mutex<Bucket>>,
}

impl FlowTable {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        buckets.resize_with(BUCKET_COUNT, || Mutex::new(Bucket { head: None }));
        Self { buckets }
    }

    fn bucket_for_hash(&self, hash: u32) -> &Mutex<Bucket> {
        &self.buckets[hash as usize]
    }

    /// Lookup by full key (fast-path, non-fragment). Requires access to the
    /// backing arena to dereference chain slots and compare keys.
    pub fn lookup(
        &self,
        arena: &crate::arena::Slab<FlowEntry>,
        key: &FlowKey,
    ) -> Option<SlotIndex> {
        let hash = key.hash();
        self.walk_chain(arena, hash, |entry| entry.key == *key)
    }

    /// Fragment lookup path: match `(src, dst, service, fragment_group==ip_id)`,
    /// ignoring ports (non-first fragments carry none).
    pub fn lookup_fragment(
        &self,
        arena: &crate::arena::Slab<FlowEntry>,
        key: &FlowKey,
        ip_id: u16,
    ) -> Option<SlotIndex> {
        let mut hash = HASH_MAGIC;
        for word in key.fragment_lookup_words(ip_id) {
            hash = hash.wrapping_shl(5).wrapping_add(hash) ^ word;
        }
        let hash = hash & HASH_MASK;
        self.walk_chain(arena, hash, |entry| {
            entry.key.src_addr == key.src_addr
                && entry.key.dst_addr == key.dst_addr
                && entry.key.service == key.service
                && entry.fragment_group.load(std::sync::atomic::Ordering::Relaxed) == u32::from(ip_id)
        })
    }

    fn walk_chain(
        &self,
        arena: &crate::arena::Slab<FlowEntry>,
        hash: u32,
        matches: impl Fn(&FlowEntry) -> bool,
    ) -> Option<SlotIndex> {
        let bucket = self.bucket_for_hash(hash).lock();
        let mut cursor = bucket.head;
        while let Some(slot) = cursor {
            let found = arena.get(slot, |entry| {
                if matches(entry) {
                    Some(*entry.status.lock() == FlowStatus::Up)
                } else {
                    None
                }
            });
            match found {
                Some(Some(is_up)) => {
                    return if is_up { Some(slot) } else { None };
                }
                _ => {
                    cursor = arena.get(slot, |entry| *entry.next.lock()).flatten();
                }
            }
        }
        None
    }

    /// Insert `slot` into its bucket chain, keyed by `entry.key.hash()`. Caller
    /// must have already written the entry's fields; this only links it in.
    pub fn insert(&self, arena: &crate::arena::Slab<FlowEntry>, slot: SlotIndex) {
        let hash = arena.get(slot, |e| e.key.hash()).expect("slot must be live");
        let mut bucket = self.bucket_for_hash(hash).lock();
        arena.get(slot, |e| *e.next.lock() = bucket.head);
        bucket.head = Some(slot);
    }

    /// Unlink `slot` from the bucket chain computed from `hash`. Used by the
    /// ager, which already knows the hash from its full sweep.
    pub fn unlink(&self, arena: &crate::arena::Slab<FlowEntry>, hash: u32, slot: SlotIndex) {
        let mut bucket = self.bucket_for_hash(hash).lock();
        if bucket.head == Some(slot) {
            bucket.head = arena.get(slot, |e| *e.next.lock()).flatten();
            return;
        }
        let mut cursor = bucket.head;
        while let Some(cur) = cursor {
            let next = arena.get(cur, |e| *e.next.lock()).flatten();
            if next == Some(slot) {
                let after = arena.get(slot, |e| *e.next.lock()).flatten();
                arena.get(cur, |e| *e.next.lock() = after);
                return;
            }
            cursor = next;
        }
    }

    /// Iterate every bucket, invoking `f(hash, slot)` for each chained entry.
    /// Used exclusively by the ager's sweep; bucket lock is held only for the
    /// duration of reading the chain for one bucket.
    pub fn for_each_bucket(&self, arena: &crate::arena::Slab<FlowEntry>, mut f: impl FnMut(u32, SlotIndex)) {
        for (hash, bucket) in self.buckets.iter().enumerate() {
            let guard = bucket.lock();
            let mut cursor = guard.head;
            drop(guard);
            while let Some(slot) = cursor {
                f(hash as u32, slot);
                cursor = arena.get(slot, |e| *e.next.lock()).flatten();
            }
        }
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Slab;

    fn key(a: u8, b: u8, sport: u16, dport: u16) -> FlowKey {
        FlowKey {
            src_addr: Ipv4Addr::new(10, 0, 0, a),
            dst_addr: Ipv4Addr::new(192, 168, 0, b),
            src_port: sport,
            dst_port: dport,
            proto: 6,
            service: ServiceDiscriminator::Interface(7),
        }
    }

    #[test]
    fn hash_matches_reference_recurrence() {
        let k = key(5, 9, 40000, 80);
        let mut hash = HASH_MAGIC;
        for word in k.words() {
            hash = hash.wrapping_shl(5).wrapping_add(hash) ^ word;
        }
        assert_eq!(k.hash(), hash & HASH_MASK);
    }

    #[test]
    fn forward_and_reverse_hash_independently() {
        let fwd = key(5, 9, 40000, 80);
        let rev = fwd.swapped();
        // Not a hard guarantee for all inputs, but true for typical asymmetric
        // 5-tuples; this specific pair is known to differ under the DJB mix.
        assert_ne!(fwd.hash(), rev.hash());
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let arena: Slab<FlowEntry> = Slab::new("flow", 16, 1);
        let table = FlowTable::new();
        let k = key(5, 9, 40000, 80);
        let entry = FlowEntry::new(k, Action::Allow, Direction::Output, 7, 1, None, 0, 20);
        let slot = arena.allocate(0, entry).unwrap();
        arena.get(slot, |e| *e.status.lock() = FlowStatus::Up);
        table.insert(&arena, slot);
        assert_eq!(table.lookup(&arena, &k), Some(slot));
    }

    #[test]
    fn non_up_entry_is_treated_as_miss() {
        let arena: Slab<FlowEntry> = Slab::new("flow", 16, 1);
        let table = FlowTable::new();
        let k = key(5, 9, 40000, 80);
        let entry = FlowEntry::new(k, Action::Allow, Direction::Output, 7, 1, None, 0, 20);
        let slot = arena.allocate(0, entry).unwrap();
        table.insert(&arena, slot); // status stays Init
        assert_eq!(table.lookup(&arena, &k), None);
    }

    #[test]
    fn unlink_removes_from_chain() {
        let arena: Slab<FlowEntry> = Slab::new("flow", 16, 1);
        let table = FlowTable::new();
        let k = key(5, 9, 40000, 80);
        let entry = FlowEntry::new(k, Action::Allow, Direction::Output, 7, 1, None, 0, 20);
        let slot = arena.allocate(0, entry).unwrap();
        arena.get(slot, |e| *e.status.lock() = FlowStatus::Up);
        table.insert(&arena, slot);
        table.unlink(&arena, k.hash(), slot);
        assert_eq!(table.lookup(&arena, &k), None);
    }
}
