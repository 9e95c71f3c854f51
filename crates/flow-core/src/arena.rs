//! C1 — Arena & object cache.
//!
//! # 设计背景（Why）
//! - 包工作线程不能在分配路径上竞争全局锁；每个 worker 持有自己的空闲链表
//!   头，只有批量补货（refill）时才短暂持有一把 cache 级别的锁。
//! - 按实体类型参数化的单一 slab 分配器，见 [`Slab<T>`]。
//!
//! # 契约说明（What）
//! - 槽位以生成号（generation）防止 ABA：ager 释放槽位后，worker 复用同一槽位索引时
//!   generation 递增，旧的 [`SlotIndex`] 不再指向新对象；
//! - `allocate`/`free` 都以 `worker_id` 为参数，命中本地空闲链表时无锁；耗尽时从全局
//!   池批量补货（或把多余的本地空闲项批量归还），仅在该动作发生时持有 cache 锁；
//! - 当全局池和所有本地空闲链表都耗尽时返回 [`EngineError::AllocFailure`]。

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::error::{EngineError, EngineResult};

/// 单次批量补货/归还操作处理的槽位数量。
const REFILL_BATCH: usize = 64;

/// 指向 [`Slab`] 中某个槽位的句柄，携带生成号以防止 ABA。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SlotIndex {
    pub index: u32,
    pub generation: u32,
}

impl SlotIndex {
    pub const NULL: SlotIndex = SlotIndex {
        index: u32::MAX,
        generation: 0,
    };

    pub fn is_null(self) -> bool {
        self.index == u32::MAX
    }
}

impl Default for SlotIndex {
    fn default() -> Self {
        Self::NULL
    }
}

struct Slot<T> {
    value: Option<T>,
    generation: u32,
}

/// 每 worker 独占的本地空闲链表，元素是槽位下标（不含 generation，取用时从 `slab` 读取）。
struct WorkerFreeList {
    indices: Vec<u32>,
}

/// 固定容量的类型化 slab 分配器，供一个实体类别（ServiceSet/Rule/FlowEntry/...）专用。
///
/// `name` 仅用于诊断（日志、错误信息中标注是哪个 cache 耗尽）。
pub struct Slab<T> {
    name: &'static str,
    slots: Mutex<Vec<Slot<T>>>,
    global_free: Mutex<Vec<u32>>,
    worker_free: Vec<Mutex<WorkerFreeList>>,
    capacity: usize,
    len: AtomicU32,
}

impl<T> Slab<T> {
    /// 创建容量为 `capacity`、服务 `worker_count` 个 worker 的 slab。
    pub fn new(name: &'static str, capacity: usize, worker_count: usize) -> Self {
        let mut global_free = Vec::with_capacity(capacity);
        for i in (0..capacity).rev() {
            global_free.push(i as u32);
        }
        let worker_free = (0..worker_count.max(1))
            .map(|_| Mutex::new(WorkerFreeList { indices: Vec::new() }))
            .collect();

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot {
            value: None,
            generation: 0,
        });

        Self {
            name,
            slots: Mutex::new(slots),
            global_free: Mutex::new(global_free),
            worker_free,
            capacity,
            len: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed) as usize
    }

    fn worker_slot(&self, worker_id: usize) -> &Mutex<WorkerFreeList> {
        &self.worker_free[worker_id % self.worker_free.len()]
    }

    /// 为 `worker_id` 分配一个槽位并写入 `value`，返回其句柄。
    pub fn allocate(&self, worker_id: usize, value: T) -> EngineResult<SlotIndex> {
        let index = self.take_index(worker_id)?;
        let mut slots = self.slots.lock();
        let slot = &mut slots[index as usize];
        slot.value = Some(value);
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(SlotIndex {
            index,
            generation: slot.generation,
        })
    }

    fn take_index(&self, worker_id: usize) -> EngineResult<u32> {
        {
            let mut local = self.worker_slot(worker_id).lock();
            if let Some(idx) = local.indices.pop() {
                return Ok(idx);
            }
        }
        // Local free-list exhausted: refill in a batch from the global pool.
        let mut global = self.global_free.lock();
        if global.is_empty() {
            return Err(EngineError::AllocFailure { cache: self.name });
        }
        let mut local = self.worker_slot(worker_id).lock();
        let take = REFILL_BATCH.min(global.len());
        for _ in 0..take {
            if let Some(idx) = global.pop() {
                local.indices.push(idx);
            }
        }
        local
            .indices
            .pop()
            .ok_or(EngineError::AllocFailure { cache: self.name })
    }

    /// 按句柄访问槽位内容（只有 generation 匹配才返回 `Some`）。
    pub fn get<R>(&self, slot: SlotIndex, f: impl FnOnce(&T) -> R) -> Option<R> {
        let slots = self.slots.lock();
        let s = slots.get(slot.index as usize)?;
        if s.generation != slot.generation {
            return None;
        }
        s.value.as_ref().map(f)
    }

    pub fn get_mut<R>(&self, slot: SlotIndex, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slots = self.slots.lock();
        let s = slots.get_mut(slot.index as usize)?;
        if s.generation != slot.generation {
            return None;
        }
        s.value.as_mut().map(f)
    }

    /// 释放一个槽位，交还给 `worker_id` 的本地空闲链表；generation 递增使旧句柄失效。
    pub fn free(&self, slot: SlotIndex, worker_id: usize) {
        {
            let mut slots = self.slots.lock();
            if let Some(s) = slots.get_mut(slot.index as usize) {
                if s.generation != slot.generation {
                    return;
                }
                s.value = None;
                s.generation = s.generation.wrapping_add(1);
            } else {
                return;
            }
        }
        self.len.fetch_sub(1, Ordering::Relaxed);
        self.worker_slot(worker_id).lock().indices.push(slot.index);
    }

    /// 将所有 worker 的本地空闲链表合并回全局池；由 C5 ager 周期调用。
    pub fn reclaim(&self) {
        let mut global = self.global_free.lock();
        for worker in &self.worker_free {
            let mut local = worker.lock();
            global.append(&mut local.indices);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free_roundtrip() {
        let slab: Slab<u32> = Slab::new("test", 8, 2);
        let a = slab.allocate(0, 42).unwrap();
        assert_eq!(slab.get(a, |v| *v), Some(42));
        slab.free(a, 0);
        assert_eq!(slab.get(a, |v| *v), None, "stale handle must not resolve after free");
    }

    #[test]
    fn generation_guards_against_aba() {
        let slab: Slab<u32> = Slab::new("test", 1, 1);
        let a = slab.allocate(0, 1).unwrap();
        slab.free(a, 0);
        let b = slab.allocate(0, 2).unwrap();
        assert_eq!(a.index, b.index, "single-slot slab must reuse the index");
        assert_ne!(a.generation, b.generation);
        assert_eq!(slab.get(a, |v| *v), None);
        assert_eq!(slab.get(b, |v| *v), Some(2));
    }

    #[test]
    fn exhaustion_is_failable() {
        let slab: Slab<u32> = Slab::new("test", 2, 1);
        let _a = slab.allocate(0, 1).unwrap();
        let _b = slab.allocate(0, 2).unwrap();
        assert!(matches!(
            slab.allocate(0, 3),
            Err(EngineError::AllocFailure { .. })
        ));
    }

    #[test]
    fn reclaim_merges_worker_free_lists() {
        let slab: Slab<u32> = Slab::new("test", 4, 2);
        let a = slab.allocate(0, 1).unwrap();
        let b = slab.allocate(1, 2).unwrap();
        slab.free(a, 0);
        slab.free(b, 1);
        slab.reclaim();
        // After reclaim, allocation from either worker should succeed without exhaustion.
        assert!(slab.allocate(0, 3).is_ok());
        assert!(slab.allocate(1, 4).is_ok());
    }
}
