//! 可注入的单调时钟，驱动 C5 Ager 的 `current_time` 刻度。
//!
//! # 设计背景（Why）
//! - ager 维护一个按固定周期递增的 64 位计数器，数据包工作线程只读取
//!   该计数器而不是调用系统时钟，这样老化行为在测试中可以被精确控制，在生产环境
//!   中又避免了每个包一次的系统调用。
//! - 从“睡眠到某个 `Instant`”的通用抽象特化为“离散刻度计数器”，因为 ager 不需要
//!   任意精度的睡眠，只需要一个周期 tick 源。
//!
//! # 契约说明（What）
//! - [`Clock::now`]：返回当前刻度（单调递增，单位是“秒”概念下的逻辑刻度）；
//! - [`Clock::tick`]：驱动时钟前进一格，由 ager 的周期任务或测试显式调用。
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 抽象的单调刻度时钟。
///
/// 生产环境使用 [`SystemClock`]，由一个独立的周期任务每 `period` 调用一次
/// [`SystemClock::tick`]；测试使用 [`ManualClock`]，由用例直接推进。
pub trait Clock: Send + Sync + 'static {
    /// 读取当前刻度值。
    fn now(&self) -> u64;
}

/// 生产时钟：内部原子计数器，由独立的周期任务推进。
#[derive(Clone, Debug, Default)]
pub struct SystemClock {
    ticks: Arc<AtomicU64>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 推进 `period_secs` 格，由 ager 的周期定时任务每次定时器触发时调用一次；
    /// 必须传入该定时器的实际周期（秒），而不是固定的 1，否则刻度会和
    /// 以秒为单位的超时常量（20s/900s/...）脱节。workers 以 relaxed 顺序读取。
    pub fn tick(&self, period_secs: u64) {
        self.ticks.fetch_add(period_secs, Ordering::Relaxed);
    }
}

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

/// 测试用手动时钟：允许用例显式推进刻度以复现确定性的老化序列。
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    ticks: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 将刻度向前推进 `delta`。
    pub fn advance(&self, delta: u64) {
        self.ticks.fetch_add(delta, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_advances_by_period_on_tick() {
        let clock = SystemClock::new();
        assert_eq!(clock.now(), 0);
        clock.tick(5);
        clock.tick(5);
        assert_eq!(clock.now(), 10);
    }

    #[test]
    fn manual_clock_advances_by_delta() {
        let clock = ManualClock::new();
        clock.advance(25);
        assert_eq!(clock.now(), 25);
    }
}
