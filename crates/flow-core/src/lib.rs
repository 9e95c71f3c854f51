//! Shared data-plane engine core for the two MS-PIC services.
//!
//! # 架构定位（Where/Architecture）
//! `flow-core` 只承载两个服务共有的结构核心：分配（[`arena`]）、流表
//! （[`flow_table`]）、策略（[`policy`]）、老化（[`ager`]）、控制通道线格式
//! （[`control`]）以及时钟抽象（[`clock`]）。包解析、校验和调整、健康探测、
//! 负载选择这些按服务分叉的行为，分别留给 `jnx-flow` 和 `equilibrium` 两个
//! 二进制 crate 实现——它们各自拥有自己的 `Slab<FlowEntry>`、`FlowTable`、
//! `PolicyStore` 实例，并把这里的类型组合进各自的 worker 循环。

pub mod ager;
pub mod arena;
pub mod clock;
pub mod control;
pub mod error;
pub mod flow_table;
pub mod packet;
pub mod policy;

pub use ager::{Ager, SweepStats};
pub use arena::{Slab, SlotIndex};
pub use clock::{Clock, ManualClock, SystemClock};
pub use control::{ControlChannel, Frame, LinkState, MessageHeader, SubHeader, SubMessage};
pub use error::{EngineError, EngineResult, WireErrorCode};
pub use flow_table::{
    Action, Direction, FlowEntry, FlowKey, FlowStats, FlowStatus, FlowTable, ServiceDiscriminator,
    BUCKET_COUNT,
};
pub use packet::Ipv4View;
pub use policy::{
    CompositeKey, PolicyStore, Registry, Rule, RuleAction, RuleDirection, RuleMatch,
    ServiceRuleBinding, ServiceSet, ServiceSetAttrs, ServiceSetCounters, ServiceSetKind,
};
