//! Error domain shared by both data-plane services.
//!
//! # 设计背景（Why）
//! - 两个数据面服务（`jnx-flow`、`equilibrium`）共享同一套错误语义：快路径错误从不跨越
//!   worker 边界，配置错误按子消息独立上报，传输层错误触发重连而不是进程退出。
//! - 用 `thiserror` 的封闭枚举承载错误，因为本仓库的错误面是一张固定表格，
//!   不需要跨 crate 可扩展的开放错误域。
//!
//! # 契约说明（What）
//! - [`EngineError`] 是进程内部使用的错误类型，驱动 match 分支（慢路径丢包、健康检查重试等）；
//! - [`WireErrorCode`] 是线上错误码（0..=8），只在控制通道响应的 `err_code`
//!   字段中出现，与 [`EngineError`] 之间是一个多对一的映射（[`EngineError::wire_code`]）。

use std::fmt;

/// 进程内部错误枚举，覆盖 §7 表格列出的每一类错误来源。
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// C4 解析阶段遇到截断的 IP/TCP 头部。
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// C1 任意分配失败（arena 耗尽）。
    #[error("arena exhausted for cache `{cache}`")]
    AllocFailure { cache: &'static str },

    /// C4 慢路径在竞态中发现已有条目胜出。
    #[error("duplicate flow entry raced in bucket {bucket}")]
    DuplicateFlowRace { bucket: usize },

    /// C4 慢路径发现反向方向已经存在（由另一侧先建立）。
    #[error("reverse flow already exists for key {0:?}")]
    ReverseExists(crate::flow_table::FlowKey),

    /// C6 选择服务器时 `up_servers` 为空。
    #[error("no servers up for application {app:?}")]
    NoServersUp { app: String },

    /// C3 规则仍被引用，无法删除。
    #[error("rule {rule_id} is still referenced ({ref_count} bindings)")]
    RuleInUse { rule_id: u32, ref_count: u32 },

    /// C3 相关对象已存在（重复 id）。
    #[error("entity already exists: {0}")]
    AlreadyExists(String),

    /// C3 相关对象不存在。
    #[error("entity not found: {0}")]
    NotFound(String),

    /// C7 收到的帧未能通过校验（长度、子消息计数不一致）。
    #[error("malformed control frame: {0}")]
    MessageInvalid(&'static str),

    /// C7 管理器连接断开。
    #[error("manager disconnected")]
    ManagerDisconnected,

    /// 透传的 I/O 错误（套接字、监听）。
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// 将内部错误映射为控制通道线上错误码。
    ///
    /// # 契约（What）
    /// - 仅用于向管理器汇报单个子消息的处理结果；
    /// - 未在表中枚举的错误（如 `Io`、`ManagerDisconnected`）不会出现在子消息响应里，
    ///   它们属于传输层失败，由连接状态机处理，而不是某一条子消息的 `err_code`。
    pub fn wire_code(&self) -> WireErrorCode {
        match self {
            EngineError::AllocFailure { .. } => WireErrorCode::AllocFail,
            EngineError::DuplicateFlowRace { .. } => WireErrorCode::EntryOpFail,
            EngineError::ReverseExists(_) => WireErrorCode::EntryOpFail,
            EngineError::NoServersUp { .. } => WireErrorCode::EntryOpFail,
            EngineError::RuleInUse { .. } => WireErrorCode::EntryOpFail,
            EngineError::AlreadyExists(_) => WireErrorCode::EntryExists,
            EngineError::NotFound(_) => WireErrorCode::EntryAbsent,
            EngineError::MessageInvalid(_) => WireErrorCode::MessageInvalid,
            EngineError::MalformedPacket(_) => WireErrorCode::EntryInvalid,
            EngineError::Io(_) | EngineError::ManagerDisconnected => WireErrorCode::ConfigInvalid,
        }
    }
}

/// Line-level error codes carried in a control-channel response sub-message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum WireErrorCode {
    NoError = 0,
    AllocFail = 1,
    FreeFail = 2,
    EntryOpFail = 3,
    EntryInvalid = 4,
    EntryExists = 5,
    EntryAbsent = 6,
    MessageInvalid = 7,
    ConfigInvalid = 8,
}

impl WireErrorCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::NoError,
            1 => Self::AllocFail,
            2 => Self::FreeFail,
            3 => Self::EntryOpFail,
            4 => Self::EntryInvalid,
            5 => Self::EntryExists,
            6 => Self::EntryAbsent,
            7 => Self::MessageInvalid,
            8 => Self::ConfigInvalid,
            _ => return None,
        })
    }
}

impl fmt::Display for WireErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
