//! C7 — Control channel wire protocol and connection state machine.
//!
//! # 设计背景（Why）
//! - 线格式：8 字节消息头（`msg_type, msg_count, msg_len, msg_id,
//!   more:1|rsvd:7, rsvd1`）后跟最多 250 个 4 字节子消息头
//!   （`msg_type, err_code, msg_len`）各自紧跟一段负载，统一使用网络字节序
//!   （大端），避免管理器与数据面进程字节序不一致时的隐患。
//! - `svc_name`/`rule_name` 等字符串字段裁定为 [`STR_SIZE`] = 32 字节，
//!   命中率与内存占用的折衷记录在根目录的设计文档里。
//! - `spark-transport-tcp` 的监听/重连循环结构（固定退避间隔、连接状态机、
//!   建联前的待发消息缓冲）在这里被泛化成单一管理器连接（而不是多对等体会话）。
//!
//! # 契约说明（What）
//! - [`MessageHeader`]/[`SubHeader`] 是线格式的编解码原语；
//! - [`Frame`] 把一个消息头和最多 [`MAX_SUB_MESSAGES`] 个子消息打包、校验长度一致性；
//! - [`ControlChannel`] 维护连接状态机：断开时把出站帧压入有界 FIFO，
//!   建联后按顺序重放；每次连接失败按 [`RECONNECT_INTERVAL`] 退避重试。

use std::collections::VecDeque;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, instrument, warn};

use crate::error::{EngineError, EngineResult};

/// Width of fixed-size name fields carried in config sub-messages.
pub const STR_SIZE: usize = 32;

/// A single frame never carries more than this many sub-messages; a larger
/// response batch sets `more=1` and continues in a fresh frame.
pub const MAX_SUB_MESSAGES: usize = 250;

pub const HEADER_LEN: usize = 8;
pub const SUB_HEADER_LEN: usize = 4;

/// Backoff between reconnect attempts while the manager link is down.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(60);

/// Bound on the pre-ESTABLISHED outbound FIFO; beyond this the oldest queued
/// frame is dropped rather than growing unbounded while disconnected.
pub const PENDING_QUEUE_CAPACITY: usize = 1024;

/// Wire-level message header (`jnx_flow_msg_header_info_t`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MessageHeader {
    pub msg_type: u8,
    pub sub_count: u8,
    pub total_len: u16,
    pub sequence_id: u16,
    pub more: bool,
}

impl MessageHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.msg_type);
        buf.put_u8(self.sub_count);
        buf.put_u16(self.total_len);
        buf.put_u16(self.sequence_id);
        buf.put_u8(if self.more { 0b1 } else { 0 });
        buf.put_u8(0); // rsvd1
    }

    pub fn decode(buf: &mut Bytes) -> EngineResult<Self> {
        if buf.remaining() < HEADER_LEN {
            return Err(EngineError::MessageInvalid("truncated message header"));
        }
        let msg_type = buf.get_u8();
        let sub_count = buf.get_u8();
        let total_len = buf.get_u16();
        let sequence_id = buf.get_u16();
        let flags = buf.get_u8();
        let _rsvd1 = buf.get_u8();
        Ok(Self {
            msg_type,
            sub_count,
            total_len,
            sequence_id,
            more: flags & 0b1 != 0,
        })
    }
}

/// Wire-level sub-message header (`jnx_flow_msg_sub_header_info_t`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SubHeader {
    pub sub_type: u8,
    pub err_code: u8,
    pub sub_len: u16,
}

impl SubHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.sub_type);
        buf.put_u8(self.err_code);
        buf.put_u16(self.sub_len);
    }

    pub fn decode(buf: &mut Bytes) -> EngineResult<Self> {
        if buf.remaining() < SUB_HEADER_LEN {
            return Err(EngineError::MessageInvalid("truncated sub-header"));
        }
        Ok(Self {
            sub_type: buf.get_u8(),
            err_code: buf.get_u8(),
            sub_len: buf.get_u16(),
        })
    }
}

/// One decoded sub-message: its header plus the raw payload bytes that
/// followed it (callers downcast the payload per `sub_type`).
#[derive(Clone, Debug)]
pub struct SubMessage {
    pub header: SubHeader,
    pub payload: Bytes,
}

/// A fully framed control message: one header, up to [`MAX_SUB_MESSAGES`]
/// sub-messages.
#[derive(Clone, Debug)]
pub struct Frame {
    pub header: MessageHeader,
    pub sub_messages: Vec<SubMessage>,
}

impl Frame {
    pub fn new(msg_type: u8, sequence_id: u16, more: bool, sub_messages: Vec<SubMessage>) -> EngineResult<Self> {
        if sub_messages.len() > MAX_SUB_MESSAGES {
            return Err(EngineError::MessageInvalid("too many sub-messages for one frame"));
        }
        let header = MessageHeader {
            msg_type,
            sub_count: sub_messages.len() as u8,
            total_len: 0, // filled in by `encode`
            sequence_id,
            more,
        };
        Ok(Self { header, sub_messages })
    }

    pub fn encode(&self) -> EngineResult<Bytes> {
        let mut body = BytesMut::new();
        for sub in &self.sub_messages {
            let expected_len = SUB_HEADER_LEN + sub.payload.len();
            if usize::from(sub.header.sub_len) != expected_len {
                return Err(EngineError::MessageInvalid("sub_len does not match payload"));
            }
            sub.header.encode(&mut body);
            body.put_slice(&sub.payload);
        }
        let total_len = HEADER_LEN + body.len();
        let total_len: u16 = total_len
            .try_into()
            .map_err(|_| EngineError::MessageInvalid("frame exceeds u16 length field"))?;

        let mut out = BytesMut::with_capacity(usize::from(total_len));
        let header = MessageHeader {
            total_len,
            ..self.header
        };
        header.encode(&mut out);
        out.put_slice(&body);
        Ok(out.freeze())
    }

    /// Decode a single frame from `buf`, which must contain at least
    /// `header.total_len` bytes (the caller's framing reader is responsible
    /// for buffering until a full frame is available; see [`read_frame`]).
    pub fn decode(mut buf: Bytes) -> EngineResult<Self> {
        let header = MessageHeader::decode(&mut buf)?;
        if usize::from(header.sub_count) > MAX_SUB_MESSAGES {
            return Err(EngineError::MessageInvalid("sub_count exceeds protocol maximum"));
        }
        let mut sub_messages = Vec::with_capacity(usize::from(header.sub_count));
        for _ in 0..header.sub_count {
            let sub_header = SubHeader::decode(&mut buf)?;
            let payload_len = usize::from(sub_header.sub_len)
                .checked_sub(SUB_HEADER_LEN)
                .ok_or(EngineError::MessageInvalid("sub_len shorter than sub-header"))?;
            if buf.remaining() < payload_len {
                return Err(EngineError::MessageInvalid("truncated sub-message payload"));
            }
            let payload = buf.split_to(payload_len);
            sub_messages.push(SubMessage {
                header: sub_header,
                payload,
            });
        }
        Ok(Self { header, sub_messages })
    }
}

/// Read exactly one length-prefixed frame off `stream`: peek the 8-byte
/// header to learn `total_len`, then read the remainder.
#[instrument(skip(stream))]
pub async fn read_frame(stream: &mut TcpStream) -> EngineResult<Frame> {
    let mut header_buf = [0u8; HEADER_LEN];
    stream.read_exact(&mut header_buf).await?;
    let mut peek = Bytes::copy_from_slice(&header_buf);
    let header = MessageHeader::decode(&mut peek)?;

    let remaining = usize::from(header.total_len)
        .checked_sub(HEADER_LEN)
        .ok_or(EngineError::MessageInvalid("total_len shorter than header"))?;
    let mut rest = vec![0u8; remaining];
    stream.read_exact(&mut rest).await?;

    let mut whole = BytesMut::with_capacity(HEADER_LEN + remaining);
    whole.put_slice(&header_buf);
    whole.put_slice(&rest);
    Frame::decode(whole.freeze())
}

pub async fn write_frame(stream: &mut TcpStream, frame: &Frame) -> EngineResult<()> {
    let bytes = frame.encode()?;
    stream.write_all(&bytes).await?;
    Ok(())
}

/// Connection-state machine for the manager link: a fresh
/// process starts `Disconnected`, and every outbound frame generated before
/// `Established` is queued rather than dropped, so the first successful
/// connect replays everything the engine wanted to report.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Established,
}

/// Transport-agnostic half of the control channel: owns the pending FIFO and
/// state transitions. The actual `TcpStream` lifecycle (connect/backoff/read
/// loop) lives in each binary crate's `main`, since jnx-flow and equilibrium
/// listen for different peer addresses and config sources.
pub struct ControlChannel {
    state: LinkState,
    pending: VecDeque<Frame>,
    next_sequence_id: u16,
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlChannel {
    pub fn new() -> Self {
        Self {
            state: LinkState::Disconnected,
            pending: VecDeque::new(),
            next_sequence_id: 1,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn next_sequence_id(&mut self) -> u16 {
        let id = self.next_sequence_id;
        self.next_sequence_id = self.next_sequence_id.wrapping_add(1).max(1);
        id
    }

    /// Queue a frame for transmission. If already `Established`, the caller
    /// is expected to write it immediately instead; this path exists for the
    /// `Disconnected`/`Connecting` states.
    pub fn enqueue(&mut self, frame: Frame) {
        if self.pending.len() >= PENDING_QUEUE_CAPACITY {
            self.pending.pop_front();
            warn!("control channel pending queue full, dropping oldest frame");
        }
        self.pending.push_back(frame);
    }

    pub fn mark_connecting(&mut self) {
        self.state = LinkState::Connecting;
    }

    pub fn mark_established(&mut self) {
        self.state = LinkState::Established;
        debug!(pending = self.pending.len(), "control channel established");
    }

    pub fn mark_disconnected(&mut self) {
        self.state = LinkState::Disconnected;
    }

    /// Drain every pending frame in FIFO order, for replay right after the
    /// transition to `Established`.
    pub fn drain_pending(&mut self) -> Vec<Frame> {
        self.pending.drain(..).collect()
    }
}
