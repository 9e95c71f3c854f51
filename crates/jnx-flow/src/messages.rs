//! jnx-flow's C7 sub-message catalogue and dispatcher.
//!
//! # 设计背景（Why）
//! - 消息类型、操作码、负载结构体字段顺序均按照根目录设计文档里记录的线格式
//!   决定，字符串字段统一固定为 32 字节。
//! - 响应复用请求的子消息头并原地改写 `err_code`：
//!   [`JnxFlowMessageHandler::handle`] 把每个子消息的负载原样回显、仅替换
//!   `err_code`。

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use flow_core::arena::Slab;
use flow_core::control::{Frame, SubHeader, SubMessage, STR_SIZE, SUB_HEADER_LEN};
use flow_core::error::{EngineError, EngineResult, WireErrorCode};
use flow_core::flow_table::FlowEntry;
use flow_core::flow_table::FlowTable;
use flow_core::policy::{PolicyStore, Rule, RuleAction, RuleDirection, RuleMatch, ServiceSetAttrs, ServiceSetKind};

use crate::clear;

pub mod msg_type {
    pub const CONFIG_SVC_INFO: u8 = 1;
    pub const CONFIG_RULE_INFO: u8 = 2;
    pub const CONFIG_SVC_RULE_INFO: u8 = 3;
    pub const FETCH_FLOW_INFO: u8 = 4;
    pub const FETCH_RULE_INFO: u8 = 5;
    pub const FETCH_SVC_INFO: u8 = 6;
    pub const CLEAR_INFO: u8 = 7;
}

pub mod config_op {
    pub const ADD: u8 = 1;
    pub const DELETE: u8 = 2;
    pub const CHANGE: u8 = 3;
}

pub mod clear_op {
    pub const ALL: u8 = 1;
    pub const FOR_RULE: u8 = 3;
    pub const FOR_SERVICE: u8 = 4;
}

fn encode_name(buf: &mut BytesMut, name: &str) {
    let mut field = [0u8; STR_SIZE];
    let src = name.as_bytes();
    let len = src.len().min(STR_SIZE);
    field[..len].copy_from_slice(&src[..len]);
    buf.put_slice(&field);
}

fn decode_name(buf: &mut Bytes) -> EngineResult<String> {
    if buf.remaining() < STR_SIZE {
        return Err(EngineError::MessageInvalid("name field shorter than STR_SIZE"));
    }
    let mut raw = [0u8; STR_SIZE];
    buf.copy_to_slice(&mut raw);
    let end = raw.iter().position(|&b| b == 0).unwrap_or(STR_SIZE);
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}

/// `jnx_flow_msg_svc_info_t`.
#[derive(Clone, Debug)]
pub struct SvcInfoPayload {
    pub svc_index: u32,
    pub svc_name: String,
    pub svc_intf: String,
    pub svc_flags: u8,
    pub svc_type: u8,
    pub svc_rule_count: u16,
    pub svc_in_subunit: u32,
    pub svc_out_subunit: u32,
}

impl SvcInfoPayload {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(self.svc_index);
        encode_name(&mut buf, &self.svc_name);
        encode_name(&mut buf, &self.svc_intf);
        buf.put_u8(self.svc_flags);
        buf.put_u8(self.svc_type);
        buf.put_u16(self.svc_rule_count);
        buf.put_u32(self.svc_in_subunit);
        buf.put_u32(self.svc_out_subunit);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> EngineResult<Self> {
        if buf.remaining() < 4 {
            return Err(EngineError::MessageInvalid("svc_info payload too short"));
        }
        let svc_index = buf.get_u32();
        let svc_name = decode_name(&mut buf)?;
        let svc_intf = decode_name(&mut buf)?;
        if buf.remaining() < 12 {
            return Err(EngineError::MessageInvalid("svc_info payload truncated after names"));
        }
        Ok(Self {
            svc_index,
            svc_name,
            svc_intf,
            svc_flags: buf.get_u8(),
            svc_type: buf.get_u8(),
            svc_rule_count: buf.get_u16(),
            svc_in_subunit: buf.get_u32(),
            svc_out_subunit: buf.get_u32(),
        })
    }
}

/// Rule descriptor with its 5-tuple match flattened to individual fields,
/// the minimal shape needed for rule matching.
#[derive(Clone, Debug)]
pub struct RuleInfoPayload {
    pub rule_index: u32,
    pub rule_name: String,
    pub rule_action: u8,
    pub rule_direction: u8,
    pub rule_flags: u8,
    pub rule_src_mask: u32,
    pub rule_dst_mask: u32,
    pub src_addr: u32,
    pub dst_addr: u32,
    pub proto: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

impl RuleInfoPayload {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(self.rule_index);
        encode_name(&mut buf, &self.rule_name);
        buf.put_u8(self.rule_action);
        buf.put_u8(self.rule_direction);
        buf.put_u8(self.rule_flags);
        buf.put_u32(self.rule_src_mask);
        buf.put_u32(self.rule_dst_mask);
        buf.put_u32(self.src_addr);
        buf.put_u32(self.dst_addr);
        buf.put_u8(self.proto);
        buf.put_u16(self.src_port);
        buf.put_u16(self.dst_port);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> EngineResult<Self> {
        if buf.remaining() < 4 {
            return Err(EngineError::MessageInvalid("rule_info payload too short"));
        }
        let rule_index = buf.get_u32();
        let rule_name = decode_name(&mut buf)?;
        if buf.remaining() < 3 + 4 + 4 + 4 + 4 + 1 + 2 + 2 {
            return Err(EngineError::MessageInvalid("rule_info payload truncated"));
        }
        Ok(Self {
            rule_index,
            rule_name,
            rule_action: buf.get_u8(),
            rule_direction: buf.get_u8(),
            rule_flags: buf.get_u8(),
            rule_src_mask: buf.get_u32(),
            rule_dst_mask: buf.get_u32(),
            src_addr: buf.get_u32(),
            dst_addr: buf.get_u32(),
            proto: buf.get_u8(),
            src_port: buf.get_u16(),
            dst_port: buf.get_u16(),
        })
    }

    fn action(&self) -> RuleAction {
        if self.rule_action == 0 {
            RuleAction::Allow
        } else {
            RuleAction::Drop
        }
    }

    fn direction(&self) -> RuleDirection {
        match self.rule_direction {
            0 => RuleDirection::Input,
            1 => RuleDirection::Output,
            _ => RuleDirection::Any,
        }
    }

    fn rule_match(&self) -> RuleMatch {
        RuleMatch {
            src_addr: self.src_addr,
            src_mask: self.rule_src_mask,
            dst_addr: self.dst_addr,
            dst_mask: self.rule_dst_mask,
            proto: self.proto,
            src_port: self.src_port,
            dst_port: self.dst_port,
        }
    }
}

/// `jnx_flow_msg_svc_rule_info_t`.
#[derive(Clone, Copy, Debug)]
pub struct SvcRuleInfoPayload {
    pub svc_index: u32,
    pub position: u32,
    pub rule_index: u32,
}

impl SvcRuleInfoPayload {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(self.svc_index);
        buf.put_u32(self.position);
        buf.put_u32(self.rule_index);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> EngineResult<Self> {
        if buf.remaining() < 12 {
            return Err(EngineError::MessageInvalid("svc_rule_info payload too short"));
        }
        Ok(Self {
            svc_index: buf.get_u32(),
            position: buf.get_u32(),
            rule_index: buf.get_u32(),
        })
    }
}

/// Dispatches decoded [`Frame`]s from the manager connection against a
/// [`PolicyStore`] and the live flow table.
pub struct JnxFlowMessageHandler {
    pub policy: Arc<PolicyStore>,
    pub table: Arc<FlowTable>,
    pub arena: Arc<Slab<FlowEntry>>,
}

impl JnxFlowMessageHandler {
    /// Handle every sub-message in `frame`, returning a response frame with
    /// the same sub-message order, each payload echoed back and `err_code`
    /// set to the outcome.
    pub fn handle(&self, frame: &Frame) -> Frame {
        let mut responses = Vec::with_capacity(frame.sub_messages.len());
        for sub in &frame.sub_messages {
            let wire_code = self
                .handle_sub(frame.header.msg_type, sub)
                .err()
                .map(|e| e.wire_code())
                .unwrap_or(WireErrorCode::NoError);
            responses.push(SubMessage {
                header: SubHeader {
                    sub_type: sub.header.sub_type,
                    err_code: wire_code as u8,
                    sub_len: (SUB_HEADER_LEN + sub.payload.len()) as u16,
                },
                payload: sub.payload.clone(),
            });
        }
        Frame::new(frame.header.msg_type, frame.header.sequence_id, false, responses)
            .expect("response carries exactly as many sub-messages as the request")
    }

    fn handle_sub(&self, msg_type: u8, sub: &SubMessage) -> EngineResult<()> {
        match msg_type {
            msg_type::CONFIG_SVC_INFO => self.handle_svc(sub),
            msg_type::CONFIG_RULE_INFO => self.handle_rule(sub),
            msg_type::CONFIG_SVC_RULE_INFO => self.handle_svc_rule(sub),
            msg_type::CLEAR_INFO => self.handle_clear(sub),
            msg_type::FETCH_FLOW_INFO | msg_type::FETCH_RULE_INFO | msg_type::FETCH_SVC_INFO => Ok(()),
            _ => Err(EngineError::MessageInvalid("unknown top-level message type")),
        }
    }

    fn handle_svc(&self, sub: &SubMessage) -> EngineResult<()> {
        let payload = SvcInfoPayload::decode(sub.payload.clone())?;
        let kind = if payload.svc_type == 0 {
            ServiceSetKind::Interface
        } else {
            ServiceSetKind::Nexthop
        };
        let attrs = ServiceSetAttrs {
            id: payload.svc_index,
            name: payload.svc_name,
            kind,
            iif: Some(payload.svc_in_subunit),
            oif: Some(payload.svc_out_subunit),
        };
        match sub.header.sub_type {
            config_op::ADD => self.policy.service_set_add(attrs),
            config_op::DELETE => self.policy.service_set_delete(attrs.id),
            config_op::CHANGE => self.policy.service_set_change(attrs),
            _ => Err(EngineError::MessageInvalid("unknown config op for CONFIG_SVC_INFO")),
        }
    }

    fn handle_rule(&self, sub: &SubMessage) -> EngineResult<()> {
        let payload = RuleInfoPayload::decode(sub.payload.clone())?;
        match sub.header.sub_type {
            config_op::ADD => self.policy.rule_add(Rule::new(
                payload.rule_index,
                payload.rule_name.clone(),
                payload.action(),
                payload.direction(),
                payload.rule_match(),
            )),
            config_op::DELETE => self.policy.rule_delete(payload.rule_index),
            config_op::CHANGE => self.policy.rule_change(Rule::new(
                payload.rule_index,
                payload.rule_name.clone(),
                payload.action(),
                payload.direction(),
                payload.rule_match(),
            )),
            _ => Err(EngineError::MessageInvalid("unknown config op for CONFIG_RULE_INFO")),
        }
    }

    fn handle_svc_rule(&self, sub: &SubMessage) -> EngineResult<()> {
        let payload = SvcRuleInfoPayload::decode(sub.payload.clone())?;
        match sub.header.sub_type {
            config_op::ADD => self.policy.service_rule_add(payload.svc_index, payload.position, payload.rule_index),
            config_op::DELETE => self
                .policy
                .service_rule_delete(payload.svc_index, payload.position, payload.rule_index),
            _ => Err(EngineError::MessageInvalid("unknown config op for CONFIG_SVC_RULE_INFO")),
        }
    }

    fn handle_clear(&self, sub: &SubMessage) -> EngineResult<()> {
        match sub.header.sub_type {
            clear_op::ALL => {
                clear::clear_all(&self.table, &self.arena, &self.policy);
                Ok(())
            }
            clear_op::FOR_RULE => {
                if sub.payload.len() < 4 {
                    return Err(EngineError::MessageInvalid("clear-for-rule payload too short"));
                }
                let rule_id = u32::from_be_bytes(sub.payload[0..4].try_into().unwrap());
                clear::clear_for_rule(&self.table, &self.arena, &self.policy, rule_id);
                Ok(())
            }
            clear_op::FOR_SERVICE => {
                if sub.payload.len() < 4 {
                    return Err(EngineError::MessageInvalid("clear-for-service payload too short"));
                }
                let ss_id = u32::from_be_bytes(sub.payload[0..4].try_into().unwrap());
                clear::clear_for_service(&self.table, &self.arena, &self.policy, ss_id);
                Ok(())
            }
            _ => Err(EngineError::MessageInvalid("unsupported clear op code in this build")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_core::control::SubHeader;

    fn handler() -> JnxFlowMessageHandler {
        JnxFlowMessageHandler {
            policy: Arc::new(PolicyStore::new()),
            table: Arc::new(FlowTable::new()),
            arena: Arc::new(Slab::new("flow", 8, 1)),
        }
    }

    #[test]
    fn svc_info_round_trip_encodes_all_fields() {
        let payload = SvcInfoPayload {
            svc_index: 7,
            svc_name: "ss7".into(),
            svc_intf: "ge-0/0/0".into(),
            svc_flags: 0,
            svc_type: 0,
            svc_rule_count: 2,
            svc_in_subunit: 3,
            svc_out_subunit: 4,
        };
        let decoded = SvcInfoPayload::decode(payload.encode()).unwrap();
        assert_eq!(decoded.svc_index, 7);
        assert_eq!(decoded.svc_name, "ss7");
        assert_eq!(decoded.svc_intf, "ge-0/0/0");
        assert_eq!(decoded.svc_out_subunit, 4);
    }

    #[test]
    fn config_add_then_delete_service_set_via_frame() {
        let h = handler();
        let payload = SvcInfoPayload {
            svc_index: 1,
            svc_name: "a".into(),
            svc_intf: "ge-0/0/1".into(),
            svc_flags: 0,
            svc_type: 0,
            svc_rule_count: 0,
            svc_in_subunit: 0,
            svc_out_subunit: 0,
        };
        let add_sub = SubMessage {
            header: SubHeader {
                sub_type: config_op::ADD,
                err_code: 0,
                sub_len: (SUB_HEADER_LEN + payload.encode().len()) as u16,
            },
            payload: payload.encode(),
        };
        let frame = Frame::new(msg_type::CONFIG_SVC_INFO, 1, false, vec![add_sub]).unwrap();
        let response = h.handle(&frame);
        assert_eq!(response.sub_messages[0].header.err_code, WireErrorCode::NoError as u8);
        assert!(h.policy.service_set_by_id(1).is_some());

        let del_sub = SubMessage {
            header: SubHeader {
                sub_type: config_op::DELETE,
                err_code: 0,
                sub_len: (SUB_HEADER_LEN + payload.encode().len()) as u16,
            },
            payload: payload.encode(),
        };
        let frame = Frame::new(msg_type::CONFIG_SVC_INFO, 2, false, vec![del_sub]).unwrap();
        let response = h.handle(&frame);
        assert_eq!(response.sub_messages[0].header.err_code, WireErrorCode::NoError as u8);
        assert!(h.policy.service_set_by_id(1).is_none());
    }

    #[test]
    fn deleting_unknown_service_set_reports_entry_absent() {
        let h = handler();
        let payload = SvcInfoPayload {
            svc_index: 99,
            svc_name: String::new(),
            svc_intf: String::new(),
            svc_flags: 0,
            svc_type: 0,
            svc_rule_count: 0,
            svc_in_subunit: 0,
            svc_out_subunit: 0,
        };
        let sub = SubMessage {
            header: SubHeader {
                sub_type: config_op::DELETE,
                err_code: 0,
                sub_len: (SUB_HEADER_LEN + payload.encode().len()) as u16,
            },
            payload: payload.encode(),
        };
        let frame = Frame::new(msg_type::CONFIG_SVC_INFO, 1, false, vec![sub]).unwrap();
        let response = h.handle(&frame);
        assert_eq!(response.sub_messages[0].header.err_code, WireErrorCode::EntryAbsent as u8);
    }
}
