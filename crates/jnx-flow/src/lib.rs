//! jnx-flow: 5-tuple flow classifier data-plane service.
//!
//! Wires `flow-core`'s shared arena/flow-table/policy-store/control-channel
//! primitives into the ALLOW/DROP packet-worker variant described in
//! [`worker`], plus this service's own control-message catalogue
//! ([`messages`]) and clear-flow command handling ([`clear`]).

pub mod clear;
pub mod config;
pub mod messages;
pub mod worker;

pub use config::Config;
pub use worker::JnxFlowEngine;
