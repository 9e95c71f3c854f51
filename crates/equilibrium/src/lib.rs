//! equilibrium: HTTP reverse-proxy load balancer data-plane service.
//!
//! Wires `flow-core`'s shared arena/flow-table/policy-store/control-channel
//! primitives into the rewrite packet-worker variant described in
//! [`worker`], the application/server catalogue and least-load selection in
//! [`server`], the health prober in [`health`], the incremental checksum
//! helper in [`checksum`], plus this service's own control-message
//! catalogue ([`messages`]) and clear-session command handling ([`clear`]).

pub mod checksum;
pub mod clear;
pub mod config;
pub mod health;
pub mod messages;
pub mod server;
pub mod worker;

pub use config::Config;
pub use worker::EquilibriumEngine;
