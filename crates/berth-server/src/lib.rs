//! Berth control-plane service
//!
//! Wires the engine crates together: the gRPC surface served over QUIC,
//! the broker consumer feeding the reconciler, and configuration.

#![deny(missing_docs)]

pub mod config;
pub mod consumer;
pub mod service;
