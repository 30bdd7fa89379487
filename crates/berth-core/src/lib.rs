//! Core domain logic for the Berth control plane
//!
//! This crate holds the pieces that do not talk to the outside world
//! directly: the domain model, the seams behind which the store and the
//! cluster live, the lifecycle reconciler, the port-exposure engine, and
//! the exec session setup. The `berth-store` and `berth-kube` crates
//! implement the seams; `berth-server` wires everything together.

#![deny(missing_docs)]

pub mod cluster;
pub mod domain;
pub mod exec;
pub mod ports;
pub mod reconciler;
pub mod store;

pub use berth_common::{Error, Result};
pub use exec::ExecBridge;
pub use ports::{PortEngine, PortOutcome, PortRequest};
pub use reconciler::Reconciler;
