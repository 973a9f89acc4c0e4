//! Shared types and the correlation core for the nfsdig probes
//!
//! This crate provides the data structures and constants shared between
//! the eBPF kernel programs and the userspace daemon, and the handler logic
//! itself: stores, emitters, begin/end pairing, the RPC task lifecycle and
//! the packet classifier. Everything here is allocation free and bounded so
//! that the kernel programs can call it directly.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod classifier;
pub mod constants;
pub mod emit;
pub mod fault;
pub mod pairing;
pub mod registry;
pub mod rpc;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use constants::*;
pub use emit::{BoundedQueue, EmitError, EventSink};
pub use pairing::{LatencyUnit, Outcome, ProbeCtx};
pub use registry::{ClientOp, IoOp, NfsdOp};
pub use rpc::{RpcMaps, RpcTaskArgs};
pub use store::{CorrelationStore, FixedMap, Slot, SlotKey, StoreError};
pub use types::*;
