//! The bridge server: loads native plugin binaries in an isolated process
//! and serves the shared-memory protocol the `fxbridge` crate speaks.
//!
//! The binary entry point is thin (`main.rs`); everything testable lives
//! here so integration tests can run a full server in-process.

pub mod abi;
pub mod fault;
pub mod instance;
pub mod server;

#[doc(hidden)]
pub mod testplug;

pub use abi::{NativeEffect, NativeHandle, EFFECT_MAGIC};
pub use instance::BridgeInstance;
pub use server::{BridgeApp, InstanceRegistry, LoaderFn};
