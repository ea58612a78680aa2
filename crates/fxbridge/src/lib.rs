//! Out-of-process plugin hosting over shared memory.
//!
//! This crate is the host-side half of the bridge: it spawns `fxbridge-server`,
//! hands it a shared region per plugin instance, and exchanges every call
//! through fixed message slots in that region. Audio sample data rides a
//! dedicated resizable segment so render calls never queue behind control
//! traffic.
//!
//! ## Benefits
//!
//! - **Crash isolation**: a faulting plugin takes down the bridge process,
//!   never the host
//! - **Bitness bridging**: the shared layout uses explicit-width fields, so
//!   a 64-bit host can drive a 32-bit bridge
//! - **Re-entrancy**: plugin callbacks are serviced even while the host is
//!   blocked on its own call, matching how native hosts behave in-process
//!
//! ## Usage
//!
//! ```ignore
//! use fxbridge::{BridgeConfig, BridgeProcess, Opcode};
//!
//! let bridge = BridgeProcess::spawn(BridgeConfig::default())?;
//! let plugin = bridge.load("/path/to/effect.so".as_ref(), 44100.0)?;
//!
//! plugin.dispatch(Opcode::Open, 0, 0, 0.0, None)?;
//! plugin.set_parameter(0, 0.5)?;
//! plugin.process_replacing(&[&left, &right], &mut [&mut out_l, &mut out_r])?;
//! ```

pub mod error;
pub use error::{BridgeError, LoadStage, Result};

mod client;
pub use client::{BridgeProcess, BridgedPlugin, HostEvent, PREFIX_ENV};

pub mod descriptor;
pub use descriptor::{effect_flags, EffectDescriptor};

#[doc(hidden)]
pub mod protocol;

pub use protocol::{
    transport_flags, AudioReconfig, AutomationEvent, BridgeConfig, BridgeReply, HostOpcode,
    HostReply, Opcode, PluginEvent, ToBridge, ToHost, TransportBlock,
};

pub mod translate;
pub use translate::{OpcodeRule, PayloadRule, PostAction};

#[doc(hidden)]
pub mod shm;

#[doc(hidden)]
pub mod slot;

pub mod audio;
pub use audio::{AudioSegment, ProcessMode};

pub mod engine;
pub use engine::{InboundHandler, MessagePump, Side};
