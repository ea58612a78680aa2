//! Wire protocol for the plugin bridge.
//!
//! Message bodies are serde enums encoded with bincode into fixed-size
//! shared-memory slots (see [`crate::slot`]). Anything pointer-shaped is
//! reduced to sizes, indices and byte blobs before it crosses the process
//! boundary; local pointers are reconstructed on the far side from the
//! per-opcode rules in [`crate::translate`].

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::path::PathBuf;

/// Dispatch opcodes the host sends into the hosted plugin.
///
/// The discriminant is the value passed to the plugin's native dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Opcode {
    Open = 0,
    Close = 1,
    SetProgram = 2,
    GetProgram = 3,
    SetProgramName = 4,
    GetProgramName = 5,
    GetParamLabel = 6,
    GetParamDisplay = 7,
    GetParamName = 8,
    SetSampleRate = 9,
    SetBlockSize = 10,
    MainsChanged = 11,
    EditorGetRect = 12,
    EditorOpen = 13,
    EditorClose = 14,
    EditorIdle = 15,
    GetChunk = 16,
    SetChunk = 17,
    ProcessEvents = 18,
    CanBeAutomated = 19,
    GetInputProperties = 20,
    GetOutputProperties = 21,
    GetPluginName = 22,
    GetVendorName = 23,
    GetProductName = 24,
    GetVendorVersion = 25,
    CanDo = 26,
    SetSpeakerArrangement = 27,
    GetSpeakerArrangement = 28,
    /// Vendor-specific: reconfigure the audio-path segment.
    UpdateAudioBuffer = 29,
}

impl Opcode {
    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

/// Callback opcodes the hosted plugin raises back into the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum HostOpcode {
    /// Parameter moved from the plugin side (editor knob, internal LFO).
    Automate = 0,
    /// Current transport/time info. Served from the cached block while a
    /// render call is in flight.
    GetTime = 1,
    /// Editor asks the host to resize its window.
    SizeWindow = 2,
    /// Channel counts or latency changed; host should re-read the descriptor.
    IoChanged = 3,
    /// Non-fatal diagnostic routed to the host's error reporting path.
    ReportError = 4,
}

impl HostOpcode {
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => HostOpcode::Automate,
            1 => HostOpcode::GetTime,
            2 => HostOpcode::SizeWindow,
            3 => HostOpcode::IoChanged,
            4 => HostOpcode::ReportError,
            _ => return None,
        })
    }
}

/// Host to bridge message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ToBridge {
    /// Load the plugin binary and fill the descriptor blocks in the region.
    Init {
        plugin_path: PathBuf,
        sample_rate: f64,
        max_frames: u32,
    },
    /// Attach a further instance (own region, own thread pair) to this
    /// bridge process.
    NewInstance {
        instance_id: u32,
        region_name: String,
    },
    Dispatch {
        opcode: Opcode,
        index: i32,
        value: i64,
        opt: f32,
        data: Option<Vec<u8>>,
    },
    SetParameter {
        index: u32,
        value: f32,
    },
    GetParameter {
        index: u32,
    },
    Close,
}

/// Bridge to host reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BridgeReply {
    /// Plugin loaded; the descriptor blocks in the region are now valid.
    Initialized { name: String },
    InstanceReady,
    Dispatched { result: i64, data: Option<Vec<u8>> },
    ParameterValue { value: f32 },
    Closed,
    Error { message: String },
}

/// Bridge to host call (plugin callback forwarded across the boundary).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ToHost {
    Callback {
        opcode: HostOpcode,
        index: i32,
        value: i64,
        opt: f32,
        data: Option<Vec<u8>>,
    },
}

/// Host to bridge reply for a [`ToHost`] call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HostReply {
    Done { result: i64, data: Option<Vec<u8>> },
    Error { message: String },
}

/// One flattened entry of an event list.
///
/// The native list shape (linked/array hybrid) is only known after walking
/// it, so the sending side flattens into these before marshaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginEvent {
    pub delta_frames: i32,
    pub kind: u32,
    pub data: SmallVec<[u8; 16]>,
}

impl PluginEvent {
    pub fn new(delta_frames: i32, kind: u32, data: &[u8]) -> Self {
        Self {
            delta_frames,
            kind,
            data: SmallVec::from_slice(data),
        }
    }
}

/// Payload of [`Opcode::UpdateAudioBuffer`]: the new audio segment geometry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioReconfig {
    pub segment_name: String,
    pub inputs: u32,
    pub outputs: u32,
    pub max_frames: u32,
}

/// One pending automation change, queued in the shared ring.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(C)]
pub struct AutomationEvent {
    pub index: u32,
    pub value: f32,
}

pub mod transport_flags {
    pub const PLAYING: u32 = 1 << 0;
    pub const RECORDING: u32 = 1 << 1;
    pub const CYCLE_ACTIVE: u32 = 1 << 2;
    pub const TEMPO_VALID: u32 = 1 << 3;
    pub const TIME_SIG_VALID: u32 = 1 << 4;
    pub const POSITION_VALID: u32 = 1 << 5;
    pub const CYCLE_VALID: u32 = 1 << 6;

    /// Flags always answered regardless of what the caller asked for.
    pub const ALWAYS: u32 = PLAYING | RECORDING | CYCLE_ACTIVE;
}

/// Cached transport/time block.
///
/// Lives in the shared region behind a seqlock so `GetTime` callbacks during
/// rendering never need a message round trip. All fields are explicit-width
/// scalars; the block is shared as-is between 32- and 64-bit processes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[repr(C)]
pub struct TransportBlock {
    pub flags: u32,
    _pad: u32,
    pub sample_rate: f64,
    pub position_samples: i64,
    pub tempo: f64,
    pub position_quarters: f64,
    pub bar_start_quarters: f64,
    pub cycle_start_quarters: f64,
    pub cycle_end_quarters: f64,
    pub time_sig_numerator: i32,
    pub time_sig_denominator: i32,
}

impl Default for TransportBlock {
    fn default() -> Self {
        Self {
            flags: 0,
            _pad: 0,
            sample_rate: 44100.0,
            position_samples: 0,
            tempo: 120.0,
            position_quarters: 0.0,
            bar_start_quarters: 0.0,
            cycle_start_quarters: 0.0,
            cycle_end_quarters: 0.0,
            time_sig_numerator: 4,
            time_sig_denominator: 4,
        }
    }
}

impl TransportBlock {
    /// Restrict validity flags to the subset the caller asked for.
    pub fn masked(mut self, mask: u32) -> Self {
        self.flags &= transport_flags::ALWAYS | mask;
        self
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Prefix for every shared segment name.
    pub name_prefix: String,
    /// Capacity of the audio-path segment, in frames per channel.
    pub max_frames: usize,
    /// Explicit server executable; defaults to `fxbridge-server` next to
    /// the current executable.
    pub server_path: Option<PathBuf>,
    /// How long to wait for the spawned server to attach.
    pub attach_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name_prefix: "fxbridge".to_string(),
            max_frames: 8192,
            server_path: None,
            attach_timeout_ms: 5000,
        }
    }
}

/// Name of an instance's primary shared region.
///
/// Scoped by host pid plus a per-instance counter so concurrently running
/// hosts never collide.
pub fn region_name(prefix: &str, host_pid: u32, instance_id: u32) -> String {
    format!("{}-{}-{}", prefix, host_pid, instance_id)
}

/// Name of an auxiliary payload segment hanging off a region. `side`
/// distinguishes the two creators so their counters cannot collide.
pub fn aux_name(region: &str, side: &str, seq: u64) -> String {
    format!("{}-aux-{}-{}", region, side, seq)
}

/// Name of the audio-path segment for a region, by resize generation.
pub fn audio_name(region: &str, generation: u32) -> String {
    format!("{}-audio-{}", region, generation)
}
