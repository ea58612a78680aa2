//! Mirrored plugin effect descriptor.
//!
//! The bridge copies the hosted plugin's capability struct into the shared
//! region in two pointer-width layouts so a 32-bit host can read the
//! descriptor of a plugin loaded by a 64-bit bridge (and vice versa). Only
//! the bridge writes these blocks, and only through an explicit update step
//! after calls that can change them.

use serde::{Deserialize, Serialize};

pub const DESCRIPTOR_MAGIC: u32 = u32::from_le_bytes(*b"FXED");

pub mod effect_flags {
    pub const HAS_EDITOR: u32 = 1 << 0;
    pub const CAN_REPLACING: u32 = 1 << 1;
    pub const CAN_DOUBLE_REPLACING: u32 = 1 << 2;
    pub const IS_SYNTH: u32 = 1 << 3;
    pub const NO_SOUND_IN_STOP: u32 = 1 << 4;
    pub const PROGRAM_CHUNKS: u32 = 1 << 5;
}

/// Process-local view of the hosted plugin's capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectDescriptor {
    pub unique_id: u32,
    pub version: u32,
    pub num_programs: u32,
    pub num_params: u32,
    pub inputs: u32,
    pub outputs: u32,
    pub initial_delay: u32,
    pub flags: u32,
}

impl EffectDescriptor {
    pub fn has_editor(&self) -> bool {
        self.flags & effect_flags::HAS_EDITOR != 0
    }

    pub fn can_replacing(&self) -> bool {
        self.flags & effect_flags::CAN_REPLACING != 0
    }

    pub fn can_double_replacing(&self) -> bool {
        self.flags & effect_flags::CAN_DOUBLE_REPLACING != 0
    }
}

/// Descriptor as written by a 32-bit bridge process.
///
/// The `object` and `user` fields are pointer-sized in the native struct;
/// they are opaque to the host and carried only so the layout matches.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct RawDescriptor32 {
    pub magic: u32,
    pub object: u32,
    pub user: u32,
    pub unique_id: u32,
    pub version: u32,
    pub num_programs: u32,
    pub num_params: u32,
    pub inputs: u32,
    pub outputs: u32,
    pub initial_delay: u32,
    pub flags: u32,
}

/// Descriptor as written by a 64-bit bridge process.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct RawDescriptor64 {
    pub magic: u32,
    _pad: u32,
    pub object: u64,
    pub user: u64,
    pub unique_id: u32,
    pub version: u32,
    pub num_programs: u32,
    pub num_params: u32,
    pub inputs: u32,
    pub outputs: u32,
    pub initial_delay: u32,
    pub flags: u32,
}

impl EffectDescriptor {
    /// Produce both raw variants for the shared region.
    pub fn to_raw(&self) -> (RawDescriptor32, RawDescriptor64) {
        let raw32 = RawDescriptor32 {
            magic: DESCRIPTOR_MAGIC,
            object: 0,
            user: 0,
            unique_id: self.unique_id,
            version: self.version,
            num_programs: self.num_programs,
            num_params: self.num_params,
            inputs: self.inputs,
            outputs: self.outputs,
            initial_delay: self.initial_delay,
            flags: self.flags,
        };
        let raw64 = RawDescriptor64 {
            magic: DESCRIPTOR_MAGIC,
            _pad: 0,
            object: 0,
            user: 0,
            unique_id: self.unique_id,
            version: self.version,
            num_programs: self.num_programs,
            num_params: self.num_params,
            inputs: self.inputs,
            outputs: self.outputs,
            initial_delay: self.initial_delay,
            flags: self.flags,
        };
        (raw32, raw64)
    }

    pub fn from_raw32(raw: &RawDescriptor32) -> Option<Self> {
        if raw.magic != DESCRIPTOR_MAGIC {
            return None;
        }
        Some(Self {
            unique_id: raw.unique_id,
            version: raw.version,
            num_programs: raw.num_programs,
            num_params: raw.num_params,
            inputs: raw.inputs,
            outputs: raw.outputs,
            initial_delay: raw.initial_delay,
            flags: raw.flags,
        })
    }

    pub fn from_raw64(raw: &RawDescriptor64) -> Option<Self> {
        if raw.magic != DESCRIPTOR_MAGIC {
            return None;
        }
        Some(Self {
            unique_id: raw.unique_id,
            version: raw.version,
            num_programs: raw.num_programs,
            num_params: raw.num_params,
            inputs: raw.inputs,
            outputs: raw.outputs,
            initial_delay: raw.initial_delay,
            flags: raw.flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EffectDescriptor {
        EffectDescriptor {
            unique_id: 0x4647_4e31,
            version: 2,
            num_programs: 1,
            num_params: 4,
            inputs: 2,
            outputs: 2,
            initial_delay: 64,
            flags: effect_flags::CAN_REPLACING | effect_flags::CAN_DOUBLE_REPLACING,
        }
    }

    #[test]
    fn test_both_widths_decode_identically() {
        let desc = sample();
        let (raw32, raw64) = desc.to_raw();
        assert_eq!(EffectDescriptor::from_raw32(&raw32), Some(desc));
        assert_eq!(EffectDescriptor::from_raw64(&raw64), Some(desc));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let (mut raw32, mut raw64) = sample().to_raw();
        raw32.magic = 0;
        raw64.magic = 0xdead_beef;
        assert_eq!(EffectDescriptor::from_raw32(&raw32), None);
        assert_eq!(EffectDescriptor::from_raw64(&raw64), None);
    }

    #[test]
    fn test_flag_helpers() {
        let desc = sample();
        assert!(desc.can_replacing());
        assert!(desc.can_double_replacing());
        assert!(!desc.has_editor());
    }
}
