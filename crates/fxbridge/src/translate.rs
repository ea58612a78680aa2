//! Marshaling rules per dispatch opcode.
//!
//! Instead of a bespoke code path per opcode, every opcode maps to one
//! [`OpcodeRule`] describing what travels in the data payload and what
//! happens after the native call returns. Both processes consult the same
//! table: the host to decide what bytes to send and whether to expect bytes
//! back, the server to decide what pointer to hand the native dispatcher and
//! what to copy out afterwards.

use crate::protocol::Opcode;

/// Scratch size for string-returning opcodes (names, labels, displays).
pub const NAME_SCRATCH: usize = 256;

/// Scratch size for the editor rectangle (four i32 edges).
pub const RECT_SCRATCH: usize = 16;

/// What the data payload carries into the native call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadRule {
    /// No data pointer; the dispatcher gets null.
    None,
    /// Host supplies bytes; the dispatcher gets a pointer to them.
    HostData,
    /// Server allocates a zeroed scratch buffer of this size for the plugin
    /// to fill.
    Scratch(usize),
    /// Host bytes go in, but the plugin may also overwrite them in place
    /// (server copies host bytes into a scratch of at least this size).
    HostDataScratch(usize),
    /// Plugin hands back an internally-owned blob via an out-pointer; the
    /// call result is its length.
    ChunkOut,
}

/// What happens after the native dispatcher returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostAction {
    None,
    /// Reply carries the (possibly truncated) scratch/chunk bytes back.
    CopyOut,
    /// Server re-reads the native descriptor and rewrites the shared blocks.
    UpdateDescriptor,
    /// Server reopens the audio segment from the reconfig carried in data.
    ResizeAudio,
    /// Server tears the instance down after replying.
    Teardown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeRule {
    pub payload: PayloadRule,
    pub post: PostAction,
}

const fn rule(payload: PayloadRule, post: PostAction) -> OpcodeRule {
    OpcodeRule { payload, post }
}

impl Opcode {
    pub fn rule(self) -> OpcodeRule {
        use PayloadRule::*;
        use PostAction as P;

        match self {
            Opcode::Open => rule(None, P::None),
            Opcode::Close => rule(None, P::Teardown),

            Opcode::SetProgram => rule(None, P::None),
            Opcode::GetProgram => rule(None, P::None),
            Opcode::SetProgramName => rule(HostData, P::None),
            Opcode::GetProgramName => rule(Scratch(NAME_SCRATCH), P::CopyOut),
            Opcode::GetParamLabel => rule(Scratch(NAME_SCRATCH), P::CopyOut),
            Opcode::GetParamDisplay => rule(Scratch(NAME_SCRATCH), P::CopyOut),
            Opcode::GetParamName => rule(Scratch(NAME_SCRATCH), P::CopyOut),

            Opcode::SetSampleRate => rule(None, P::None),
            Opcode::SetBlockSize => rule(None, P::None),
            Opcode::MainsChanged => rule(None, P::None),

            Opcode::EditorGetRect => rule(Scratch(RECT_SCRATCH), P::CopyOut),
            Opcode::EditorOpen => rule(None, P::None),
            Opcode::EditorClose => rule(None, P::None),
            Opcode::EditorIdle => rule(None, P::None),

            Opcode::GetChunk => rule(ChunkOut, P::CopyOut),
            Opcode::SetChunk => rule(HostData, P::None),
            Opcode::ProcessEvents => rule(HostData, P::None),

            Opcode::CanBeAutomated => rule(None, P::None),
            Opcode::GetInputProperties => rule(Scratch(NAME_SCRATCH), P::CopyOut),
            Opcode::GetOutputProperties => rule(Scratch(NAME_SCRATCH), P::CopyOut),

            Opcode::GetPluginName => rule(Scratch(NAME_SCRATCH), P::CopyOut),
            Opcode::GetVendorName => rule(Scratch(NAME_SCRATCH), P::CopyOut),
            Opcode::GetProductName => rule(Scratch(NAME_SCRATCH), P::CopyOut),
            Opcode::GetVendorVersion => rule(None, P::None),
            Opcode::CanDo => rule(HostData, P::None),

            Opcode::SetSpeakerArrangement => rule(HostData, P::UpdateDescriptor),
            Opcode::GetSpeakerArrangement => {
                rule(HostDataScratch(NAME_SCRATCH), P::CopyOut)
            }

            Opcode::UpdateAudioBuffer => rule(HostData, P::ResizeAudio),
        }
    }

    /// Whether the host should expect reply bytes for this opcode.
    pub fn returns_data(self) -> bool {
        matches!(self.rule().post, PostAction::CopyOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_getters_use_scratch() {
        for op in [
            Opcode::GetProgramName,
            Opcode::GetParamName,
            Opcode::GetPluginName,
            Opcode::GetVendorName,
        ] {
            assert_eq!(op.rule().payload, PayloadRule::Scratch(NAME_SCRATCH));
            assert!(op.returns_data());
        }
    }

    #[test]
    fn test_state_setters_carry_host_data() {
        for op in [Opcode::SetChunk, Opcode::ProcessEvents, Opcode::CanDo] {
            assert_eq!(op.rule().payload, PayloadRule::HostData);
            assert!(!op.returns_data());
        }
    }

    #[test]
    fn test_close_tears_down() {
        assert_eq!(Opcode::Close.rule().post, PostAction::Teardown);
    }

    #[test]
    fn test_chunk_out_copies_back() {
        let r = Opcode::GetChunk.rule();
        assert_eq!(r.payload, PayloadRule::ChunkOut);
        assert_eq!(r.post, PostAction::CopyOut);
    }

    #[test]
    fn test_descriptor_refresh_after_speaker_change() {
        assert_eq!(
            Opcode::SetSpeakerArrangement.rule().post,
            PostAction::UpdateDescriptor
        );
    }
}
