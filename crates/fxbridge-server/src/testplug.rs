//! In-process reference effect: a stereo gain plugin speaking the full
//! native ABI, including host callbacks and a deliberate crash path.
//!
//! Built unconditionally (not just under `cfg(test)`) so the integration
//! tests can inject it through the loader seam, and so there is always one
//! known-good effect to exercise a deployment with.

use crate::abi::{HostCallbackFn, NativeEffect, NativeEventList, EFFECT_MAGIC};
use fxbridge::HostOpcode;
use std::ffi::{c_void, CStr};

const PARAM_GAIN: i32 = 0;

struct State {
    gain: f32,
    sample_rate: f32,
    chunk: [u8; 4],
    events_seen: u32,
    host: HostCallbackFn,
    effect: *mut NativeEffect,
}

unsafe fn state<'a>(effect: *mut NativeEffect) -> &'a mut State {
    &mut *((*effect).user as *mut State)
}

unsafe extern "C-unwind" fn dispatcher(
    effect: *mut NativeEffect,
    opcode: u32,
    _index: i32,
    value: i64,
    data: *mut c_void,
    opt: f32,
) -> i64 {
    let st = state(effect);
    match opcode {
        // Open / Close
        0 | 1 => 1,
        // SetSampleRate
        9 => {
            st.sample_rate = opt;
            1
        }
        // SetBlockSize / MainsChanged
        10 | 11 => 1,
        // EditorGetRect: four i32 edges
        12 => {
            let rect = data as *mut i32;
            rect.write(0);
            rect.add(1).write(0);
            rect.add(2).write(400);
            rect.add(3).write(300);
            1
        }
        // GetChunk: out-pointer to a plugin-owned blob
        16 => {
            st.chunk = st.gain.to_le_bytes();
            (data as *mut *const u8).write(st.chunk.as_ptr());
            st.chunk.len() as i64
        }
        // SetChunk
        17 => {
            if value as usize >= 4 && !data.is_null() {
                let mut bytes = [0u8; 4];
                std::ptr::copy_nonoverlapping(data as *const u8, bytes.as_mut_ptr(), 4);
                st.gain = f32::from_le_bytes(bytes);
                1
            } else {
                0
            }
        }
        // ProcessEvents
        18 => {
            let list = data as *const NativeEventList;
            if !list.is_null() {
                st.events_seen += (*list).count;
            }
            1
        }
        // CanBeAutomated
        19 => 1,
        // GetPluginName / GetProductName
        22 | 24 => {
            write_str(data, "Test Gain");
            1
        }
        // GetVendorName
        23 => {
            write_str(data, "fxbridge");
            1
        }
        // GetVendorVersion
        25 => 1,
        // CanDo
        26 => can_do(st, data),
        _ => 0,
    }
}

unsafe fn write_str(data: *mut c_void, s: &str) {
    let dst = data as *mut u8;
    std::ptr::copy_nonoverlapping(s.as_ptr(), dst, s.len());
    dst.add(s.len()).write(0);
}

unsafe fn can_do(st: &mut State, data: *mut c_void) -> i64 {
    if data.is_null() {
        return 0;
    }
    let what = CStr::from_ptr(data as *const std::ffi::c_char).to_string_lossy();
    match what.as_ref() {
        // Deliberate fault path for isolation tests.
        "explode" => panic!("explode requested"),
        // Host round trip: ask for the time, report whether it arrived.
        "time" => {
            let ptr = (st.host)(
                st.effect,
                HostOpcode::GetTime.as_raw(),
                0,
                0,
                std::ptr::null_mut(),
                0.0,
            );
            if ptr != 0 {
                1
            } else {
                0
            }
        }
        "gain" => 1,
        _ => 0,
    }
}

unsafe extern "C-unwind" fn process_accumulate(
    effect: *mut NativeEffect,
    inputs: *const *const f32,
    outputs: *mut *mut f32,
    frames: i32,
) {
    let st = state(effect);
    for channel in 0..2usize {
        let input = *inputs.add(channel);
        let output = *outputs.add(channel);
        for i in 0..frames as usize {
            *output.add(i) += *input.add(i) * st.gain;
        }
    }
}

unsafe extern "C-unwind" fn process_replacing(
    effect: *mut NativeEffect,
    inputs: *const *const f32,
    outputs: *mut *mut f32,
    frames: i32,
) {
    let st = state(effect);
    for channel in 0..2usize {
        let input = *inputs.add(channel);
        let output = *outputs.add(channel);
        for i in 0..frames as usize {
            *output.add(i) = *input.add(i) * st.gain;
        }
    }
}

unsafe extern "C-unwind" fn process_replacing_f64(
    effect: *mut NativeEffect,
    inputs: *const *const f64,
    outputs: *mut *mut f64,
    frames: i32,
) {
    let st = state(effect);
    for channel in 0..2usize {
        let input = *inputs.add(channel);
        let output = *outputs.add(channel);
        for i in 0..frames as usize {
            *output.add(i) = *input.add(i) * st.gain as f64;
        }
    }
}

unsafe extern "C-unwind" fn set_parameter(effect: *mut NativeEffect, index: i32, value: f32) {
    if index == PARAM_GAIN {
        state(effect).gain = value;
    }
}

unsafe extern "C-unwind" fn get_parameter(effect: *mut NativeEffect, index: i32) -> f32 {
    if index == PARAM_GAIN {
        state(effect).gain
    } else {
        0.0
    }
}

/// Entry function, same shape as the `plugin_main` a binary would export.
pub unsafe extern "C-unwind" fn plugin_main(callback: HostCallbackFn) -> *mut NativeEffect {
    let mut effect = NativeEffect::new_boxed(
        u32::from_le_bytes(*b"gain"),
        1,
        2,
        2,
        1,
        0,
        std::ptr::null_mut(),
    );
    effect.magic = EFFECT_MAGIC;
    effect.dispatcher = Some(dispatcher);
    effect.process = Some(process_accumulate);
    effect.process_replacing = Some(process_replacing);
    effect.process_replacing_f64 = Some(process_replacing_f64);
    effect.set_parameter = Some(set_parameter);
    effect.get_parameter = Some(get_parameter);

    let effect = Box::into_raw(effect);
    let state = Box::new(State {
        gain: 1.0,
        sample_rate: 44100.0,
        chunk: [0; 4],
        events_seen: 0,
        host: callback,
        effect,
    });
    (*effect).user = Box::into_raw(state) as *mut c_void;
    effect
}
