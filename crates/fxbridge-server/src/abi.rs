//! The native plugin ABI: the C vtable a plugin binary exports, the staged
//! loader around `libloading`, and the host-callback trampoline that routes
//! C callbacks to the owning instance.
//!
//! Callback routing is the awkward part: the plugin hands back whatever
//! effect pointer it was created with, but callbacks can arrive *during*
//! the entry call, before any effect pointer exists. Those early calls are
//! routed to the most recently loading instance, which is sound because
//! loads are serialized on the control thread.

use fxbridge::descriptor::EffectDescriptor;
use fxbridge::error::{BridgeError, LoadStage, Result};
use libloading::Library;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::c_void;
use std::path::Path;
use std::sync::{Arc, OnceLock, Weak};
use tracing::warn;

/// Value of [`NativeEffect::magic`] for a well-formed plugin.
pub const EFFECT_MAGIC: u32 = u32::from_le_bytes(*b"FXEF");

/// Exported entry symbol.
pub const ENTRY_SYMBOL: &[u8] = b"plugin_main\0";

// All ABI functions are C-unwind so a panicking in-process test plugin (and
// any Rust-built production plugin) unwinds into the fault guard instead of
// aborting.
pub type DispatchFn = unsafe extern "C-unwind" fn(
    effect: *mut NativeEffect,
    opcode: u32,
    index: i32,
    value: i64,
    data: *mut c_void,
    opt: f32,
) -> i64;
pub type ProcessFn = unsafe extern "C-unwind" fn(
    effect: *mut NativeEffect,
    inputs: *const *const f32,
    outputs: *mut *mut f32,
    frames: i32,
);
pub type ProcessF64Fn = unsafe extern "C-unwind" fn(
    effect: *mut NativeEffect,
    inputs: *const *const f64,
    outputs: *mut *mut f64,
    frames: i32,
);
pub type SetParamFn = unsafe extern "C-unwind" fn(effect: *mut NativeEffect, index: i32, value: f32);
pub type GetParamFn = unsafe extern "C-unwind" fn(effect: *mut NativeEffect, index: i32) -> f32;
pub type HostCallbackFn = unsafe extern "C-unwind" fn(
    effect: *mut NativeEffect,
    opcode: u32,
    index: i32,
    value: i64,
    data: *mut c_void,
    opt: f32,
) -> i64;
pub type EntryFn = unsafe extern "C-unwind" fn(callback: HostCallbackFn) -> *mut NativeEffect;

/// The vtable-and-fields struct the plugin's entry function returns. Plugin
/// owned; the bridge only ever borrows it.
#[repr(C)]
pub struct NativeEffect {
    pub magic: u32,
    pub version: u32,
    pub unique_id: u32,
    pub flags: u32,
    pub num_programs: i32,
    pub num_params: i32,
    pub num_inputs: i32,
    pub num_outputs: i32,
    pub initial_delay: i32,
    _pad: i32,
    pub dispatcher: Option<DispatchFn>,
    pub process: Option<ProcessFn>,
    pub process_replacing: Option<ProcessFn>,
    pub process_replacing_f64: Option<ProcessF64Fn>,
    pub set_parameter: Option<SetParamFn>,
    pub get_parameter: Option<GetParamFn>,
    /// Plugin-private state; the bridge never touches it.
    pub user: *mut c_void,
}

impl NativeEffect {
    /// Pack the plain fields into the shared descriptor shape.
    pub fn describe(&self) -> EffectDescriptor {
        EffectDescriptor {
            unique_id: self.unique_id,
            version: self.version,
            num_programs: self.num_programs.max(0) as u32,
            num_params: self.num_params.max(0) as u32,
            inputs: self.num_inputs.max(0) as u32,
            outputs: self.num_outputs.max(0) as u32,
            initial_delay: self.initial_delay.max(0) as u32,
            flags: self.flags,
        }
    }
}

/// Fixed-size native event cell. Larger payloads are truncated on the way
/// in; nothing in the supported opcode set carries more.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NativeEvent {
    pub kind: u32,
    pub delta_frames: i32,
    pub size: u32,
    _pad: u32,
    pub data: [u8; 16],
}

impl NativeEvent {
    pub fn new(kind: u32, delta_frames: i32, data: &[u8]) -> Self {
        let mut cell = [0u8; 16];
        let len = data.len().min(16);
        cell[..len].copy_from_slice(&data[..len]);
        Self {
            kind,
            delta_frames,
            size: len as u32,
            _pad: 0,
            data: cell,
        }
    }
}

/// What `ProcessEvents` hands the native dispatcher: a counted array of
/// event pointers.
#[repr(C)]
pub struct NativeEventList {
    pub count: u32,
    _pad: u32,
    pub events: *const *const NativeEvent,
}

impl NativeEventList {
    pub fn new(count: u32, events: *const *const NativeEvent) -> Self {
        Self {
            count,
            _pad: 0,
            events,
        }
    }
}

/// Receives host callbacks routed out of the C trampoline.
pub trait HostCallbackSink: Send + Sync {
    fn host_call(&self, opcode: u32, index: i32, value: i64, data: *mut c_void, opt: f32) -> i64;
}

struct Router {
    by_effect: HashMap<usize, Weak<dyn HostCallbackSink>>,
    /// Instance currently inside its entry call; loads are serialized, so
    /// at most one is pending at a time.
    loading: Option<Weak<dyn HostCallbackSink>>,
}

fn router() -> &'static Mutex<Router> {
    static ROUTER: OnceLock<Mutex<Router>> = OnceLock::new();
    ROUTER.get_or_init(|| {
        Mutex::new(Router {
            by_effect: HashMap::new(),
            loading: None,
        })
    })
}

/// Mark `sink` as the instance about to run a plugin entry function.
pub fn begin_loading(sink: &Arc<dyn HostCallbackSink>) {
    router().lock().loading = Some(Arc::downgrade(sink));
}

/// Bind a created effect pointer to its sink and clear the loading window.
pub fn register_effect(effect: *mut NativeEffect, sink: &Arc<dyn HostCallbackSink>) {
    let mut router = router().lock();
    router.by_effect.insert(effect as usize, Arc::downgrade(sink));
    router.loading = None;
}

pub fn unregister_effect(effect: *mut NativeEffect) {
    router().lock().by_effect.remove(&(effect as usize));
}

fn route(effect: *mut NativeEffect) -> Option<Arc<dyn HostCallbackSink>> {
    let router = router().lock();
    router
        .by_effect
        .get(&(effect as usize))
        .and_then(Weak::upgrade)
        .or_else(|| router.loading.as_ref().and_then(Weak::upgrade))
}

/// The callback handed to every plugin entry function.
pub unsafe extern "C-unwind" fn host_callback(
    effect: *mut NativeEffect,
    opcode: u32,
    index: i32,
    value: i64,
    data: *mut c_void,
    opt: f32,
) -> i64 {
    match route(effect) {
        Some(sink) => sink.host_call(opcode, index, value, data, opt),
        None => {
            warn!("Host callback {} from unknown effect {:p}", opcode, effect);
            0
        }
    }
}

/// A loaded plugin binary plus its instantiated effect.
#[derive(Debug)]
pub struct NativeHandle {
    effect: *mut NativeEffect,
    /// Keeps the binary mapped for as long as the effect lives. `None` when
    /// the effect came from an in-process entry function.
    _lib: Option<Library>,
}

// SAFETY: the vtable is only invoked under the instance's own serialization
// (control thread for dispatches, render thread for process calls).
unsafe impl Send for NativeHandle {}
unsafe impl Sync for NativeHandle {}

impl NativeHandle {
    /// Load a plugin binary from disk, instantiating it through
    /// `plugin_main`. Each failure names the stage it died in.
    pub fn load(path: &Path) -> Result<Self> {
        let fail = |stage: LoadStage, reason: String| BridgeError::LoadFailed {
            path: path.to_path_buf(),
            stage,
            reason,
        };

        if !path.exists() {
            return Err(fail(
                LoadStage::Scanning,
                "No such file".to_string(),
            ));
        }

        // SAFETY: loading a plugin binary runs its initializers; that is the
        // entire point of this process existing.
        let lib = unsafe { Library::new(path) }
            .map_err(|e| fail(LoadStage::Opening, e.to_string()))?;

        let entry: EntryFn = unsafe {
            *lib.get::<EntryFn>(ENTRY_SYMBOL)
                .map_err(|e| fail(LoadStage::Entry, e.to_string()))?
        };

        // SAFETY: the entry signature is the published ABI contract.
        let effect = unsafe { entry(host_callback) };
        if effect.is_null() {
            return Err(fail(
                LoadStage::Instantiation,
                "Entry function returned null".to_string(),
            ));
        }
        // SAFETY: non-null pointer from the entry function; magic is checked
        // before anything else is trusted.
        if unsafe { (*effect).magic } != EFFECT_MAGIC {
            return Err(fail(
                LoadStage::Magic,
                format!("Bad effect magic {:#x}", unsafe { (*effect).magic }),
            ));
        }
        if unsafe { (*effect).dispatcher }.is_none() {
            return Err(fail(
                LoadStage::Dispatcher,
                "Effect has no dispatcher".to_string(),
            ));
        }

        Ok(Self {
            effect,
            _lib: Some(lib),
        })
    }

    /// Instantiate from an in-process entry function. Test seam; also what
    /// a statically linked built-in effect would use.
    pub fn from_entry(entry: EntryFn) -> Result<Self> {
        // SAFETY: same contract as load().
        let effect = unsafe { entry(host_callback) };
        if effect.is_null() {
            return Err(BridgeError::Protocol(
                "In-process entry returned null".to_string(),
            ));
        }
        if unsafe { (*effect).magic } != EFFECT_MAGIC {
            return Err(BridgeError::Protocol("Bad effect magic".to_string()));
        }
        Ok(Self {
            effect,
            _lib: None,
        })
    }

    pub fn effect(&self) -> *mut NativeEffect {
        self.effect
    }

    pub fn describe(&self) -> EffectDescriptor {
        // SAFETY: effect validity established at construction.
        unsafe { (*self.effect).describe() }
    }

    /// Invoke the dispatcher.
    ///
    /// # Safety
    /// `data` must satisfy whatever the opcode's marshaling rule promises
    /// (valid scratch of the right size, NUL-terminated string, and so on).
    pub unsafe fn dispatch(
        &self,
        opcode: u32,
        index: i32,
        value: i64,
        data: *mut c_void,
        opt: f32,
    ) -> i64 {
        match (*self.effect).dispatcher {
            Some(f) => f(self.effect, opcode, index, value, data, opt),
            None => 0,
        }
    }

    pub fn set_parameter(&self, index: i32, value: f32) {
        // SAFETY: effect validity established at construction.
        unsafe {
            if let Some(f) = (*self.effect).set_parameter {
                f(self.effect, index, value);
            }
        }
    }

    pub fn get_parameter(&self, index: i32) -> f32 {
        // SAFETY: as set_parameter.
        unsafe {
            match (*self.effect).get_parameter {
                Some(f) => f(self.effect, index),
                None => 0.0,
            }
        }
    }

    /// # Safety
    /// Channel pointer arrays must cover the effect's channel counts and
    /// `frames` samples each.
    pub unsafe fn process_accumulate(
        &self,
        inputs: *const *const f32,
        outputs: *mut *mut f32,
        frames: i32,
    ) -> bool {
        match (*self.effect).process {
            Some(f) => {
                f(self.effect, inputs, outputs, frames);
                true
            }
            None => false,
        }
    }

    /// # Safety
    /// As [`Self::process_accumulate`].
    pub unsafe fn process_replacing(
        &self,
        inputs: *const *const f32,
        outputs: *mut *mut f32,
        frames: i32,
    ) -> bool {
        match (*self.effect).process_replacing {
            Some(f) => {
                f(self.effect, inputs, outputs, frames);
                true
            }
            None => false,
        }
    }

    /// # Safety
    /// As [`Self::process_accumulate`].
    pub unsafe fn process_replacing_f64(
        &self,
        inputs: *const *const f64,
        outputs: *mut *mut f64,
        frames: i32,
    ) -> bool {
        match (*self.effect).process_replacing_f64 {
            Some(f) => {
                f(self.effect, inputs, outputs, frames);
                true
            }
            None => false,
        }
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        unregister_effect(self.effect);
    }
}

/// Builder for in-process effects (the test plugin, built-ins).
impl NativeEffect {
    pub fn new_boxed(
        unique_id: u32,
        version: u32,
        inputs: i32,
        outputs: i32,
        num_params: i32,
        flags: u32,
        user: *mut c_void,
    ) -> Box<Self> {
        Box::new(Self {
            magic: EFFECT_MAGIC,
            version,
            unique_id,
            flags,
            num_programs: 0,
            num_params,
            num_inputs: inputs,
            num_outputs: outputs,
            initial_delay: 0,
            _pad: 0,
            dispatcher: None,
            process: None,
            process_replacing: None,
            process_replacing_f64: None,
            set_parameter: None,
            get_parameter: None,
            user,
        })
    }
}
