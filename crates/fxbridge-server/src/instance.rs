//! One hosted plugin instance: a control thread answering messages and a
//! render thread answering audio calls, sharing a native effect behind a
//! lock.
//!
//! The control thread is the only place native dispatches run; the render
//! thread is the only place process calls run. Both take the native lock,
//! so the plugin itself never sees two vtable calls at once.

use crate::abi::{self, NativeEvent, NativeEventList, NativeHandle};
use crate::fault;
use crate::server::{host_alive, InstanceRegistry, LoaderFn};
use fxbridge::audio::{AudioSegment, ProcessMode};
use fxbridge::engine::{InboundHandler, MessagePump, Side};
use fxbridge::error::{BridgeError, Result};
use fxbridge::protocol::{
    audio_name, AudioReconfig, BridgeReply, HostOpcode, HostReply, Opcode, PluginEvent,
    ToBridge, ToHost, TransportBlock,
};
use fxbridge::shm::{AutomationBatch, SharedRegion, WAIT_POLL};
use fxbridge::translate::{PayloadRule, PostAction};
use parking_lot::{Mutex, ReentrantMutex};
use smallvec::SmallVec;
use std::cell::RefCell;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct InstanceShared {
    region: Arc<SharedRegion>,
    pump: MessagePump,
    loader: LoaderFn,
    registry: Arc<InstanceRegistry>,
    weak_self: Mutex<Weak<InstanceShared>>,
    /// Reentrant: a dispatch blocked on a host round trip may service a
    /// nested dispatch from the same control thread.
    native: ReentrantMutex<RefCell<Option<NativeHandle>>>,
    audio: Mutex<Option<AudioSegment>>,
    /// Expected audio segment name, set at load time; the segment itself is
    /// opened lazily on the first render call, after the host created it.
    audio_pending: Mutex<Option<String>>,
    pending_events: Mutex<Vec<PluginEvent>>,
    /// Render faults surfaced to the host from the control thread, since
    /// the render path cannot block on a message round trip.
    pending_error: Mutex<Option<String>>,
    /// Stable storage for the pointer answer to a `GetTime` callback.
    time_cell: Mutex<Box<TransportBlock>>,
    rendering: AtomicBool,
    editor_open: AtomicBool,
    /// Mains are on; the embedder may use this to boost the render thread.
    /// Recorded only, never acted on here.
    realtime_intent: AtomicBool,
    control_thread: Mutex<Option<ThreadId>>,
    close_requested: AtomicBool,
    native_closed: AtomicBool,
    torn_down: AtomicBool,
}

impl InstanceShared {
    fn new(region: Arc<SharedRegion>, loader: LoaderFn, registry: Arc<InstanceRegistry>) -> Self {
        Self {
            pump: MessagePump::new(Arc::clone(&region), Side::Bridge),
            region,
            loader,
            registry,
            weak_self: Mutex::new(Weak::new()),
            native: ReentrantMutex::new(RefCell::new(None)),
            audio: Mutex::new(None),
            audio_pending: Mutex::new(None),
            pending_events: Mutex::new(Vec::new()),
            pending_error: Mutex::new(None),
            time_cell: Mutex::new(Box::new(TransportBlock::default())),
            rendering: AtomicBool::new(false),
            editor_open: AtomicBool::new(false),
            realtime_intent: AtomicBool::new(false),
            control_thread: Mutex::new(None),
            close_requested: AtomicBool::new(false),
            native_closed: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        }
    }

    fn sink(&self) -> Option<Arc<dyn abi::HostCallbackSink>> {
        let strong = self.weak_self.lock().upgrade()?;
        let sink: Arc<dyn abi::HostCallbackSink> = strong;
        Some(sink)
    }

    fn alive(&self) -> bool {
        !self.region.header().quit.is_raised()
            && !self.torn_down.load(Ordering::Relaxed)
            && host_alive(self.region.host_pid())
    }

    /// Round trip to the host. Re-entrant servicing is only enabled on the
    /// control thread; callbacks from the render thread must not recurse
    /// into message handling.
    fn call_host(
        &self,
        opcode: HostOpcode,
        index: i32,
        value: i64,
        opt: f32,
        data: Option<Vec<u8>>,
    ) -> Result<HostReply> {
        let on_control = *self.control_thread.lock() == Some(std::thread::current().id());
        let handler = if on_control {
            Some(self as &dyn InboundHandler)
        } else {
            None
        };
        self.pump.send(
            &ToHost::Callback {
                opcode,
                index,
                value,
                opt,
                data,
            },
            handler,
            || self.alive(),
        )
    }

    // ---------------------------------------------------------------
    // Message handling (control thread)
    // ---------------------------------------------------------------

    fn handle_message(&self, message: ToBridge) -> BridgeReply {
        match message {
            ToBridge::Init {
                plugin_path,
                sample_rate,
                max_frames,
            } => match self.init(&plugin_path, sample_rate, max_frames) {
                Ok(name) => BridgeReply::Initialized { name },
                Err(e) => BridgeReply::Error {
                    message: e.to_string(),
                },
            },
            ToBridge::NewInstance {
                instance_id,
                region_name,
            } => match self.registry.spawn_attached(instance_id, region_name) {
                Ok(()) => BridgeReply::InstanceReady,
                Err(e) => BridgeReply::Error {
                    message: e.to_string(),
                },
            },
            ToBridge::Dispatch {
                opcode,
                index,
                value,
                opt,
                data,
            } => match self.dispatch_native(opcode, index, value, opt, data) {
                Ok((result, data)) => BridgeReply::Dispatched { result, data },
                Err(e) => BridgeReply::Error {
                    message: e.to_string(),
                },
            },
            ToBridge::SetParameter { index, value } => {
                match self.with_native(|native| {
                    fault::guard("set_parameter", || {
                        native.set_parameter(index as i32, value)
                    })
                }) {
                    Ok(()) => BridgeReply::Dispatched {
                        result: 0,
                        data: None,
                    },
                    Err(e) => BridgeReply::Error {
                        message: e.to_string(),
                    },
                }
            }
            ToBridge::GetParameter { index } => {
                match self.with_native(|native| {
                    fault::guard("get_parameter", || native.get_parameter(index as i32))
                }) {
                    Ok(value) => BridgeReply::ParameterValue { value },
                    Err(e) => BridgeReply::Error {
                        message: e.to_string(),
                    },
                }
            }
            ToBridge::Close => {
                self.close_requested.store(true, Ordering::Release);
                BridgeReply::Closed
            }
        }
    }

    fn with_native<T>(&self, f: impl FnOnce(&NativeHandle) -> Result<T>) -> Result<T> {
        let guard = self.native.lock();
        let cell = guard.borrow();
        let native = cell
            .as_ref()
            .ok_or_else(|| BridgeError::Protocol("No plugin loaded".to_string()))?;
        f(native)
    }

    fn init(&self, path: &std::path::Path, sample_rate: f64, max_frames: u32) -> Result<String> {
        if self.native.lock().borrow().is_some() {
            return Err(BridgeError::Protocol("Plugin already loaded".to_string()));
        }
        let sink = self.sink().ok_or(BridgeError::ShutDown)?;

        // Callbacks fired from inside the entry function have no effect
        // pointer to route by yet.
        abi::begin_loading(&sink);
        let native = (self.loader)(path)?;
        abi::register_effect(native.effect(), &sink);

        fault::guard("plugin setup", || {
            // SAFETY: null data is valid for these opcodes per their rules.
            unsafe {
                native.dispatch(
                    Opcode::SetSampleRate.as_raw(),
                    0,
                    0,
                    std::ptr::null_mut(),
                    sample_rate as f32,
                );
                native.dispatch(
                    Opcode::SetBlockSize.as_raw(),
                    0,
                    max_frames as i64,
                    std::ptr::null_mut(),
                    0.0,
                );
            }
        })?;

        let descriptor = native.describe();
        self.region.store_descriptor(&descriptor);

        let name = fault::guard("plugin name", || {
            let mut scratch = vec![0u8; fxbridge::translate::NAME_SCRATCH];
            // SAFETY: scratch covers the rule's promised size.
            unsafe {
                native.dispatch(
                    Opcode::GetPluginName.as_raw(),
                    0,
                    0,
                    scratch.as_mut_ptr() as *mut c_void,
                    0.0,
                );
            }
            let end = scratch.iter().position(|b| *b == 0).unwrap_or(scratch.len());
            String::from_utf8_lossy(&scratch[..end]).into_owned()
        })?;

        *self.audio_pending.lock() = Some(audio_name(self.region.name(), 0));
        *self.native.lock().borrow_mut() = Some(native);
        info!(
            "Loaded {} in region {} ({} params)",
            name,
            self.region.name(),
            descriptor.num_params
        );
        Ok(name)
    }

    fn dispatch_native(
        &self,
        opcode: Opcode,
        index: i32,
        value: i64,
        opt: f32,
        data: Option<Vec<u8>>,
    ) -> Result<(i64, Option<Vec<u8>>)> {
        // Opcodes the bridge answers itself, without a native call.
        match opcode {
            Opcode::ProcessEvents => {
                let events: Vec<PluginEvent> =
                    bincode::deserialize(&data.unwrap_or_default())?;
                self.pending_events.lock().extend(events);
                return Ok((1, None));
            }
            Opcode::UpdateAudioBuffer => {
                let reconfig: AudioReconfig =
                    bincode::deserialize(&data.unwrap_or_default())?;
                let segment = AudioSegment::open(reconfig.segment_name.clone())?;
                debug!(
                    "Reopened audio segment {} ({} frames)",
                    reconfig.segment_name, reconfig.max_frames
                );
                *self.audio.lock() = Some(segment);
                return Ok((1, None));
            }
            _ => {}
        }

        let rule = opcode.rule();
        let result = self.with_native(|native| {
            let mut host_bytes = data.unwrap_or_default();
            let mut scratch = Vec::new();
            let mut chunk_ptr: *mut c_void = std::ptr::null_mut();

            let ptr: *mut c_void = match rule.payload {
                PayloadRule::None => std::ptr::null_mut(),
                PayloadRule::HostData => host_bytes.as_mut_ptr() as *mut c_void,
                PayloadRule::Scratch(size) => {
                    scratch = vec![0u8; size];
                    scratch.as_mut_ptr() as *mut c_void
                }
                PayloadRule::HostDataScratch(size) => {
                    scratch = host_bytes.clone();
                    scratch.resize(scratch.len().max(size), 0);
                    scratch.as_mut_ptr() as *mut c_void
                }
                PayloadRule::ChunkOut => {
                    &mut chunk_ptr as *mut *mut c_void as *mut c_void
                }
            };

            let result = fault::guard(&format!("dispatch {:?}", opcode), || {
                // SAFETY: ptr satisfies the opcode's marshaling rule by
                // construction above.
                unsafe { native.dispatch(opcode.as_raw(), index, value, ptr, opt) }
            })?;

            let reply_data = match (rule.post, rule.payload) {
                (PostAction::CopyOut, PayloadRule::ChunkOut) => {
                    if result > 0 && !chunk_ptr.is_null() {
                        // SAFETY: the plugin promised `result` readable
                        // bytes behind the out-pointer.
                        let bytes = unsafe {
                            std::slice::from_raw_parts(chunk_ptr as *const u8, result as usize)
                        };
                        Some(bytes.to_vec())
                    } else {
                        Some(Vec::new())
                    }
                }
                (PostAction::CopyOut, _) => Some(scratch),
                (PostAction::UpdateDescriptor, _) => {
                    self.region.store_descriptor(&native.describe());
                    None
                }
                _ => None,
            };
            Ok((result, reply_data))
        })?;

        match opcode {
            Opcode::EditorOpen => self.editor_open.store(true, Ordering::Relaxed),
            Opcode::EditorClose => self.editor_open.store(false, Ordering::Relaxed),
            Opcode::MainsChanged => self.realtime_intent.store(value != 0, Ordering::Relaxed),
            _ => {}
        }
        if rule.post == PostAction::Teardown {
            self.native_closed.store(true, Ordering::Release);
            self.close_requested.store(true, Ordering::Release);
        }
        Ok(result)
    }

    // ---------------------------------------------------------------
    // Thread bodies
    // ---------------------------------------------------------------

    fn control_loop(&self) {
        *self.control_thread.lock() = Some(std::thread::current().id());
        let mut last_idle = Instant::now();
        loop {
            let worked = self.pump.service_one(self as &dyn InboundHandler);

            // Editors expect periodic idle ticks even when the host is quiet.
            if self.editor_open.load(Ordering::Relaxed)
                && last_idle.elapsed() >= Duration::from_millis(100)
            {
                last_idle = Instant::now();
                let _ = self.with_native(|native| {
                    fault::guard("editor idle", || {
                        // SAFETY: EditorIdle takes no data.
                        unsafe {
                            native.dispatch(
                                Opcode::EditorIdle.as_raw(),
                                0,
                                0,
                                std::ptr::null_mut(),
                                0.0,
                            )
                        }
                    })
                });
            }

            let pending = self.pending_error.lock().take();
            if let Some(message) = pending {
                let _ = self.call_host(
                    HostOpcode::ReportError,
                    0,
                    0,
                    0.0,
                    Some(message.into_bytes()),
                );
            }

            if self.close_requested.load(Ordering::Acquire) {
                debug!("Instance {} closing", self.region.instance_id());
                break;
            }
            if self.region.header().quit.is_raised() {
                debug!("Instance {} observed quit", self.region.instance_id());
                break;
            }
            if !host_alive(self.region.host_pid()) {
                warn!(
                    "Host {} is gone; tearing instance {} down",
                    self.region.host_pid(),
                    self.region.instance_id()
                );
                break;
            }
            if !worked {
                self.pump.wait_inbound(Instant::now() + WAIT_POLL);
            }
        }
        self.teardown();
    }

    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.native_closed.swap(true, Ordering::AcqRel) {
            let guard = self.native.lock();
            let borrow = guard.borrow();
            if let Some(native) = borrow.as_ref() {
                let _ = fault::guard("close dispatch", || {
                    // SAFETY: Close takes no data.
                    unsafe {
                        native.dispatch(
                            Opcode::Close.as_raw(),
                            0,
                            0,
                            std::ptr::null_mut(),
                            0.0,
                        )
                    }
                });
            }
        }
        self.region.header().thread_exit.raise();
        self.registry.instance_done(self.region.instance_id());
    }

    fn render_loop(&self) {
        let header = self.region.header();
        loop {
            if header.thread_exit.is_raised() {
                break;
            }
            let fired = header.render_request.wait(
                Some(Instant::now() + Duration::from_millis(50)),
                || !header.thread_exit.is_raised(),
            );
            if !fired {
                continue;
            }
            self.render_once();
            header.render_done.raise();
        }
    }

    fn render_once(&self) {
        self.rendering.store(true, Ordering::Release);
        if let Err(e) = self.render_inner() {
            if let Some(audio) = self.audio.lock().as_ref() {
                audio.silence_outputs();
            }
            *self.pending_error.lock() = Some(e.to_string());
        }
        self.rendering.store(false, Ordering::Release);
    }

    fn render_inner(&self) -> Result<()> {
        // Lazy-open the audio segment the host created after load.
        {
            let mut audio = self.audio.lock();
            if audio.is_none() {
                let name = self.audio_pending.lock().clone().ok_or_else(|| {
                    BridgeError::Protocol("Render call before load".to_string())
                })?;
                *audio = Some(AudioSegment::open(name)?);
            }
        }

        let mut batch = AutomationBatch::new();
        self.region.drain_automation(&mut batch);

        let events = std::mem::take(&mut *self.pending_events.lock());

        let native_guard = self.native.lock();
        let native_cell = native_guard.borrow();
        let native = native_cell
            .as_ref()
            .ok_or_else(|| BridgeError::Protocol("Render call before load".to_string()))?;
        let audio_guard = self.audio.lock();
        let audio = audio_guard
            .as_ref()
            .ok_or_else(|| BridgeError::Protocol("No audio segment".to_string()))?;

        let frames = audio.frames();
        let mode = audio
            .mode()
            .ok_or_else(|| BridgeError::Protocol("Invalid process mode".to_string()))?;

        fault::guard("render", || {
            for event in &batch {
                native.set_parameter(event.index as i32, event.value);
            }

            if !events.is_empty() {
                let cells: Vec<NativeEvent> = events
                    .iter()
                    .map(|e| NativeEvent::new(e.kind, e.delta_frames, &e.data))
                    .collect();
                let ptrs: Vec<*const NativeEvent> =
                    cells.iter().map(|c| c as *const NativeEvent).collect();
                let list = NativeEventList::new(cells.len() as u32, ptrs.as_ptr());
                // SAFETY: the list and its cells outlive the dispatch.
                unsafe {
                    native.dispatch(
                        Opcode::ProcessEvents.as_raw(),
                        0,
                        0,
                        &list as *const NativeEventList as *mut c_void,
                        0.0,
                    );
                }
            }

            match mode {
                ProcessMode::ReplaceF64 => {
                    let inputs: SmallVec<[*const f64; 16]> = (0..audio.in_channels())
                        .map(|c| audio.input_ptr(c) as *const f64)
                        .collect();
                    let mut outputs: SmallVec<[*mut f64; 16]> = (0..audio.out_channels())
                        .map(|c| audio.output_ptr(c) as *mut f64)
                        .collect();
                    // SAFETY: lanes are sized for max_frames f64 samples.
                    unsafe {
                        native.process_replacing_f64(
                            inputs.as_ptr(),
                            outputs.as_mut_ptr(),
                            frames as i32,
                        );
                    }
                }
                _ => {
                    let inputs: SmallVec<[*const f32; 16]> = (0..audio.in_channels())
                        .map(|c| audio.input_ptr(c) as *const f32)
                        .collect();
                    let mut outputs: SmallVec<[*mut f32; 16]> = (0..audio.out_channels())
                        .map(|c| audio.output_ptr(c) as *mut f32)
                        .collect();
                    // SAFETY: as above, for f32 lanes.
                    unsafe {
                        let called = match mode {
                            ProcessMode::Accumulate => native.process_accumulate(
                                inputs.as_ptr(),
                                outputs.as_mut_ptr(),
                                frames as i32,
                            ),
                            _ => native.process_replacing(
                                inputs.as_ptr(),
                                outputs.as_mut_ptr(),
                                frames as i32,
                            ),
                        };
                        if !called {
                            warn!("Plugin exposes no process function for {:?}", mode);
                        }
                    }
                }
            }
        })
    }
}

impl InboundHandler for InstanceShared {
    fn handle(&self, request: &[u8]) -> Vec<u8> {
        let reply = match bincode::deserialize::<ToBridge>(request) {
            Ok(message) => self.handle_message(message),
            Err(e) => BridgeReply::Error {
                message: format!("Undecodable request: {}", e),
            },
        };
        bincode::serialize(&reply).unwrap_or_default()
    }
}

impl abi::HostCallbackSink for InstanceShared {
    fn host_call(&self, opcode: u32, index: i32, value: i64, data: *mut c_void, opt: f32) -> i64 {
        let Some(opcode) = HostOpcode::from_raw(opcode) else {
            debug!("Plugin raised unknown host opcode {}", opcode);
            return 0;
        };

        match opcode {
            HostOpcode::GetTime => {
                let mask = value as u32;
                // During a render call the answer comes from the shared
                // cache; the host's audio thread is blocked on us and a
                // round trip would only add latency.
                let block = if self.rendering.load(Ordering::Acquire) {
                    self.region.load_transport().masked(mask)
                } else {
                    match self.call_host(HostOpcode::GetTime, index, value, opt, None) {
                        Ok(HostReply::Done {
                            data: Some(bytes), ..
                        }) => match bincode::deserialize(&bytes) {
                            Ok(block) => block,
                            Err(_) => self.region.load_transport().masked(mask),
                        },
                        _ => self.region.load_transport().masked(mask),
                    }
                };
                let mut cell = self.time_cell.lock();
                **cell = block;
                &**cell as *const TransportBlock as i64
            }
            HostOpcode::Automate => {
                match self.call_host(HostOpcode::Automate, index, 0, opt, None) {
                    Ok(HostReply::Done { result, .. }) => result,
                    _ => 0,
                }
            }
            HostOpcode::SizeWindow | HostOpcode::IoChanged => {
                match self.call_host(opcode, index, value, opt, None) {
                    Ok(HostReply::Done { result, .. }) => result,
                    _ => 0,
                }
            }
            // Bridge-generated only; a plugin raising it gets nothing.
            HostOpcode::ReportError => {
                let _ = data;
                0
            }
        }
    }
}

/// Thread pair for one instance.
pub struct BridgeInstance {
    shared: Arc<InstanceShared>,
    control: Option<std::thread::JoinHandle<()>>,
    render: Option<std::thread::JoinHandle<()>>,
}

impl BridgeInstance {
    pub fn spawn(
        region: Arc<SharedRegion>,
        loader: LoaderFn,
        registry: Arc<InstanceRegistry>,
    ) -> Result<Self> {
        registry.instance_started();
        let shared = Arc::new(InstanceShared::new(region, loader, registry));
        *shared.weak_self.lock() = Arc::downgrade(&shared);

        let instance_id = shared.region.instance_id();
        let control = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("fxbridge-ctl-{}", instance_id))
                .spawn(move || shared.control_loop())
                .map_err(|e| BridgeError::ConnectionFailed(e.to_string()))?
        };
        let render = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("fxbridge-dsp-{}", instance_id))
                .spawn(move || shared.render_loop())
                .map_err(|e| BridgeError::ConnectionFailed(e.to_string()))?
        };

        Ok(Self {
            shared,
            control: Some(control),
            render: Some(render),
        })
    }

    pub fn instance_id(&self) -> u32 {
        self.shared.region.instance_id()
    }

    /// True once the host switched mains on. An embedder that wants to
    /// raise the render thread's priority can poll this; the bridge itself
    /// makes no OS call.
    pub fn wants_realtime(&self) -> bool {
        self.shared.realtime_intent.load(Ordering::Relaxed)
    }

    pub fn join(mut self) {
        if let Some(handle) = self.control.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.render.take() {
            let _ = handle.join();
        }
    }
}
