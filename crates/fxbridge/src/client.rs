//! Host-side API: spawn the bridge server, load plugins, dispatch calls and
//! run audio through them.
//!
//! [`BridgeProcess`] owns the spawned server executable and the bootstrap
//! region. [`BridgedPlugin`] is one hosted instance: it owns the instance's
//! message pump, its audio segment and a background service thread that
//! answers plugin callbacks whenever the host is not already servicing them
//! from inside a blocked dispatch.

use crate::audio::{AudioSegment, ProcessMode};
use crate::descriptor::EffectDescriptor;
use crate::engine::{InboundHandler, MessagePump, Side};
use crate::error::{BridgeError, Result};
use crate::protocol::{
    audio_name, region_name, AutomationEvent, AudioReconfig, BridgeConfig, BridgeReply,
    HostOpcode, HostReply, Opcode, PluginEvent, ToBridge, ToHost, TransportBlock,
};
use crate::shm::{SharedRegion, WAIT_POLL};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Environment variable the server reads to learn the segment name prefix.
pub const PREFIX_ENV: &str = "FXBRIDGE_PREFIX";

/// Asynchronous notifications surfaced by plugin callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// The plugin moved one of its own parameters (editor knob, internal
    /// modulation).
    ParameterAutomated { index: u32, value: f32 },
    /// The editor asked for a new window size.
    WindowResize { width: i32, height: i32 },
    /// Channel counts or latency changed; re-read the descriptor.
    IoChanged,
    /// Non-fatal diagnostic from the bridge (including render faults).
    PluginError { message: String },
}

/// Answers [`ToHost`] callbacks. Shared between the background service
/// thread and any dispatch call that services re-entrantly while blocked.
struct HostCallbackHandler {
    region: Arc<SharedRegion>,
    events: Sender<HostEvent>,
}

impl HostCallbackHandler {
    fn reply(reply: &HostReply) -> Vec<u8> {
        bincode::serialize(reply).unwrap_or_default()
    }
}

impl InboundHandler for HostCallbackHandler {
    fn handle(&self, request: &[u8]) -> Vec<u8> {
        let call: ToHost = match bincode::deserialize(request) {
            Ok(call) => call,
            Err(e) => {
                return Self::reply(&HostReply::Error {
                    message: format!("Undecodable host call: {}", e),
                });
            }
        };
        let ToHost::Callback {
            opcode,
            index,
            value,
            opt,
            data,
        } = call;

        let reply = match opcode {
            HostOpcode::GetTime => {
                let block = self.region.load_transport().masked(value as u32);
                match bincode::serialize(&block) {
                    Ok(bytes) => HostReply::Done {
                        result: 1,
                        data: Some(bytes),
                    },
                    Err(e) => HostReply::Error {
                        message: format!("Failed to encode transport: {}", e),
                    },
                }
            }
            HostOpcode::Automate => {
                let _ = self.events.send(HostEvent::ParameterAutomated {
                    index: index as u32,
                    value: opt,
                });
                HostReply::Done {
                    result: 0,
                    data: None,
                }
            }
            HostOpcode::SizeWindow => {
                let _ = self.events.send(HostEvent::WindowResize {
                    width: index,
                    height: value as i32,
                });
                HostReply::Done {
                    result: 1,
                    data: None,
                }
            }
            HostOpcode::IoChanged => {
                let _ = self.events.send(HostEvent::IoChanged);
                HostReply::Done {
                    result: 1,
                    data: None,
                }
            }
            HostOpcode::ReportError => {
                let message = data
                    .as_deref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                warn!("Plugin reported: {}", message);
                let _ = self.events.send(HostEvent::PluginError { message });
                HostReply::Done {
                    result: 0,
                    data: None,
                }
            }
        };
        Self::reply(&reply)
    }
}

/// One spawned bridge server process.
///
/// Concurrently running bridge processes in the same host must use distinct
/// [`BridgeConfig::name_prefix`] values, since the bootstrap region name is
/// derived only from the prefix and the host pid.
pub struct BridgeProcess {
    child: Mutex<Child>,
    config: BridgeConfig,
    bootstrap: Arc<SharedRegion>,
    bootstrap_pump: Arc<MessagePump>,
    next_instance: AtomicU32,
}

impl BridgeProcess {
    /// Spawn the server executable and wait for it to attach to the
    /// bootstrap region.
    pub fn spawn(config: BridgeConfig) -> Result<Self> {
        let host_pid = std::process::id();
        let bootstrap_name = region_name(&config.name_prefix, host_pid, 0);
        let bootstrap = SharedRegion::create(bootstrap_name.clone(), host_pid, 0)?;

        let exe = match &config.server_path {
            Some(path) => path.clone(),
            None => default_server_path()?,
        };
        info!("Spawning bridge server {} for {}", exe.display(), bootstrap_name);

        let child = Command::new(&exe)
            .arg(host_pid.to_string())
            .env(PREFIX_ENV, &config.name_prefix)
            .spawn()
            .map_err(|e| {
                BridgeError::ConnectionFailed(format!(
                    "Failed to spawn bridge server {}: {}",
                    exe.display(),
                    e
                ))
            })?;
        let child = Mutex::new(child);

        let deadline = Instant::now() + Duration::from_millis(config.attach_timeout_ms);
        let attached = bootstrap.header().attached.wait(Some(deadline), || {
            child.lock().try_wait().map(|s| s.is_none()).unwrap_or(false)
        });
        if !attached {
            let _ = child.lock().kill();
            return Err(BridgeError::ConnectionFailed(format!(
                "Bridge server did not attach to {} within {}ms",
                bootstrap_name, config.attach_timeout_ms
            )));
        }

        let bootstrap_pump = Arc::new(MessagePump::new(Arc::clone(&bootstrap), Side::Host));
        Ok(Self {
            child,
            config,
            bootstrap,
            bootstrap_pump,
            next_instance: AtomicU32::new(0),
        })
    }

    /// Load a plugin binary into the server, as a new instance.
    pub fn load(&self, plugin_path: &Path, sample_rate: f64) -> Result<BridgedPlugin> {
        let instance_id = self.next_instance.fetch_add(1, Ordering::Relaxed);

        let (region, pump) = if instance_id == 0 {
            (Arc::clone(&self.bootstrap), Arc::clone(&self.bootstrap_pump))
        } else {
            let name = region_name(&self.config.name_prefix, std::process::id(), instance_id);
            let region = SharedRegion::create(name.clone(), std::process::id(), instance_id)?;
            let reply: BridgeReply = self.bootstrap_pump.send(
                &ToBridge::NewInstance {
                    instance_id,
                    region_name: name,
                },
                None,
                || self.child_alive(),
            )?;
            match reply {
                BridgeReply::InstanceReady => {}
                BridgeReply::Error { message } => return Err(BridgeError::Protocol(message)),
                other => {
                    return Err(BridgeError::Protocol(format!(
                        "Unexpected reply to instance attach: {:?}",
                        other
                    )))
                }
            }
            let pump = Arc::new(MessagePump::new(Arc::clone(&region), Side::Host));
            (region, pump)
        };

        BridgedPlugin::over_pump(region, pump, plugin_path, sample_rate, &self.config)
    }

    fn child_alive(&self) -> bool {
        self.child
            .lock()
            .try_wait()
            .map(|status| status.is_none())
            .unwrap_or(false)
    }
}

impl Drop for BridgeProcess {
    fn drop(&mut self) {
        // Ask nicely first; the server also watches for host death on its
        // own, so the kill below is a backstop.
        self.bootstrap.header().quit.raise();
        let deadline = Instant::now() + Duration::from_millis(500);
        loop {
            match self.child.lock().try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                _ => break,
            }
        }
        warn!("Bridge server did not exit; killing it");
        let _ = self.child.lock().kill();
    }
}

fn default_server_path() -> Result<PathBuf> {
    let exe = std::env::current_exe().map_err(|e| {
        BridgeError::ConnectionFailed(format!("Cannot locate current executable: {}", e))
    })?;
    let dir = exe.parent().ok_or_else(|| {
        BridgeError::ConnectionFailed("Current executable has no parent directory".to_string())
    })?;
    let name = if cfg!(windows) {
        "fxbridge-server.exe"
    } else {
        "fxbridge-server"
    };
    Ok(dir.join(name))
}

/// One bridged plugin instance.
pub struct BridgedPlugin {
    region: Arc<SharedRegion>,
    pump: Arc<MessagePump>,
    handler: Arc<HostCallbackHandler>,
    events: Receiver<HostEvent>,
    audio: Mutex<AudioSegment>,
    audio_generation: AtomicU32,
    name: String,
    closed: AtomicBool,
    service_stop: Arc<AtomicBool>,
    service: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl BridgedPlugin {
    /// Build an instance over an already-attached region. Used by
    /// [`BridgeProcess::load`]; also the seam for in-process testing.
    pub fn over_pump(
        region: Arc<SharedRegion>,
        pump: Arc<MessagePump>,
        plugin_path: &Path,
        sample_rate: f64,
        config: &BridgeConfig,
    ) -> Result<Self> {
        let (events_tx, events_rx) = unbounded();
        let handler = Arc::new(HostCallbackHandler {
            region: Arc::clone(&region),
            events: events_tx,
        });

        let mut transport = TransportBlock::default();
        transport.sample_rate = sample_rate;
        region.store_transport(&transport);

        let reply: BridgeReply = pump.send(
            &ToBridge::Init {
                plugin_path: plugin_path.to_path_buf(),
                sample_rate,
                max_frames: config.max_frames as u32,
            },
            Some(handler.as_ref() as &dyn InboundHandler),
            || !region.header().thread_exit.is_raised(),
        )?;
        let name = match reply {
            BridgeReply::Initialized { name } => name,
            BridgeReply::Error { message } => return Err(BridgeError::Protocol(message)),
            other => {
                return Err(BridgeError::Protocol(format!(
                    "Unexpected reply to load: {:?}",
                    other
                )))
            }
        };

        let descriptor = region.load_descriptor().ok_or_else(|| {
            BridgeError::Protocol("Server reported success but wrote no descriptor".to_string())
        })?;
        info!(
            "Loaded {} ({} in, {} out, {} params)",
            name, descriptor.inputs, descriptor.outputs, descriptor.num_params
        );

        // The server opens the generation-0 segment by the same derived name
        // right after a successful load.
        let audio = AudioSegment::create(
            audio_name(region.name(), 0),
            descriptor.inputs as usize,
            descriptor.outputs as usize,
            config.max_frames,
        )?;

        let plugin = Self {
            region,
            pump,
            handler,
            events: events_rx,
            audio: Mutex::new(audio),
            audio_generation: AtomicU32::new(0),
            name,
            closed: AtomicBool::new(false),
            service_stop: Arc::new(AtomicBool::new(false)),
            service: Mutex::new(None),
        };
        plugin.start_service_thread();
        Ok(plugin)
    }

    fn start_service_thread(&self) {
        let pump = Arc::clone(&self.pump);
        let handler = Arc::clone(&self.handler);
        let stop = Arc::clone(&self.service_stop);
        let handle = std::thread::Builder::new()
            .name(format!("fxbridge-host-{}", self.region.instance_id()))
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if !pump.service_one(handler.as_ref() as &dyn InboundHandler) {
                        pump.wait_inbound(Instant::now() + WAIT_POLL);
                    }
                }
            });
        match handle {
            Ok(handle) => *self.service.lock() = Some(handle),
            Err(e) => warn!("Failed to spawn host service thread: {}", e),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current effect description, re-read from the shared blocks. Refresh
    /// after [`HostEvent::IoChanged`].
    pub fn descriptor(&self) -> Result<EffectDescriptor> {
        self.region
            .load_descriptor()
            .ok_or_else(|| BridgeError::Protocol("Descriptor block is invalid".to_string()))
    }

    /// Pending callback notifications, non-blocking.
    pub fn events(&self) -> &Receiver<HostEvent> {
        &self.events
    }

    fn bridge_alive(&self) -> bool {
        !self.closed.load(Ordering::Relaxed)
            && !self.region.header().thread_exit.is_raised()
    }

    /// Forward one opcode to the plugin's dispatcher.
    pub fn dispatch(
        &self,
        opcode: Opcode,
        index: i32,
        value: i64,
        opt: f32,
        data: Option<&[u8]>,
    ) -> Result<(i64, Option<Vec<u8>>)> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(BridgeError::ShutDown);
        }
        let reply: BridgeReply = self.pump.send(
            &ToBridge::Dispatch {
                opcode,
                index,
                value,
                opt,
                data: data.map(|d| d.to_vec()),
            },
            Some(self.handler.as_ref() as &dyn InboundHandler),
            || self.bridge_alive(),
        )?;
        match reply {
            BridgeReply::Dispatched { result, data } => Ok((result, data)),
            BridgeReply::Error { message } => Err(BridgeError::PluginFault(message)),
            other => Err(BridgeError::Protocol(format!(
                "Unexpected reply to dispatch: {:?}",
                other
            ))),
        }
    }

    /// String-returning dispatch helper (names, labels, displays).
    pub fn dispatch_string(&self, opcode: Opcode, index: i32) -> Result<String> {
        let (_, data) = self.dispatch(opcode, index, 0, 0.0, None)?;
        let bytes = data.unwrap_or_default();
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    pub fn can_do(&self, what: &str) -> Result<i64> {
        let mut bytes = what.as_bytes().to_vec();
        bytes.push(0);
        let (result, _) = self.dispatch(Opcode::CanDo, 0, 0, 0.0, Some(&bytes))?;
        Ok(result)
    }

    pub fn get_chunk(&self) -> Result<Vec<u8>> {
        let (_, data) = self.dispatch(Opcode::GetChunk, 0, 0, 0.0, None)?;
        Ok(data.unwrap_or_default())
    }

    pub fn set_chunk(&self, chunk: &[u8]) -> Result<()> {
        self.dispatch(Opcode::SetChunk, 0, chunk.len() as i64, 0.0, Some(chunk))?;
        Ok(())
    }

    /// Deliver timestamped events for the next render call.
    pub fn process_events(&self, events: &[PluginEvent]) -> Result<()> {
        let bytes = bincode::serialize(events)?;
        self.dispatch(Opcode::ProcessEvents, 0, 0, 0.0, Some(&bytes))?;
        Ok(())
    }

    pub fn set_parameter(&self, index: u32, value: f32) -> Result<()> {
        let reply: BridgeReply = self.pump.send(
            &ToBridge::SetParameter { index, value },
            Some(self.handler.as_ref() as &dyn InboundHandler),
            || self.bridge_alive(),
        )?;
        match reply {
            BridgeReply::Dispatched { .. } => Ok(()),
            BridgeReply::Error { message } => Err(BridgeError::PluginFault(message)),
            other => Err(BridgeError::Protocol(format!(
                "Unexpected reply to set_parameter: {:?}",
                other
            ))),
        }
    }

    pub fn get_parameter(&self, index: u32) -> Result<f32> {
        let reply: BridgeReply = self.pump.send(
            &ToBridge::GetParameter { index },
            Some(self.handler.as_ref() as &dyn InboundHandler),
            || self.bridge_alive(),
        )?;
        match reply {
            BridgeReply::ParameterValue { value } => Ok(value),
            BridgeReply::Error { message } => Err(BridgeError::PluginFault(message)),
            other => Err(BridgeError::Protocol(format!(
                "Unexpected reply to get_parameter: {:?}",
                other
            ))),
        }
    }

    /// Queue a sample-accurate-ish parameter change for the next render
    /// call instead of a blocking message round trip. Drops the change if
    /// the ring is full.
    pub fn automate(&self, index: u32, value: f32) {
        if !self.region.push_automation(AutomationEvent { index, value }) {
            debug!("Automation ring full; dropping change to parameter {}", index);
        }
    }

    /// Publish the host's current transport state for `GetTime` callbacks.
    pub fn update_transport(&self, block: &TransportBlock) {
        self.region.store_transport(block);
    }

    fn render(&self, audio: &AudioSegment, frames: usize, mode: ProcessMode) -> Result<()> {
        audio.set_call(frames, mode);
        let header = self.region.header();
        header.render_done.reset();
        header.render_request.raise();
        let done = header.render_done.wait(None, || self.bridge_alive());
        if !done {
            return Err(BridgeError::ShutDown);
        }
        Ok(())
    }

    pub fn process_replacing(
        &self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
    ) -> Result<()> {
        let audio = self.audio.lock();
        let frames = outputs.first().map(|o| o.len()).unwrap_or(0);
        for (channel, input) in inputs.iter().enumerate() {
            audio.write_input_f32(channel, input)?;
        }
        self.render(&audio, frames, ProcessMode::Replace)?;
        for (channel, output) in outputs.iter_mut().enumerate() {
            audio.read_output_f32(channel, output)?;
        }
        Ok(())
    }

    /// Legacy accumulating process: output lanes are pre-loaded with the
    /// existing mix and the plugin adds into them.
    pub fn process_accumulate(
        &self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
    ) -> Result<()> {
        let audio = self.audio.lock();
        let frames = outputs.first().map(|o| o.len()).unwrap_or(0);
        for (channel, input) in inputs.iter().enumerate() {
            audio.write_input_f32(channel, input)?;
        }
        for (channel, output) in outputs.iter().enumerate() {
            // Seed the lanes so the plugin accumulates onto the mix.
            audio.write_output_f32(channel, output)?;
        }
        self.render(&audio, frames, ProcessMode::Accumulate)?;
        for (channel, output) in outputs.iter_mut().enumerate() {
            audio.read_output_f32(channel, output)?;
        }
        Ok(())
    }

    pub fn process_replacing_f64(
        &self,
        inputs: &[&[f64]],
        outputs: &mut [&mut [f64]],
    ) -> Result<()> {
        let audio = self.audio.lock();
        let frames = outputs.first().map(|o| o.len()).unwrap_or(0);
        for (channel, input) in inputs.iter().enumerate() {
            audio.write_input_f64(channel, input)?;
        }
        self.render(&audio, frames, ProcessMode::ReplaceF64)?;
        for (channel, output) in outputs.iter_mut().enumerate() {
            audio.read_output_f64(channel, output)?;
        }
        Ok(())
    }

    /// Grow the audio path to at least `max_frames` per lane. Allocates a
    /// fresh segment under the next generation name and tells the server to
    /// reopen before the old mapping is dropped.
    pub fn ensure_audio_capacity(&self, max_frames: usize) -> Result<()> {
        let mut audio = self.audio.lock();
        if audio.max_frames() >= max_frames {
            return Ok(());
        }
        let generation = self.audio_generation.load(Ordering::Relaxed) + 1;
        let name = audio_name(self.region.name(), generation);
        let replacement = AudioSegment::create(
            name.clone(),
            audio.in_channels(),
            audio.out_channels(),
            max_frames,
        )?;
        let reconfig = AudioReconfig {
            segment_name: name,
            inputs: audio.in_channels() as u32,
            outputs: audio.out_channels() as u32,
            max_frames: max_frames as u32,
        };
        let bytes = bincode::serialize(&reconfig)?;
        self.dispatch(Opcode::UpdateAudioBuffer, 0, 0, 0.0, Some(&bytes))?;

        self.audio_generation.store(generation, Ordering::Relaxed);
        *audio = replacement;
        Ok(())
    }

    /// Shut this instance down. Safe to call more than once; only the first
    /// call does anything.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result: Result<BridgeReply> = self.pump.send(
            &ToBridge::Close,
            Some(self.handler.as_ref() as &dyn InboundHandler),
            || !self.region.header().thread_exit.is_raised(),
        );
        match result {
            Ok(BridgeReply::Closed) => {}
            Ok(other) => warn!("Unexpected reply to close: {:?}", other),
            // The server may already be gone; teardown proceeds regardless.
            Err(e) => debug!("Close round trip failed: {}", e),
        }

        self.service_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.service.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for BridgedPlugin {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::transport_flags;

    #[test]
    fn test_default_server_path_is_sibling() {
        let path = default_server_path().unwrap();
        assert!(path.to_string_lossy().contains("fxbridge-server"));
        assert_eq!(
            path.parent(),
            std::env::current_exe().unwrap().parent()
        );
    }

    #[test]
    fn test_callback_handler_serves_time_from_region() {
        let name = format!("fxbridge-test-client-time-{}", std::process::id());
        let region = SharedRegion::create(name, std::process::id(), 0).unwrap();
        let (tx, _rx) = unbounded();
        let handler = HostCallbackHandler {
            region: Arc::clone(&region),
            events: tx,
        };

        let mut block = TransportBlock::default();
        block.flags = transport_flags::PLAYING | transport_flags::TEMPO_VALID;
        block.tempo = 174.0;
        region.store_transport(&block);

        let call = ToHost::Callback {
            opcode: HostOpcode::GetTime,
            index: 0,
            value: transport_flags::TEMPO_VALID as i64,
            opt: 0.0,
            data: None,
        };
        let raw = handler.handle(&bincode::serialize(&call).unwrap());
        let reply: HostReply = bincode::deserialize(&raw).unwrap();
        match reply {
            HostReply::Done { result, data } => {
                assert_eq!(result, 1);
                let got: TransportBlock = bincode::deserialize(&data.unwrap()).unwrap();
                assert_eq!(got.tempo, 174.0);
                assert_eq!(
                    got.flags,
                    transport_flags::PLAYING | transport_flags::TEMPO_VALID
                );
            }
            other => panic!("Unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn test_callback_handler_surfaces_events() {
        let name = format!("fxbridge-test-client-events-{}", std::process::id());
        let region = SharedRegion::create(name, std::process::id(), 0).unwrap();
        let (tx, rx) = unbounded();
        let handler = HostCallbackHandler {
            region,
            events: tx,
        };

        let call = ToHost::Callback {
            opcode: HostOpcode::Automate,
            index: 7,
            value: 0,
            opt: 0.5,
            data: None,
        };
        handler.handle(&bincode::serialize(&call).unwrap());
        assert_eq!(
            rx.try_recv().unwrap(),
            HostEvent::ParameterAutomated {
                index: 7,
                value: 0.5
            }
        );

        let call = ToHost::Callback {
            opcode: HostOpcode::SizeWindow,
            index: 640,
            value: 480,
            opt: 0.0,
            data: None,
        };
        handler.handle(&bincode::serialize(&call).unwrap());
        assert_eq!(
            rx.try_recv().unwrap(),
            HostEvent::WindowResize {
                width: 640,
                height: 480
            }
        );
    }

    #[test]
    fn test_callback_handler_rejects_garbage() {
        let name = format!("fxbridge-test-client-garbage-{}", std::process::id());
        let region = SharedRegion::create(name, std::process::id(), 0).unwrap();
        let (tx, _rx) = unbounded();
        let handler = HostCallbackHandler {
            region,
            events: tx,
        };

        let raw = handler.handle(&[]);
        let reply: HostReply = bincode::deserialize(&raw).unwrap();
        assert!(matches!(reply, HostReply::Error { .. }));
    }
}
