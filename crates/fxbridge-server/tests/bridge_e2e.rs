//! Full-stack tests: a real `BridgedPlugin` talking to a real server
//! instance over shared memory, with the reference gain effect injected
//! through the loader seam instead of a dynamic library.

use fxbridge::engine::{MessagePump, Side};
use fxbridge::shm::SharedRegion;
use fxbridge::{BridgeConfig, BridgeError, BridgedPlugin, Opcode, PluginEvent};
use fxbridge_server::instance::BridgeInstance;
use fxbridge_server::server::{InstanceRegistry, LoaderFn};
use fxbridge_server::testplug;
use fxbridge_server::NativeHandle;
use std::path::Path;
use std::sync::Arc;

fn start(tag: &str) -> (BridgedPlugin, BridgeInstance) {
    let name = format!("fxbridge-e2e-{}-{}", tag, std::process::id());
    let host_region = SharedRegion::create(name.clone(), std::process::id(), 0).unwrap();
    let server_region = SharedRegion::open(name).unwrap();

    let loader: LoaderFn = Arc::new(|_path| NativeHandle::from_entry(testplug::plugin_main));
    let registry = Arc::new(InstanceRegistry::new(Arc::clone(&loader)));
    let instance = BridgeInstance::spawn(server_region, loader, registry).unwrap();

    let pump = Arc::new(MessagePump::new(Arc::clone(&host_region), Side::Host));
    let mut config = BridgeConfig::default();
    config.max_frames = 1024;
    let plugin = BridgedPlugin::over_pump(
        host_region,
        pump,
        Path::new("/in-process/test-gain"),
        48000.0,
        &config,
    )
    .unwrap();

    (plugin, instance)
}

fn finish(plugin: BridgedPlugin, instance: BridgeInstance) {
    plugin.close().unwrap();
    drop(plugin);
    instance.join();
}

#[test]
fn test_load_reports_name_and_descriptor() {
    let (plugin, instance) = start("load");

    assert_eq!(plugin.name(), "Test Gain");
    let desc = plugin.descriptor().unwrap();
    assert_eq!(desc.inputs, 2);
    assert_eq!(desc.outputs, 2);
    assert_eq!(desc.num_params, 1);

    assert_eq!(
        plugin.dispatch_string(Opcode::GetPluginName, 0).unwrap(),
        "Test Gain"
    );
    assert_eq!(
        plugin.dispatch_string(Opcode::GetVendorName, 0).unwrap(),
        "fxbridge"
    );

    finish(plugin, instance);
}

#[test]
fn test_process_replacing_applies_gain() {
    let (plugin, instance) = start("gain");
    plugin.dispatch(Opcode::Open, 0, 0, 0.0, None).unwrap();

    let frames = 512;
    let mut out_l = vec![9.0f32; frames];
    let mut out_r = vec![9.0f32; frames];

    // Silence in, silence out.
    let silence = vec![0.0f32; frames];
    plugin
        .process_replacing(&[&silence, &silence], &mut [&mut out_l, &mut out_r])
        .unwrap();
    assert!(out_l.iter().chain(&out_r).all(|s| *s == 0.0));

    let input: Vec<f32> = (0..frames).map(|i| (i as f32 / frames as f32) - 0.5).collect();
    plugin
        .process_replacing(&[&input, &input], &mut [&mut out_l, &mut out_r])
        .unwrap();
    assert_eq!(out_l, input);
    assert_eq!(out_r, input);

    plugin.set_parameter(0, 0.5).unwrap();
    assert_eq!(plugin.get_parameter(0).unwrap(), 0.5);

    plugin
        .process_replacing(&[&input, &input], &mut [&mut out_l, &mut out_r])
        .unwrap();
    for (o, i) in out_l.iter().zip(&input) {
        assert_eq!(*o, i * 0.5);
    }

    finish(plugin, instance);
}

#[test]
fn test_process_replacing_f64_path() {
    let (plugin, instance) = start("f64");
    plugin.dispatch(Opcode::Open, 0, 0, 0.0, None).unwrap();
    plugin.set_parameter(0, 2.0).unwrap();

    let input: Vec<f64> = (0..128).map(|i| i as f64 * 0.001).collect();
    let mut out_l = vec![0f64; 128];
    let mut out_r = vec![0f64; 128];
    plugin
        .process_replacing_f64(&[&input, &input], &mut [&mut out_l, &mut out_r])
        .unwrap();
    for (o, i) in out_r.iter().zip(&input) {
        assert_eq!(*o, i * 2.0);
    }

    finish(plugin, instance);
}

#[test]
fn test_accumulate_adds_onto_existing_mix() {
    let (plugin, instance) = start("accumulate");
    plugin.dispatch(Opcode::Open, 0, 0, 0.0, None).unwrap();

    let input = vec![0.25f32; 64];
    let mut out_l = vec![0.5f32; 64];
    let mut out_r = vec![0.5f32; 64];
    plugin
        .process_accumulate(&[&input, &input], &mut [&mut out_l, &mut out_r])
        .unwrap();
    assert!(out_l.iter().all(|s| (*s - 0.75).abs() < 1e-6));

    finish(plugin, instance);
}

#[test]
fn test_automation_ring_applies_before_render() {
    let (plugin, instance) = start("automation");
    plugin.dispatch(Opcode::Open, 0, 0, 0.0, None).unwrap();

    // Queued change is applied at the head of the next render call.
    plugin.automate(0, 0.25);
    let input = vec![1.0f32; 32];
    let mut out_l = vec![0f32; 32];
    let mut out_r = vec![0f32; 32];
    plugin
        .process_replacing(&[&input, &input], &mut [&mut out_l, &mut out_r])
        .unwrap();
    assert!(out_l.iter().all(|s| *s == 0.25));
    assert_eq!(plugin.get_parameter(0).unwrap(), 0.25);

    finish(plugin, instance);
}

#[test]
fn test_mains_on_records_render_intent() {
    let (plugin, instance) = start("mains");
    plugin.dispatch(Opcode::Open, 0, 0, 0.0, None).unwrap();

    assert!(!instance.wants_realtime());
    plugin.dispatch(Opcode::MainsChanged, 0, 1, 0.0, None).unwrap();
    assert!(instance.wants_realtime());
    plugin.dispatch(Opcode::MainsChanged, 0, 0, 0.0, None).unwrap();
    assert!(!instance.wants_realtime());

    finish(plugin, instance);
}

#[test]
fn test_chunk_roundtrip_restores_state() {
    let (plugin, instance) = start("chunk");
    plugin.dispatch(Opcode::Open, 0, 0, 0.0, None).unwrap();

    plugin.set_parameter(0, 0.3).unwrap();
    let chunk = plugin.get_chunk().unwrap();
    assert_eq!(chunk.len(), 4);

    plugin.set_parameter(0, 1.0).unwrap();
    plugin.set_chunk(&chunk).unwrap();
    assert_eq!(plugin.get_parameter(0).unwrap(), 0.3);

    finish(plugin, instance);
}

#[test]
fn test_plugin_panic_is_isolated() {
    let (plugin, instance) = start("panic");
    plugin.dispatch(Opcode::Open, 0, 0, 0.0, None).unwrap();

    let err = plugin.can_do("explode").unwrap_err();
    match err {
        BridgeError::PluginFault(message) => assert!(message.contains("explode")),
        other => panic!("Unexpected error: {:?}", other),
    }

    // The instance survives the fault and keeps answering.
    plugin.set_parameter(0, 0.75).unwrap();
    assert_eq!(plugin.get_parameter(0).unwrap(), 0.75);
    assert_eq!(plugin.can_do("gain").unwrap(), 1);

    finish(plugin, instance);
}

#[test]
fn test_host_callback_round_trip() {
    let (plugin, instance) = start("callback");
    plugin.dispatch(Opcode::Open, 0, 0, 0.0, None).unwrap();

    // "time" makes the plugin call GetTime back into the host mid-dispatch;
    // the host must answer it while blocked on its own call.
    assert_eq!(plugin.can_do("time").unwrap(), 1);

    finish(plugin, instance);
}

#[test]
fn test_process_events_delivered() {
    let (plugin, instance) = start("events");
    plugin.dispatch(Opcode::Open, 0, 0, 0.0, None).unwrap();

    let events = vec![
        PluginEvent::new(0, 1, &[0x90, 60, 100]),
        PluginEvent::new(16, 1, &[0x80, 60, 0]),
    ];
    plugin.process_events(&events).unwrap();

    // Events flush at the next render call.
    let input = vec![0f32; 64];
    let mut out_l = vec![0f32; 64];
    let mut out_r = vec![0f32; 64];
    plugin
        .process_replacing(&[&input, &input], &mut [&mut out_l, &mut out_r])
        .unwrap();

    finish(plugin, instance);
}

#[test]
fn test_audio_capacity_grows_without_losing_audio() {
    let (plugin, instance) = start("resize");
    plugin.dispatch(Opcode::Open, 0, 0, 0.0, None).unwrap();

    plugin.ensure_audio_capacity(4096).unwrap();

    let input = vec![0.5f32; 2048];
    let mut out_l = vec![0f32; 2048];
    let mut out_r = vec![0f32; 2048];
    plugin
        .process_replacing(&[&input, &input], &mut [&mut out_l, &mut out_r])
        .unwrap();
    assert!(out_l.iter().all(|s| *s == 0.5));

    finish(plugin, instance);
}

#[test]
fn test_close_is_idempotent_and_final() {
    let (plugin, instance) = start("close");
    plugin.dispatch(Opcode::Open, 0, 0, 0.0, None).unwrap();

    plugin.close().unwrap();
    plugin.close().unwrap();

    let err = plugin.dispatch(Opcode::GetProgram, 0, 0, 0.0, None).unwrap_err();
    assert!(matches!(err, BridgeError::ShutDown));

    drop(plugin);
    instance.join();
}

#[test]
fn test_quit_signal_tears_instance_down() {
    let name = format!("fxbridge-e2e-quit-{}", std::process::id());
    let host_region = SharedRegion::create(name.clone(), std::process::id(), 0).unwrap();
    let server_region = SharedRegion::open(name).unwrap();

    let loader: LoaderFn = Arc::new(|_path| NativeHandle::from_entry(testplug::plugin_main));
    let registry = Arc::new(InstanceRegistry::new(Arc::clone(&loader)));
    let instance = BridgeInstance::spawn(server_region, loader, Arc::clone(&registry)).unwrap();

    let pump = Arc::new(MessagePump::new(Arc::clone(&host_region), Side::Host));
    let plugin = BridgedPlugin::over_pump(
        Arc::clone(&host_region),
        pump,
        Path::new("/in-process/test-gain"),
        44100.0,
        &BridgeConfig::default(),
    )
    .unwrap();

    // Session-wide shutdown signal instead of a Close round trip.
    host_region.header().quit.raise();
    instance.join();
    assert_eq!(registry.live(), 0);
    assert!(host_region.header().thread_exit.is_raised());

    drop(plugin);
}

#[test]
fn test_descriptor_widths_agree() {
    let name = format!("fxbridge-e2e-widths-{}", std::process::id());
    let host_region = SharedRegion::create(name.clone(), std::process::id(), 0).unwrap();
    let server_region = SharedRegion::open(name).unwrap();

    let loader: LoaderFn = Arc::new(|_path| NativeHandle::from_entry(testplug::plugin_main));
    let registry = Arc::new(InstanceRegistry::new(Arc::clone(&loader)));
    let instance = BridgeInstance::spawn(server_region, loader, registry).unwrap();

    let pump = Arc::new(MessagePump::new(Arc::clone(&host_region), Side::Host));
    let plugin = BridgedPlugin::over_pump(
        Arc::clone(&host_region),
        pump,
        Path::new("/in-process/test-gain"),
        44100.0,
        &BridgeConfig::default(),
    )
    .unwrap();

    let (d32, d64) = host_region.load_descriptor_both();
    assert!(d32.is_some());
    assert_eq!(d32, d64);

    finish(plugin, instance);
}
