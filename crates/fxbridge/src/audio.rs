//! Dedicated audio-path segment.
//!
//! Sample data never rides the message slots. Each instance owns one audio
//! segment with channel-major lanes sized for the worst case (f64 at the
//! negotiated maximum block size); render calls are signaled through the
//! region's `render_request`/`render_done` event pair, with the actual frame
//! count and process mode written into this segment's header.
//!
//! Resizes allocate a *new* segment under a bumped generation name and tell
//! the server to reopen, so a render call never observes a remap.

use crate::error::{BridgeError, Result};
use crate::shm::map_segment;
use memmap2::MmapMut;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

pub const AUDIO_MAGIC: u32 = u32::from_le_bytes(*b"FXAU");

/// Bytes per lane sample slot. Lanes are sized for f64 so a mode switch
/// never needs a resize.
const LANE_SAMPLE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProcessMode {
    /// Legacy accumulate: plugin adds into the output lanes.
    Accumulate = 0,
    Replace = 1,
    ReplaceF64 = 2,
}

impl ProcessMode {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => ProcessMode::Accumulate,
            1 => ProcessMode::Replace,
            2 => ProcessMode::ReplaceF64,
            _ => return None,
        })
    }
}

#[repr(C)]
struct AudioHeader {
    magic: u32,
    in_channels: u32,
    out_channels: u32,
    max_frames: u32,
    /// Frame count for the render call currently in flight.
    frames: AtomicU32,
    /// Raw [`ProcessMode`] for the call in flight.
    mode: AtomicU32,
    _pad: [u32; 2],
}

pub struct AudioSegment {
    mmap: UnsafeCell<MmapMut>,
    name: String,
    owns: bool,
    in_channels: usize,
    out_channels: usize,
    max_frames: usize,
}

// SAFETY: lane ownership alternates with the render_request/render_done
// handshake; the header words are atomics.
unsafe impl Send for AudioSegment {}
unsafe impl Sync for AudioSegment {}

fn segment_size(in_channels: usize, out_channels: usize, max_frames: usize) -> usize {
    std::mem::size_of::<AudioHeader>()
        + (in_channels + out_channels) * max_frames * LANE_SAMPLE
}

impl AudioSegment {
    pub fn create(
        name: String,
        in_channels: usize,
        out_channels: usize,
        max_frames: usize,
    ) -> Result<Self> {
        if max_frames == 0 {
            return Err(BridgeError::SharedMemory(
                "Audio segment needs a nonzero block size".to_string(),
            ));
        }
        let size = segment_size(in_channels, out_channels, max_frames);
        let mmap = map_segment(&name, size, true)?;

        let segment = Self {
            mmap: UnsafeCell::new(mmap),
            name,
            owns: true,
            in_channels,
            out_channels,
            max_frames,
        };
        // SAFETY: freshly created zeroed mapping, not yet shared.
        unsafe {
            let header = segment.header_ptr();
            std::ptr::addr_of_mut!((*header).magic).write(AUDIO_MAGIC);
            std::ptr::addr_of_mut!((*header).in_channels).write(in_channels as u32);
            std::ptr::addr_of_mut!((*header).out_channels).write(out_channels as u32);
            std::ptr::addr_of_mut!((*header).max_frames).write(max_frames as u32);
        }
        Ok(segment)
    }

    pub fn open(name: String) -> Result<Self> {
        let probe = map_segment(&name, 0, false)?;
        if probe.len() < std::mem::size_of::<AudioHeader>() {
            return Err(BridgeError::SharedMemory(format!(
                "Audio segment {} is truncated",
                name
            )));
        }
        // SAFETY: length checked above; the header is plain words.
        let (magic, in_channels, out_channels, max_frames) = unsafe {
            let header = probe.as_ptr() as *const AudioHeader;
            (
                (*header).magic,
                (*header).in_channels as usize,
                (*header).out_channels as usize,
                (*header).max_frames as usize,
            )
        };
        if magic != AUDIO_MAGIC {
            return Err(BridgeError::SharedMemory(format!(
                "Audio segment {} has wrong magic {:#x}",
                name, magic
            )));
        }
        let expected = segment_size(in_channels, out_channels, max_frames);
        if probe.len() < expected {
            return Err(BridgeError::SharedMemory(format!(
                "Audio segment {} too small: {} < {}",
                name,
                probe.len(),
                expected
            )));
        }

        Ok(Self {
            mmap: UnsafeCell::new(probe),
            name,
            owns: false,
            in_channels,
            out_channels,
            max_frames,
        })
    }

    fn header_ptr(&self) -> *mut AudioHeader {
        // SAFETY: the mmap is never remapped after construction.
        unsafe { (*self.mmap.get()).as_mut_ptr() as *mut AudioHeader }
    }

    fn header(&self) -> &AudioHeader {
        // SAFETY: mapping outlives self; see header_ptr.
        unsafe { &*self.header_ptr() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    pub fn set_call(&self, frames: usize, mode: ProcessMode) {
        self.header().frames.store(frames as u32, Ordering::Relaxed);
        self.header().mode.store(mode as u32, Ordering::Release);
    }

    pub fn frames(&self) -> usize {
        self.header().frames.load(Ordering::Acquire) as usize
    }

    pub fn mode(&self) -> Option<ProcessMode> {
        ProcessMode::from_raw(self.header().mode.load(Ordering::Acquire))
    }

    fn lane_ptr(&self, lane: usize) -> *mut u8 {
        let offset =
            std::mem::size_of::<AudioHeader>() + lane * self.max_frames * LANE_SAMPLE;
        // SAFETY: lane index is validated by the callers against the channel
        // counts, and the mapping covers every lane.
        unsafe { (*self.mmap.get()).as_mut_ptr().add(offset) }
    }

    /// Raw pointer to an input lane, for building the native channel array.
    pub fn input_ptr(&self, channel: usize) -> *mut u8 {
        debug_assert!(channel < self.in_channels);
        self.lane_ptr(channel)
    }

    /// Raw pointer to an output lane.
    pub fn output_ptr(&self, channel: usize) -> *mut u8 {
        debug_assert!(channel < self.out_channels);
        self.lane_ptr(self.in_channels + channel)
    }

    fn check_lane(&self, channel: usize, channels: usize, frames: usize) -> Result<()> {
        if channel >= channels || frames > self.max_frames {
            return Err(BridgeError::Protocol(format!(
                "Audio lane out of range: channel {} of {}, {} frames of {}",
                channel, channels, frames, self.max_frames
            )));
        }
        Ok(())
    }

    pub fn write_input_f32(&self, channel: usize, samples: &[f32]) -> Result<()> {
        self.check_lane(channel, self.in_channels, samples.len())?;
        // SAFETY: lane bounds checked; the peer only reads these lanes after
        // render_request is raised.
        unsafe {
            std::ptr::copy_nonoverlapping(
                samples.as_ptr(),
                self.input_ptr(channel) as *mut f32,
                samples.len(),
            );
        }
        Ok(())
    }

    /// Pre-load an output lane (accumulate mode adds onto the existing mix).
    pub fn write_output_f32(&self, channel: usize, samples: &[f32]) -> Result<()> {
        self.check_lane(channel, self.out_channels, samples.len())?;
        // SAFETY: as write_input_f32.
        unsafe {
            std::ptr::copy_nonoverlapping(
                samples.as_ptr(),
                self.output_ptr(channel) as *mut f32,
                samples.len(),
            );
        }
        Ok(())
    }

    pub fn read_output_f32(&self, channel: usize, out: &mut [f32]) -> Result<()> {
        self.check_lane(channel, self.out_channels, out.len())?;
        // SAFETY: lane bounds checked; called after render_done.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.output_ptr(channel) as *const f32,
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(())
    }

    pub fn write_input_f64(&self, channel: usize, samples: &[f64]) -> Result<()> {
        self.check_lane(channel, self.in_channels, samples.len())?;
        // SAFETY: as write_input_f32; lanes are sized for f64.
        unsafe {
            std::ptr::copy_nonoverlapping(
                samples.as_ptr(),
                self.input_ptr(channel) as *mut f64,
                samples.len(),
            );
        }
        Ok(())
    }

    pub fn read_output_f64(&self, channel: usize, out: &mut [f64]) -> Result<()> {
        self.check_lane(channel, self.out_channels, out.len())?;
        // SAFETY: as read_output_f32.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.output_ptr(channel) as *const f64,
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(())
    }

    /// Zero every output lane (fallback after a faulted render call).
    pub fn silence_outputs(&self) {
        for channel in 0..self.out_channels {
            // SAFETY: lane bounds by construction.
            unsafe {
                std::ptr::write_bytes(
                    self.output_ptr(channel),
                    0,
                    self.max_frames * LANE_SAMPLE,
                );
            }
        }
    }
}

impl Drop for AudioSegment {
    fn drop(&mut self) {
        if self.owns {
            let _ = std::fs::remove_file(crate::shm::segment_path(&self.name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(name: &str) -> String {
        format!("fxbridge-test-audio-{}-{}", name, std::process::id())
    }

    #[test]
    fn test_create_open_geometry() {
        let name = unique("geometry");
        let created = AudioSegment::create(name.clone(), 2, 2, 512).unwrap();
        let opened = AudioSegment::open(name).unwrap();

        assert_eq!(opened.in_channels(), 2);
        assert_eq!(opened.out_channels(), 2);
        assert_eq!(opened.max_frames(), 512);
        assert_eq!(created.max_frames(), 512);
    }

    #[test]
    fn test_f32_lanes_roundtrip_across_openings() {
        let name = unique("f32");
        let writer = AudioSegment::create(name.clone(), 2, 2, 256).unwrap();
        let reader = AudioSegment::open(name).unwrap();

        let left: Vec<f32> = (0..256).map(|i| i as f32 / 256.0).collect();
        writer.write_input_f32(0, &left).unwrap();
        writer.set_call(256, ProcessMode::Replace);

        assert_eq!(reader.frames(), 256);
        assert_eq!(reader.mode(), Some(ProcessMode::Replace));

        // Reader sees the input lane through its own mapping.
        let mut copy = vec![0f32; 256];
        // SAFETY: test reads the lane directly.
        unsafe {
            std::ptr::copy_nonoverlapping(
                reader.input_ptr(0) as *const f32,
                copy.as_mut_ptr(),
                256,
            );
        }
        assert_eq!(copy, left);
    }

    #[test]
    fn test_f64_lanes_fit_without_resize() {
        let name = unique("f64");
        let seg = AudioSegment::create(name, 1, 1, 128).unwrap();

        let samples: Vec<f64> = (0..128).map(|i| i as f64).collect();
        seg.write_input_f64(0, &samples).unwrap();

        let mut back = vec![0f64; 128];
        // SAFETY: test reads the lane it just wrote.
        unsafe {
            std::ptr::copy_nonoverlapping(
                seg.input_ptr(0) as *const f64,
                back.as_mut_ptr(),
                128,
            );
        }
        assert_eq!(back, samples);
    }

    #[test]
    fn test_lane_bounds_checked() {
        let name = unique("bounds");
        let seg = AudioSegment::create(name, 1, 1, 64).unwrap();

        assert!(seg.write_input_f32(1, &[0.0; 8]).is_err());
        assert!(seg.write_input_f32(0, &[0.0; 65]).is_err());
        let mut out = vec![0f32; 65];
        assert!(seg.read_output_f32(0, &mut out).is_err());
    }

    #[test]
    fn test_silence_outputs() {
        let name = unique("silence");
        let seg = AudioSegment::create(name, 0, 1, 32).unwrap();

        let loud = vec![1.0f32; 32];
        // SAFETY: test writes the output lane directly.
        unsafe {
            std::ptr::copy_nonoverlapping(
                loud.as_ptr(),
                seg.output_ptr(0) as *mut f32,
                32,
            );
        }
        seg.silence_outputs();

        let mut out = vec![1.0f32; 32];
        seg.read_output_f32(0, &mut out).unwrap();
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_zero_block_size_rejected() {
        assert!(AudioSegment::create(unique("zero"), 2, 2, 0).is_err());
    }
}
