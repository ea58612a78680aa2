//! Shared memory region and auxiliary segments.
//!
//! One fixed-layout region per bridge instance carries everything the two
//! processes share on the control path: event words, the cached transport
//! block, the automation ring, the mirrored descriptor blocks and the two
//! message-slot arrays. Audio sample data travels through a separate,
//! resizable segment (see [`crate::audio`]).
//!
//! Uses `UnsafeCell` for interior mutability since the underlying
//! memory-mapped bytes are shared between processes and written through
//! immutable references. This is safe because:
//! 1. Every cross-process handoff is carried by an atomic word (slot status,
//!    event words, ring indices, seqlock) with acquire/release ordering.
//! 2. Non-atomic areas are only touched by the side that currently owns them
//!    according to those words.

use crate::descriptor::{EffectDescriptor, RawDescriptor32, RawDescriptor64};
use crate::error::{BridgeError, Result};
use crate::protocol::{AutomationEvent, TransportBlock};
use crate::slot::Slot;
use memmap2::MmapMut;
use smallvec::SmallVec;
use std::cell::UnsafeCell;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const REGION_MAGIC: u32 = u32::from_le_bytes(*b"FXBR");
pub const REGION_VERSION: u32 = 1;

/// Message slots per direction. Small and fixed; traffic beyond this backs
/// up on the sender, it never allocates more slots.
pub const MSG_SLOTS: usize = 8;

/// Capacity of the automation ring (power of two).
pub const AUTOMATION_CAPACITY: usize = 1024;

/// Batch container for draining the automation ring before a render call.
pub type AutomationBatch = SmallVec<[AutomationEvent; 64]>;

/// A settable/consumable event word, the shared-memory stand-in for a named
/// synchronization object. Waiters poll with sleep backoff; see
/// [`EventWord::wait`].
#[derive(Debug)]
#[repr(transparent)]
pub struct EventWord(AtomicU32);

/// Poll interval while waiting on an event word.
pub const WAIT_POLL: Duration = Duration::from_micros(100);

impl EventWord {
    pub fn raise(&self) {
        self.0.store(1, Ordering::Release);
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }

    /// Atomically observe-and-reset. Exactly one caller wins per raise.
    pub fn consume(&self) -> bool {
        self.0.swap(0, Ordering::AcqRel) != 0
    }

    /// Wait until raised (consuming it) or until `deadline` passes.
    /// `None` deadline waits forever; `alive` aborts the wait early.
    pub fn wait(&self, deadline: Option<Instant>, alive: impl Fn() -> bool) -> bool {
        loop {
            if self.consume() {
                return true;
            }
            if !alive() {
                return false;
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return false;
                }
            }
            std::thread::sleep(WAIT_POLL);
        }
    }
}

/// Fixed layout of the shared region. Never constructed by value; both
/// processes cast the mapping's base pointer to `&RegionHeader`.
#[repr(C)]
pub struct RegionHeader {
    pub magic: u32,
    pub version: u32,
    pub host_pid: u32,
    pub instance_id: u32,

    /// Raised by the server once it has opened the region.
    pub attached: EventWord,
    /// Whole-session teardown (host shutdown or host death observed).
    pub quit: EventWord,
    /// Instance teardown: tells the render thread to exit.
    pub thread_exit: EventWord,
    /// Render call request/completion pair.
    pub render_request: EventWord,
    pub render_done: EventWord,

    /// "New message available" per direction.
    pub msg_to_bridge: EventWord,
    pub msg_to_host: EventWord,
    /// Per-slot acknowledgment signals, per direction of the request.
    pub ack_to_bridge: [EventWord; MSG_SLOTS],
    pub ack_to_host: [EventWord; MSG_SLOTS],

    /// Seqlock word for the transport block (odd while the host writes).
    pub transport_seq: AtomicU32,
    _pad0: u32,
    transport: UnsafeCell<TransportBlock>,

    /// Automation ring: single writer (host), single reader (bridge).
    /// Monotonic positions; index = position % capacity.
    pub auto_write: AtomicU32,
    pub auto_read: AtomicU32,
    auto_events: UnsafeCell<[AutomationEvent; AUTOMATION_CAPACITY]>,

    /// Mirrored descriptor blocks, written only by the bridge through the
    /// explicit update step.
    descriptor32: UnsafeCell<RawDescriptor32>,
    descriptor64: UnsafeCell<RawDescriptor64>,

    pub to_bridge: [Slot; MSG_SLOTS],
    pub to_host: [Slot; MSG_SLOTS],
}

pub struct SharedRegion {
    mmap: UnsafeCell<MmapMut>,
    name: String,
    /// Creator unlinks the backing file on drop.
    owns: bool,
}

// SAFETY: all shared mutation goes through atomics or through UnsafeCell
// areas whose ownership is carried by an atomic word (see module docs).
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    pub fn create(name: String, host_pid: u32, instance_id: u32) -> Result<Arc<Self>> {
        let size = std::mem::size_of::<RegionHeader>();
        let mmap = map_segment(&name, size, true)?;

        let region = Self {
            mmap: UnsafeCell::new(mmap),
            name,
            owns: true,
        };

        // SAFETY: freshly created zeroed mapping, not yet shared.
        unsafe {
            let header = region.base_ptr() as *mut RegionHeader;
            std::ptr::addr_of_mut!((*header).magic).write(REGION_MAGIC);
            std::ptr::addr_of_mut!((*header).version).write(REGION_VERSION);
            std::ptr::addr_of_mut!((*header).host_pid).write(host_pid);
            std::ptr::addr_of_mut!((*header).instance_id).write(instance_id);
            (*(*header).transport.get()) = TransportBlock::default();
        }

        Ok(Arc::new(region))
    }

    pub fn open(name: String) -> Result<Arc<Self>> {
        let size = std::mem::size_of::<RegionHeader>();
        let mmap = map_segment(&name, size, false)?;
        if mmap.len() < size {
            return Err(BridgeError::SharedMemory(format!(
                "Region {} too small: {} < {}",
                name,
                mmap.len(),
                size
            )));
        }

        let region = Self {
            mmap: UnsafeCell::new(mmap),
            name,
            owns: false,
        };

        let header = region.header();
        if header.magic != REGION_MAGIC {
            return Err(BridgeError::SharedMemory(format!(
                "Region {} has wrong magic {:#x}",
                region.name, header.magic
            )));
        }
        if header.version != REGION_VERSION {
            return Err(BridgeError::SharedMemory(format!(
                "Region {} has unsupported version {}",
                region.name, header.version
            )));
        }

        Ok(Arc::new(region))
    }

    /// Open, retrying until the creator has the region in place.
    pub fn open_within(name: String, timeout: Duration) -> Result<Arc<Self>> {
        let deadline = Instant::now() + timeout;
        loop {
            match Self::open(name.clone()) {
                Ok(region) => return Ok(region),
                Err(e) if Instant::now() >= deadline => return Err(e),
                Err(_) => std::thread::sleep(Duration::from_millis(10)),
            }
        }
    }

    fn base_ptr(&self) -> *const u8 {
        // SAFETY: the mmap is never remapped after construction.
        unsafe { (*self.mmap.get()).as_ptr() }
    }

    pub fn header(&self) -> &RegionHeader {
        // SAFETY: the mapping is at least size_of::<RegionHeader>() bytes
        // (checked at create/open) and lives as long as self.
        unsafe { &*(self.base_ptr() as *const RegionHeader) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host_pid(&self) -> u32 {
        self.header().host_pid
    }

    pub fn instance_id(&self) -> u32 {
        self.header().instance_id
    }

    // -------------------------------------------------------------------
    // Transport cache (seqlock, host is the only writer)
    // -------------------------------------------------------------------

    pub fn store_transport(&self, block: &TransportBlock) {
        let header = self.header();
        let seq = header.transport_seq.load(Ordering::Relaxed);
        header.transport_seq.store(seq.wrapping_add(1), Ordering::Release);
        // SAFETY: single writer; readers retry while seq is odd or changes.
        unsafe {
            *header.transport.get() = *block;
        }
        header
            .transport_seq
            .store(seq.wrapping_add(2), Ordering::Release);
    }

    pub fn load_transport(&self) -> TransportBlock {
        let header = self.header();
        loop {
            let before = header.transport_seq.load(Ordering::Acquire);
            if before & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }
            // SAFETY: torn reads are detected by the seq recheck below.
            let block = unsafe { *header.transport.get() };
            let after = header.transport_seq.load(Ordering::Acquire);
            if before == after {
                return block;
            }
        }
    }

    // -------------------------------------------------------------------
    // Automation ring (host writes, bridge drains)
    // -------------------------------------------------------------------

    /// Queue a parameter change. Returns false when the ring is full; the
    /// event is dropped in that case (no backpressure to the writer).
    pub fn push_automation(&self, event: AutomationEvent) -> bool {
        let header = self.header();
        let read = header.auto_read.load(Ordering::Acquire);
        let write = header.auto_write.load(Ordering::Relaxed);
        if write.wrapping_sub(read) >= AUTOMATION_CAPACITY as u32 {
            return false;
        }
        let idx = write as usize % AUTOMATION_CAPACITY;
        // SAFETY: this cell is past the write position, so the reader will
        // not touch it until auto_write is advanced below.
        unsafe {
            (*header.auto_events.get())[idx] = event;
        }
        header
            .auto_write
            .store(write.wrapping_add(1), Ordering::Release);
        true
    }

    /// Drain all pending automation events, in queue order.
    pub fn drain_automation(&self, out: &mut AutomationBatch) {
        let header = self.header();
        let mut read = header.auto_read.load(Ordering::Relaxed);
        let write = header.auto_write.load(Ordering::Acquire);
        while read != write {
            let idx = read as usize % AUTOMATION_CAPACITY;
            // SAFETY: cells between read and write are owned by the reader.
            out.push(unsafe { (*header.auto_events.get())[idx] });
            read = read.wrapping_add(1);
        }
        header.auto_read.store(read, Ordering::Release);
    }

    pub fn automation_pending(&self) -> u32 {
        let header = self.header();
        header
            .auto_write
            .load(Ordering::Acquire)
            .wrapping_sub(header.auto_read.load(Ordering::Acquire))
    }

    // -------------------------------------------------------------------
    // Descriptor blocks (bridge writes, host reads)
    // -------------------------------------------------------------------

    /// Rewrite both descriptor variants. Bridge side only; called after
    /// load and after any dispatch whose rule updates the descriptor.
    pub fn store_descriptor(&self, desc: &EffectDescriptor) {
        let header = self.header();
        let (raw32, raw64) = desc.to_raw();
        // SAFETY: descriptor updates happen only from the control thread
        // while no call is in flight that reads them.
        unsafe {
            *header.descriptor32.get() = raw32;
            *header.descriptor64.get() = raw64;
        }
    }

    /// Decode the descriptor variant matching this process's pointer width.
    pub fn load_descriptor(&self) -> Option<EffectDescriptor> {
        let header = self.header();
        #[cfg(target_pointer_width = "64")]
        // SAFETY: plain read of POD bytes; validity is carried by the magic.
        let desc = EffectDescriptor::from_raw64(unsafe { &*header.descriptor64.get() });
        #[cfg(target_pointer_width = "32")]
        let desc = EffectDescriptor::from_raw32(unsafe { &*header.descriptor32.get() });
        desc
    }

    /// Both raw variants, for width-agreement checks.
    pub fn load_descriptor_both(&self) -> (Option<EffectDescriptor>, Option<EffectDescriptor>) {
        let header = self.header();
        // SAFETY: as in load_descriptor.
        unsafe {
            (
                EffectDescriptor::from_raw32(&*header.descriptor32.get()),
                EffectDescriptor::from_raw64(&*header.descriptor64.get()),
            )
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if self.owns {
            let _ = std::fs::remove_file(segment_path(&self.name));
        }
    }
}

/// Secondary shared segment for one oversized payload.
///
/// Created by whichever side originates the call, opened by the peer via the
/// name carried inline in the slot, unlinked by the creator on drop.
pub struct AuxSegment {
    mmap: UnsafeCell<MmapMut>,
    name: String,
    size: usize,
    owns: bool,
}

// SAFETY: one side writes before publishing the slot, the other reads after
// claiming it; the slot status word orders the two.
unsafe impl Send for AuxSegment {}
unsafe impl Sync for AuxSegment {}

impl AuxSegment {
    pub fn create(name: String, size: usize) -> Result<Self> {
        let mmap = map_segment(&name, size.max(1), true)?;
        Ok(Self {
            mmap: UnsafeCell::new(mmap),
            name,
            size,
            owns: true,
        })
    }

    pub fn open(name: String, size: usize) -> Result<Self> {
        let mmap = map_segment(&name, size.max(1), false)?;
        if mmap.len() < size {
            return Err(BridgeError::SharedMemory(format!(
                "Aux segment {} too small: {} < {}",
                name,
                mmap.len(),
                size
            )));
        }
        Ok(Self {
            mmap: UnsafeCell::new(mmap),
            name,
            size,
            owns: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: reads are ordered against the peer's writes by the slot
        // status word.
        unsafe { &(&(*self.mmap.get()))[..self.size] }
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        if data.len() > self.size {
            return Err(BridgeError::SharedMemory(
                "Aux payload exceeds segment size".to_string(),
            ));
        }
        // SAFETY: only the creator writes, before publishing the slot.
        unsafe {
            (&mut (*self.mmap.get()))[..data.len()].copy_from_slice(data);
        }
        Ok(())
    }
}

impl Drop for AuxSegment {
    fn drop(&mut self) {
        if self.owns {
            let _ = std::fs::remove_file(segment_path(&self.name));
        }
    }
}

pub fn segment_path(name: &str) -> PathBuf {
    // On Linux, back segments with /dev/shm so they never hit a disk.
    #[cfg(target_os = "linux")]
    let base = PathBuf::from("/dev/shm");

    #[cfg(not(target_os = "linux"))]
    let base = std::env::temp_dir();

    base.join(name)
}

pub(crate) fn map_segment(name: &str, size: usize, create: bool) -> Result<MmapMut> {
    let path = segment_path(name);

    let file = if create {
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&path)
        }
        #[cfg(not(unix))]
        {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
        }
    } else {
        OpenOptions::new().read(true).write(true).open(&path)
    }
    .map_err(|e| {
        BridgeError::SharedMemory(format!("Failed to open shared segment {}: {}", name, e))
    })?;

    if create {
        file.set_len(size as u64).map_err(|e| {
            BridgeError::SharedMemory(format!("Failed to size shared segment {}: {}", name, e))
        })?;
    }

    // SAFETY: the file stays alive for the lifetime of the mapping; both
    // processes agree on the layout via magic/version words.
    unsafe { MmapMut::map_mut(&file) }.map_err(|e| {
        BridgeError::SharedMemory(format!("Failed to map shared segment {}: {}", name, e))
    })
}
