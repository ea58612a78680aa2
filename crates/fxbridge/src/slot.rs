//! Message slots: fixed cells in the shared region that carry one serialized
//! message each through a strict status lifecycle.
//!
//! Lifecycle (all transitions are CAS on the status word):
//!
//! ```text
//! Free -> Sent -> Received -> Done -> Delivered -> Free
//! ```
//!
//! The sender claims a Free slot, writes the request and marks it Sent. The
//! receiver claims it with Sent -> Received (the CAS makes delivery
//! at-most-once even with several service threads), overwrites the payload
//! with the reply and marks it Done. The original sender picks the reply up
//! with Done -> Delivered, copies it out and releases the cell back to Free.
//!
//! Payloads larger than the inline area travel through a one-shot auxiliary
//! segment; the inline bytes then carry only its name and size.

use crate::error::{BridgeError, Result};
use crate::shm::AuxSegment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

/// Inline payload capacity per slot. Anything bigger escapes to an aux
/// segment.
pub const SLOT_PAYLOAD: usize = 1024;

/// Payload lives in an auxiliary segment; the inline bytes hold an
/// [`AuxRef`].
pub const FLAG_AUX: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SlotStatus {
    Free = 0,
    Sent = 1,
    Received = 2,
    Done = 3,
    Delivered = 4,
}

/// Inline stand-in for an escaped payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuxRef {
    pub name: String,
    pub size: u64,
}

#[repr(C)]
pub struct Slot {
    status: AtomicU32,
    flags: AtomicU32,
    len: AtomicU32,
    _pad: u32,
    payload: UnsafeCell<[u8; SLOT_PAYLOAD]>,
}

impl Slot {
    pub fn status(&self) -> u32 {
        self.status.load(Ordering::Acquire)
    }

    /// CAS the status word. The release/acquire pair on success is what
    /// orders payload access between the two sides.
    pub fn transition(&self, from: SlotStatus, to: SlotStatus) -> bool {
        self.status
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.flags.store(0, Ordering::Relaxed);
        self.len.store(0, Ordering::Relaxed);
        self.status.store(SlotStatus::Free as u32, Ordering::Release);
    }

    /// Write a raw payload into a slot this side owns (claimed Free, or
    /// Received when writing a reply). Oversized payloads are copied into a
    /// fresh aux segment named by `aux_name`; the segment is returned and
    /// must outlive the peer's read.
    pub fn write_payload(
        &self,
        data: &[u8],
        aux_name: impl FnOnce() -> String,
    ) -> Result<Option<AuxSegment>> {
        if data.len() <= SLOT_PAYLOAD {
            // SAFETY: the caller owns the slot; the subsequent status store
            // publishes these bytes to the peer.
            unsafe {
                (&mut (*self.payload.get()))[..data.len()].copy_from_slice(data);
            }
            self.flags.store(0, Ordering::Relaxed);
            self.len.store(data.len() as u32, Ordering::Relaxed);
            return Ok(None);
        }

        let segment = AuxSegment::create(aux_name(), data.len())?;
        segment.write(data)?;
        let aux_ref = bincode::serialize(&AuxRef {
            name: segment.name().to_string(),
            size: data.len() as u64,
        })?;
        debug_assert!(aux_ref.len() <= SLOT_PAYLOAD);
        // SAFETY: as above.
        unsafe {
            (&mut (*self.payload.get()))[..aux_ref.len()].copy_from_slice(&aux_ref);
        }
        self.flags.store(FLAG_AUX, Ordering::Relaxed);
        self.len.store(aux_ref.len() as u32, Ordering::Relaxed);
        Ok(Some(segment))
    }

    /// Read the payload of a slot this side has claimed (Received or
    /// Delivered), following the aux indirection if present.
    pub fn read_payload(&self) -> Result<Vec<u8>> {
        let len = self.len.load(Ordering::Relaxed) as usize;
        if len > SLOT_PAYLOAD {
            return Err(BridgeError::Protocol(format!(
                "Slot payload length {} exceeds inline capacity",
                len
            )));
        }
        // SAFETY: claiming the slot acquired the writer's release store.
        let inline = unsafe { (&(*self.payload.get()))[..len].to_vec() };

        if self.flags.load(Ordering::Relaxed) & FLAG_AUX == 0 {
            return Ok(inline);
        }

        let aux_ref: AuxRef = bincode::deserialize(&inline)?;
        let segment = AuxSegment::open(aux_ref.name, aux_ref.size as usize)?;
        Ok(segment.bytes().to_vec())
    }

    pub fn write_message<T: Serialize>(
        &self,
        message: &T,
        aux_name: impl FnOnce() -> String,
    ) -> Result<Option<AuxSegment>> {
        let bytes = bincode::serialize(message)?;
        self.write_payload(&bytes, aux_name)
    }

    pub fn read_message<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes = self.read_payload()?;
        Ok(bincode::deserialize(&bytes)?)
    }
}
