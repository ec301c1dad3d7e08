//! Binary layout of a channel's shared segment.
//!
//! # Memory Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          SlotHeader                              │
//! │  ┌────────┬─────────┬──────────┬─────────┬──────────┬─────┬─────┐ │
//! │  │ magic  │ version │ capacity │ creator │ attacher │ len │ seq │ │
//! │  │ (8B)   │ (8B)    │ (8B)     │ pid(4B) │ pid (4B) │(8B) │(8B) │ │
//! │  └────────┴─────────┴──────────┴─────────┴──────────┴─────┴─────┘ │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                  payload: capacity bytes                         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The payload holds at most one message. Who may touch it is decided by the
//! channel's two semaphores, not by anything in the header.

use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// ASCII "TANDEMS1".
pub const SLOT_MAGIC: u64 = 0x5441_4E44_454D_5331;

/// Bump on any incompatible layout change.
pub const SLOT_VERSION: u64 = 1;

/// Payload capacity used when the caller does not pick one.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Header at offset 0 of every channel segment.
///
/// `#[repr(C)]` keeps the field order identical in both processes.
#[repr(C)]
pub struct SlotHeader {
    /// Written last by the creator; a matching value means the rest of the
    /// header is initialized.
    pub magic: AtomicU64,

    pub version: u64,

    /// Payload bytes following the header. Fixed for the segment's lifetime.
    pub capacity: u64,

    /// Pid of the creating process, 0 once it has left cleanly.
    pub creator_pid: AtomicU32,

    /// Pid of the attached process, 0 while nobody is attached.
    pub attacher_pid: AtomicU32,

    /// Length of the message currently in the slot.
    pub len: AtomicU64,

    /// Number of messages ever written to the slot.
    pub seq: AtomicU64,
}

impl SlotHeader {
    /// Writes a fresh header at `base`.
    ///
    /// # Safety
    /// `base` must point to at least `size_of::<SlotHeader>()` writable,
    /// suitably aligned bytes that no other process reads yet.
    pub unsafe fn init(base: *mut u8, capacity: usize, creator_pid: u32) {
        let h = base as *mut SlotHeader;
        // SAFETY: guaranteed by the caller.
        unsafe {
            std::ptr::write(
                h,
                SlotHeader {
                    magic: AtomicU64::new(0),
                    version: SLOT_VERSION,
                    capacity: capacity as u64,
                    creator_pid: AtomicU32::new(creator_pid),
                    attacher_pid: AtomicU32::new(0),
                    len: AtomicU64::new(0),
                    seq: AtomicU64::new(0),
                },
            );
            (*h).magic.store(SLOT_MAGIC, Ordering::Release);
        }
    }

    /// Checks a header found in a segment of `mapped_len` bytes.
    pub fn validate(&self, mapped_len: usize) -> Result<(), &'static str> {
        if self.magic.load(Ordering::Acquire) != SLOT_MAGIC {
            return Err("bad magic");
        }
        if self.version != SLOT_VERSION {
            return Err("wrong version");
        }
        if self.capacity == 0 {
            return Err("zero capacity");
        }
        let Ok(capacity) = usize::try_from(self.capacity) else {
            return Err("capacity out of range");
        };
        if bytes_for_slot(capacity) > mapped_len {
            return Err("capacity exceeds the mapped segment");
        }
        Ok(())
    }
}

/// Total segment size for a payload of `capacity` bytes.
pub fn bytes_for_slot(capacity: usize) -> usize {
    size_of::<SlotHeader>().saturating_add(capacity)
}
