//! One-way, single-slot message lane between two processes.
//!
//! A channel is three named objects sharing one logical id:
//!
//! - `slot-empty` semaphore (starts at 1): the slot may be written
//! - `slot-full` semaphore (starts at 0): the slot holds an unread message
//! - a shared segment holding a [`SlotHeader`] and the payload
//!
//! # Protocol
//!
//! **Send:** wait `slot-empty` → copy payload in → post `slot-full`
//!
//! **Receive:** wait `slot-full` → copy payload out → post `slot-empty`
//!
//! Exactly one side owns the payload between two successful waits, so the
//! payload needs no lock of its own. `sem_post`/`sem_wait` order memory, so
//! the copy made before a post is visible after the matching wait.

use std::io;
use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tandem_core::{AccessDescriptor, IpcError, ObjectName, Result, Role, Timeout};
use tandem_sema::{CountingSemaphore, WaitOutcome};
use tandem_shm::SharedSegment;
use tracing::{debug, error, trace, warn};

use crate::peer::{current_pid, process_alive};
use crate::slot_layout::{DEFAULT_CAPACITY, SlotHeader, bytes_for_slot};

// Equal lengths, so every object of a channel truncates its id at the same byte.
const FULL_PREFIX: &str = "/tdm-f-";
const EMPTY_PREFIX: &str = "/tdm-e-";
const SEGMENT_PREFIX: &str = "/tdm-m-";

/// Tunables for a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Payload capacity in bytes. Only the creator's value counts.
    pub capacity: usize,
    /// How often a blocked wait checks that the peer process still exists.
    /// Zero disables the check.
    pub liveness_interval: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            liveness_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Debug)]
pub struct Channel {
    id: String,
    full: CountingSemaphore,
    empty: CountingSemaphore,
    /// Keeps the mapping behind `base` alive.
    segment: SharedSegment,
    base: NonNull<u8>,
    capacity: usize,
    role: Role,
    liveness_interval: Duration,
}

// SAFETY: `base` points into `segment`'s mapping, which lives exactly as long
// as the channel and does not move with it. The semaphores are thread-safe.
unsafe impl Send for Channel {}

impl Channel {
    /// Allocates the semaphores and segment for `id`.
    ///
    /// # Errors
    /// - `Os` (invalid input) for a zero capacity, before anything is created
    /// - `NameCollision` if any of the objects already exists, meaning another
    ///   process initialized this channel. Objects created before the
    ///   collision are removed again.
    pub fn create(id: &str, options: ChannelOptions, access: &AccessDescriptor) -> Result<Self> {
        if options.capacity == 0 {
            error!(id, "refusing to create a channel with zero capacity");
            return Err(IpcError::Os {
                op: "channel create",
                name: id.to_owned(),
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "payload capacity must be non-zero",
                ),
            });
        }

        let mut segment = SharedSegment::open(
            ObjectName::build(SEGMENT_PREFIX, id),
            bytes_for_slot(options.capacity),
            Role::Creator,
            access,
        )?;
        let base = map_base(&mut segment, bytes_for_slot(options.capacity))?;

        // SAFETY: `base` is the start of a fresh page-aligned mapping of at
        // least header + capacity bytes, and no peer can attach before the
        // semaphores below exist.
        unsafe { SlotHeader::init(base.as_ptr(), options.capacity, current_pid()) };

        let empty = CountingSemaphore::open(
            ObjectName::build(EMPTY_PREFIX, id),
            1,
            1,
            Role::Creator,
            access,
        )?;
        // Created last: once an attacher can open it, everything else exists.
        let full = CountingSemaphore::open(
            ObjectName::build(FULL_PREFIX, id),
            0,
            1,
            Role::Creator,
            access,
        )?;

        debug!(id, capacity = options.capacity, "channel created");
        Ok(Self {
            id: id.to_owned(),
            full,
            empty,
            segment,
            base,
            capacity: options.capacity,
            role: Role::Creator,
            liveness_interval: options.liveness_interval,
        })
    }

    /// Attaches to the channel `id` created by another process.
    ///
    /// The payload capacity is taken from the creator's header;
    /// `options.capacity` is ignored.
    ///
    /// # Errors
    /// - `NotFound` if the creator has not (fully) set the channel up yet
    /// - `MappingFailure` / `Layout` if the segment cannot be used
    pub fn attach(id: &str, options: ChannelOptions, access: &AccessDescriptor) -> Result<Self> {
        let full = CountingSemaphore::open(
            ObjectName::build(FULL_PREFIX, id),
            0,
            1,
            Role::Attacher,
            access,
        )?;
        let empty = CountingSemaphore::open(
            ObjectName::build(EMPTY_PREFIX, id),
            1,
            1,
            Role::Attacher,
            access,
        )?;
        let mut segment = SharedSegment::open(
            ObjectName::build(SEGMENT_PREFIX, id),
            0,
            Role::Attacher,
            access,
        )?;
        let base = map_base(&mut segment, size_of::<SlotHeader>())?;

        // SAFETY: the mapping holds at least a header (checked by map_base).
        let header = unsafe { &*(base.as_ptr() as *const SlotHeader) };
        if let Err(reason) = header.validate(segment.len()) {
            error!(id, reason, "segment header rejected");
            return Err(IpcError::Layout {
                name: segment.name().to_string(),
                reason,
            });
        }
        let capacity = header.capacity as usize;
        if capacity != options.capacity {
            debug!(id, capacity, requested = options.capacity, "using creator's capacity");
        }
        header.attacher_pid.store(current_pid(), Ordering::Release);

        debug!(id, capacity, "channel attached");
        Ok(Self {
            id: id.to_owned(),
            full,
            empty,
            segment,
            base,
            capacity,
            role: Role::Attacher,
            liveness_interval: options.liveness_interval,
        })
    }

    /// Removes the names behind `id`. Returns how many existed.
    ///
    /// Meant for cleaning up after a creator that crashed; processes still
    /// holding the objects are unaffected.
    pub fn purge(id: &str) -> Result<usize> {
        let mut removed = 0;
        for prefix in [FULL_PREFIX, EMPTY_PREFIX] {
            removed += usize::from(CountingSemaphore::unlink(&ObjectName::build(prefix, id))?);
        }
        removed += usize::from(SharedSegment::unlink(&ObjectName::build(SEGMENT_PREFIX, id))?);
        if removed > 0 {
            warn!(id, removed, "purged stale channel objects");
        }
        Ok(removed)
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Number of messages written to this channel so far, by either process.
    pub fn sequence(&self) -> u64 {
        self.header().seq.load(Ordering::Relaxed)
    }

    /// Copies `payload` into the slot once it is free.
    ///
    /// # Errors
    /// - `OversizePayload` before anything is touched
    /// - `TimedOut` / `Abandoned` if the slot did not free up; the previous
    ///   message is left as it was
    pub fn send(&mut self, payload: &[u8], timeout: Timeout) -> Result<()> {
        if payload.len() > self.capacity {
            warn!(id = %self.id, len = payload.len(), capacity = self.capacity, "payload too large");
            return Err(IpcError::OversizePayload {
                requested: payload.len(),
                capacity: self.capacity,
            });
        }

        self.acquire(&self.empty, timeout)?;

        // SAFETY: holding `slot-empty` gives this side exclusive access to the
        // payload, which is `capacity >= payload.len()` bytes long.
        unsafe {
            ptr::copy_nonoverlapping(payload.as_ptr(), self.payload_ptr(), payload.len());
        }
        let header = self.header();
        header.len.store(payload.len() as u64, Ordering::Relaxed);

        if let Err(e) = self.full.post(1) {
            // Hand the slot back rather than leave both counts at zero.
            error!(id = %self.id, error = %e, "failed to publish message");
            if let Err(rollback) = self.empty.post(1) {
                error!(id = %self.id, error = %rollback, "failed to release the slot after a failed publish");
            }
            return Err(e);
        }
        let seq = header.seq.fetch_add(1, Ordering::Relaxed) + 1;

        trace!(id = %self.id, seq, len = payload.len(), "sent");
        Ok(())
    }

    /// Copies the pending message into `buf` and frees the slot.
    ///
    /// Returns the message length.
    ///
    /// # Errors
    /// - `OversizePayload` if `buf` is larger than the capacity
    /// - `TimedOut` / `Abandoned` if no message arrived; `buf` is untouched
    /// - `BufferTooSmall` if the message does not fit; it stays in the slot
    pub fn receive(&mut self, buf: &mut [u8], timeout: Timeout) -> Result<usize> {
        if buf.len() > self.capacity {
            warn!(id = %self.id, len = buf.len(), capacity = self.capacity, "receive buffer too large");
            return Err(IpcError::OversizePayload {
                requested: buf.len(),
                capacity: self.capacity,
            });
        }

        self.acquire(&self.full, timeout)?;

        let header = self.header();
        let len = header.len.load(Ordering::Relaxed) as usize;
        if len > self.capacity {
            error!(id = %self.id, len, "slot length exceeds capacity");
            self.empty.post(1)?;
            return Err(IpcError::Layout {
                name: self.segment.name().to_string(),
                reason: "message length exceeds capacity",
            });
        }
        if len > buf.len() {
            warn!(id = %self.id, len, available = buf.len(), "receive buffer too small");
            self.full.post(1)?;
            return Err(IpcError::BufferTooSmall {
                needed: len,
                available: buf.len(),
            });
        }

        // SAFETY: holding `slot-full` gives this side exclusive access to the
        // payload, and `len <= capacity`.
        unsafe {
            ptr::copy_nonoverlapping(self.payload_ptr(), buf.as_mut_ptr(), len);
        }
        let seq = header.seq.load(Ordering::Relaxed);

        self.empty.post(1)?;

        trace!(id = %self.id, seq, len, "received");
        Ok(len)
    }

    /// Puts the channel back into its initial state: no pending message and
    /// the slot free for writing.
    ///
    /// Only sound while the peer is not using the channel, typically after a
    /// send or receive reported `Abandoned`. Also forgets the dead peer's pid.
    pub fn reset(&mut self) -> Result<()> {
        while self.full.try_wait()? {}
        while self.empty.try_wait()? {}
        self.empty.post(1)?;

        let header = self.header();
        header.len.store(0, Ordering::Relaxed);
        match self.role {
            Role::Creator => header.attacher_pid.store(0, Ordering::Release),
            Role::Attacher => header.creator_pid.store(0, Ordering::Release),
        }

        warn!(id = %self.id, "channel reset");
        Ok(())
    }

    fn acquire(&self, sem: &CountingSemaphore, timeout: Timeout) -> Result<()> {
        let start = Instant::now();
        let outcome = sem.wait_watched(timeout, self.liveness_interval, || self.peer_alive())?;
        match outcome {
            WaitOutcome::Acquired => Ok(()),
            WaitOutcome::TimedOut => {
                let waited = start.elapsed();
                warn!(id = %self.id, sem = %sem.name(), ?waited, "wait timed out");
                Err(IpcError::TimedOut {
                    name: sem.name().to_string(),
                    waited,
                })
            }
            WaitOutcome::Abandoned => {
                warn!(id = %self.id, sem = %sem.name(), "peer abandoned the channel");
                Err(IpcError::Abandoned {
                    name: sem.name().to_string(),
                })
            }
        }
    }

    fn peer_alive(&self) -> bool {
        let header = self.header();
        let pid = match self.role {
            Role::Creator => header.attacher_pid.load(Ordering::Acquire),
            Role::Attacher => header.creator_pid.load(Ordering::Acquire),
        };
        // Nobody registered: there is no peer that could have died.
        pid == 0 || process_alive(pid)
    }

    #[inline(always)]
    fn header(&self) -> &SlotHeader {
        // SAFETY: `base` points to a header that was initialized (creator) or
        // validated (attacher) before the channel was built.
        unsafe { &*(self.base.as_ptr() as *const SlotHeader) }
    }

    #[inline(always)]
    fn payload_ptr(&self) -> *mut u8 {
        // SAFETY: the mapping is at least header + capacity bytes long.
        unsafe { self.base.as_ptr().add(size_of::<SlotHeader>()) }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Leave cleanly so the peer sees a timeout rather than an abandonment.
        let me = current_pid();
        let header = self.header();
        let slot = match self.role {
            Role::Creator => &header.creator_pid,
            Role::Attacher => &header.attacher_pid,
        };
        let _ = slot.compare_exchange(me, 0, Ordering::AcqRel, Ordering::Relaxed);
        debug!(id = %self.id, role = %self.role, "channel closed");
    }
}

/// Maps `segment` and checks it holds at least `needed` bytes.
fn map_base(segment: &mut SharedSegment, needed: usize) -> Result<NonNull<u8>> {
    let name = segment.name().to_string();
    let bytes = segment.map()?;
    if bytes.len() < needed {
        error!(%name, len = bytes.len(), needed, "segment smaller than expected");
        return Err(IpcError::Layout {
            name,
            reason: "segment smaller than its header",
        });
    }
    NonNull::new(bytes.as_mut_ptr()).ok_or(IpcError::Layout {
        name,
        reason: "segment mapped at null",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    static NEXT: AtomicU32 = AtomicU32::new(0);

    fn unique_id() -> String {
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        format!("u{}-{n}", std::process::id())
    }

    fn create(id: &str, capacity: usize) -> Result<Channel> {
        let options = ChannelOptions {
            capacity,
            ..ChannelOptions::default()
        };
        Channel::create(id, options, AccessDescriptor::process_default())
    }

    #[test]
    fn prefixes_truncate_ids_at_the_same_byte() {
        let id = "z".repeat(64);
        let lens: Vec<usize> = [FULL_PREFIX, EMPTY_PREFIX, SEGMENT_PREFIX]
            .iter()
            .map(|p| {
                assert_eq!(p.len(), FULL_PREFIX.len());
                let name = ObjectName::build(p, &id);
                name.len() - p.len()
            })
            .collect();
        assert!(lens.iter().all(|&kept| kept == lens[0]), "kept {lens:?}");
    }

    #[test]
    fn zero_capacity_is_rejected_before_anything_exists() {
        let id = unique_id();
        let err = create(&id, 0).unwrap_err();
        assert!(matches!(err, IpcError::Os { op: "channel create", .. }), "got {err:?}");
        assert_eq!(Channel::purge(&id).expect("purge"), 0);
    }

    #[test]
    fn failed_publish_is_not_counted_and_frees_the_slot() {
        let id = unique_id();
        let mut channel = create(&id, 16).expect("create");

        // A stray post leaves `slot-full` at its ceiling, so publishing fails.
        channel.full.post(1).expect("stray post");
        if channel.full.value().expect("value").is_none() {
            // No sem_getvalue: the ceiling cannot be enforced here.
            return;
        }

        let err = channel.send(b"lost", Timeout::from_millis(100)).unwrap_err();
        assert!(matches!(err, IpcError::CountOverflow { .. }), "got {err:?}");
        assert_eq!(channel.sequence(), 0);
        assert_eq!(channel.empty.value().expect("value"), Some(1));
    }
}
