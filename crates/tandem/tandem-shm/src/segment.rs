//! Fixed-size named shared memory.
//!
//! A segment is a POSIX shared memory object (`shm_open`) mapped read-write
//! with `memmap2`. The creator decides the size once; attachers take whatever
//! size the object has.
//!
//! Mapping is lazy: nothing is mapped until the first [`SharedSegment::map`]
//! call, and later calls hand back the same mapping.

use std::fs::{File, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;

use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use tandem_core::{AccessDescriptor, IpcError, ObjectName, Result, Role};
use tracing::{debug, error, warn};

#[derive(Debug)]
pub struct SharedSegment {
    name: ObjectName,
    file: File,
    /// Declared size for a creator; resolved from the object for an attacher.
    size: usize,
    mmap: Option<MmapMut>,
    role: Role,
}

impl SharedSegment {
    /// Creates (`Role::Creator`) or attaches to (`Role::Attacher`) the
    /// segment called `name`.
    ///
    /// A creator allocates `size` zeroed bytes. An attacher ignores `size`
    /// and trusts the creator.
    ///
    /// # Errors
    /// - `NameCollision` if a creator finds the name taken
    /// - `NotFound` if an attacher finds nothing to attach to
    pub fn open(
        name: ObjectName,
        size: usize,
        role: Role,
        access: &AccessDescriptor,
    ) -> Result<Self> {
        if role.is_creator() && size == 0 {
            return Err(IpcError::Os {
                op: "shm_open",
                name: name.to_string(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "segment size must be non-zero"),
            });
        }

        let (flags, mode) = match role {
            Role::Creator => (
                OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
                Mode::from_bits_truncate(access.mode() as libc::mode_t),
            ),
            Role::Attacher => (OFlag::O_RDWR, Mode::empty()),
        };

        let fd = shm_open(name.as_str(), flags, mode).map_err(|errno| {
            let err = IpcError::from_open("shm_open", name.as_str(), io::Error::from(errno));
            match &err {
                IpcError::NameCollision { .. } => warn!(%name, "segment already exists"),
                IpcError::NotFound { .. } => debug!(%name, "segment not created yet"),
                other => error!(%name, error = %other, "shm_open failed"),
            }
            err
        })?;

        let mut segment = Self {
            name,
            file: File::from(fd),
            size,
            mmap: None,
            role,
        };

        // From here on a failure drops `segment`, which unlinks a fresh name.
        match role {
            Role::Creator => segment.initialize(access)?,
            Role::Attacher => segment.size = segment.resolved_size()?,
        }

        debug!(name = %segment.name, %role, size = segment.size, "segment opened");
        Ok(segment)
    }

    fn initialize(&mut self, access: &AccessDescriptor) -> Result<()> {
        // shm_open applied the umask; put the requested bits back.
        self.file
            .set_permissions(Permissions::from_mode(access.mode()))
            .map_err(|e| self.os_error("fchmod", e))?;
        // ftruncate on a new object zero-fills it.
        self.file
            .set_len(self.size as u64)
            .map_err(|e| self.os_error("ftruncate", e))
    }

    fn resolved_size(&self) -> Result<usize> {
        let meta = self.file.metadata().map_err(|e| self.os_error("fstat", e))?;
        Ok(meta.len() as usize)
    }

    /// Maps the segment on first use and returns the whole mapping.
    ///
    /// An attacher re-reads the object's size here, so a creator that was
    /// still sizing the object during `open` is picked up.
    ///
    /// # Errors
    /// `MappingFailure` if the object is empty or `mmap` fails.
    pub fn map(&mut self) -> Result<&mut [u8]> {
        let mmap = match self.mmap.take() {
            Some(mmap) => mmap,
            None => self.map_fresh()?,
        };
        Ok(&mut self.mmap.insert(mmap)[..])
    }

    fn map_fresh(&mut self) -> Result<MmapMut> {
        if !self.role.is_creator() {
            self.size = self.resolved_size()?;
        }
        if self.size == 0 {
            error!(name = %self.name, "refusing to map an empty segment");
            return Err(IpcError::MappingFailure {
                name: self.name.to_string(),
                source: io::Error::new(io::ErrorKind::UnexpectedEof, "segment has no size yet"),
            });
        }

        // SAFETY: the mapping is shared with other processes by design; all
        // access to its contents goes through raw pointers coordinated by the
        // channel protocol.
        let mmap = unsafe { MmapOptions::new().len(self.size).map_mut(&self.file) };
        mmap.map_err(|source| {
            error!(name = %self.name, error = %source, "mmap failed");
            IpcError::MappingFailure {
                name: self.name.to_string(),
                source,
            }
        })
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.mmap.is_some()
    }

    /// Declared (creator) or resolved (attacher) size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn name(&self) -> &ObjectName {
        &self.name
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Removes `name` from the namespace. Returns `false` if it did not exist.
    ///
    /// Existing mappings in any process stay valid.
    pub fn unlink(name: &ObjectName) -> Result<bool> {
        match shm_unlink(name.as_str()) {
            Ok(()) => {
                debug!(%name, "segment unlinked");
                Ok(true)
            }
            Err(Errno::ENOENT) => Ok(false),
            Err(errno) => Err(IpcError::Os {
                op: "shm_unlink",
                name: name.to_string(),
                source: io::Error::from(errno),
            }),
        }
    }

    fn os_error(&self, op: &'static str, source: io::Error) -> IpcError {
        error!(name = %self.name, op, error = %source, "segment call failed");
        IpcError::Os {
            op,
            name: self.name.to_string(),
            source,
        }
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // The mapping and descriptor are released by their own drops.
        if self.role.is_creator()
            && let Err(e) = Self::unlink(&self.name)
        {
            warn!(name = %self.name, error = %e, "failed to unlink segment");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static NEXT: AtomicU32 = AtomicU32::new(0);

    fn unique_name() -> ObjectName {
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        ObjectName::build("/tdm-test-", &format!("m{}-{n}", std::process::id()))
    }

    fn open(name: &ObjectName, size: usize, role: Role) -> Result<SharedSegment> {
        SharedSegment::open(name.clone(), size, role, AccessDescriptor::process_default())
    }

    #[test]
    fn created_segment_is_zeroed() {
        let name = unique_name();
        let mut seg = open(&name, 256, Role::Creator).expect("create");
        assert!(!seg.is_mapped());

        let bytes = seg.map().expect("map");
        assert_eq!(bytes.len(), 256);
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn attacher_sees_creator_writes_and_size() {
        let name = unique_name();
        let mut creator = open(&name, 128, Role::Creator).expect("create");
        creator.map().expect("map")[..4].copy_from_slice(b"PING");

        let mut attacher = open(&name, 0, Role::Attacher).expect("attach");
        assert_eq!(attacher.len(), 128);
        assert_eq!(&attacher.map().expect("map")[..4], b"PING");
    }

    #[test]
    fn map_is_idempotent() {
        let name = unique_name();
        let mut seg = open(&name, 64, Role::Creator).expect("create");
        let first = seg.map().expect("map").as_ptr();
        let second = seg.map().expect("map").as_ptr();
        assert_eq!(first, second);
    }

    #[test]
    fn second_creator_collides() {
        let name = unique_name();
        let _first = open(&name, 64, Role::Creator).expect("create");
        assert!(matches!(
            open(&name, 64, Role::Creator),
            Err(IpcError::NameCollision { .. })
        ));
    }

    #[test]
    fn attacher_without_creator_is_not_found() {
        let name = unique_name();
        assert!(matches!(
            open(&name, 0, Role::Attacher),
            Err(IpcError::NotFound { .. })
        ));
    }

    #[test]
    fn zero_size_creation_is_rejected() {
        let name = unique_name();
        assert!(open(&name, 0, Role::Creator).is_err());
        assert!(matches!(
            open(&name, 0, Role::Attacher),
            Err(IpcError::NotFound { .. })
        ));
    }

    #[test]
    fn creator_drop_unlinks_but_attacher_mapping_survives() {
        let name = unique_name();
        let mut creator = open(&name, 64, Role::Creator).expect("create");
        creator.map().expect("map")[0] = 7;

        let mut attacher = open(&name, 0, Role::Attacher).expect("attach");
        attacher.map().expect("map");
        drop(creator);

        assert_eq!(attacher.map().expect("map")[0], 7);
        assert!(matches!(
            open(&name, 0, Role::Attacher),
            Err(IpcError::NotFound { .. })
        ));
    }
}
