//! Access control applied to every named object at creation time.

use std::sync::OnceLock;

/// Permission bits handed to `sem_open` / `shm_open` when an object is
/// created. Attachers never consult it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessDescriptor {
    mode: u32,
}

impl AccessDescriptor {
    /// Read-write for owner, group and others.
    pub const PERMISSIVE_MODE: u32 = 0o666;

    pub const fn new(mode: u32) -> Self {
        Self { mode: mode & 0o777 }
    }

    /// Only the creating user may open the objects.
    pub const fn owner_only() -> Self {
        Self::new(0o600)
    }

    /// The descriptor used when a caller does not supply one.
    ///
    /// Built on first use and never mutated afterwards.
    pub fn process_default() -> &'static AccessDescriptor {
        static DEFAULT: OnceLock<AccessDescriptor> = OnceLock::new();
        DEFAULT.get_or_init(|| AccessDescriptor::new(Self::PERMISSIVE_MODE))
    }

    #[inline]
    pub const fn mode(&self) -> u32 {
        self.mode
    }
}

impl Default for AccessDescriptor {
    fn default() -> Self {
        *Self::process_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_default_is_a_single_permissive_value() {
        let a = AccessDescriptor::process_default();
        let b = AccessDescriptor::process_default();
        assert!(std::ptr::eq(a, b));
        assert_eq!(a.mode(), 0o666);
    }

    #[test]
    fn non_permission_bits_are_masked() {
        assert_eq!(AccessDescriptor::new(0o4755).mode(), 0o755);
        assert_eq!(AccessDescriptor::owner_only().mode(), 0o600);
    }
}
