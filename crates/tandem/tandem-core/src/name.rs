//! Bounded, prefixed names for POSIX named objects.
//!
//! POSIX requires a leading `/` and no further slashes, and some platforms
//! (macOS) cap semaphore names at 31 bytes. Every name built here is at most
//! `NAME_CAPACITY - 1` bytes so the same name is valid everywhere.
//!
//! Overflow is truncated, not rejected: two ids that only differ past the
//! truncation point map to the same object name.

use std::ffi::CString;
use std::fmt;
use std::io;

/// Capacity of a name in bytes, terminator included.
pub const NAME_CAPACITY: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectName {
    inner: String,
}

impl ObjectName {
    /// Joins `prefix` and `id`, truncating `id` so the result fits in
    /// `NAME_CAPACITY - 1` bytes.
    ///
    /// Bytes that POSIX forbids inside a name (`/`, NUL) are replaced with `_`.
    /// The result only depends on the inputs, so repeated calls agree.
    pub fn build(prefix: &str, id: &str) -> Self {
        let limit = NAME_CAPACITY - 1;
        let mut inner = String::with_capacity(limit);

        // The prefix is a library constant but is still held to the same limit.
        push_truncated(&mut inner, prefix, limit, true);
        push_truncated(&mut inner, id, limit, false);

        Self { inner }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.inner
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Terminated form for the libc calls.
    pub fn to_c_string(&self) -> io::Result<CString> {
        CString::new(self.inner.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }
}

fn push_truncated(out: &mut String, part: &str, limit: usize, keep_leading_slash: bool) {
    for (i, ch) in part.chars().enumerate() {
        let ch = match ch {
            '/' if keep_leading_slash && i == 0 && out.is_empty() => '/',
            '/' | '\0' => '_',
            other => other,
        };
        if out.len() + ch.len_utf8() > limit {
            return;
        }
        out.push(ch);
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner)
    }
}

impl AsRef<str> for ObjectName {
    fn as_ref(&self) -> &str {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_ids_are_kept_verbatim() {
        let name = ObjectName::build("/tdm-full-", "client");
        assert_eq!(name.as_str(), "/tdm-full-client");
        assert_eq!(name.to_string(), "/tdm-full-client");
    }

    #[test]
    fn oversize_ids_are_truncated_to_capacity() {
        let id = "x".repeat(100);
        let name = ObjectName::build("/tdm-full-", &id);
        assert_eq!(name.len(), NAME_CAPACITY - 1);
        assert!(name.as_str().starts_with("/tdm-full-xxx"));
    }

    #[test]
    fn truncation_is_deterministic() {
        let id = "a-very-long-channel-identifier-that-overflows";
        let first = ObjectName::build("/tdm-shm-", id);
        let second = ObjectName::build("/tdm-shm-", id);
        assert_eq!(first, second);
    }

    #[test]
    fn ids_sharing_a_truncated_prefix_collide() {
        let base = "0123456789abcdefghijklmnopqrstuvwxyz";
        let a = ObjectName::build("/tdm-shm-", &format!("{base}-left"));
        let b = ObjectName::build("/tdm-shm-", &format!("{base}-right"));
        assert_eq!(a, b);
    }

    #[test]
    fn truncation_never_splits_a_character() {
        let id = "é".repeat(40);
        let name = ObjectName::build("/tdm-shm-", &id);
        assert!(name.len() <= NAME_CAPACITY - 1);
        assert!(name.as_str().ends_with('é'));
    }

    #[test]
    fn forbidden_bytes_are_replaced() {
        let name = ObjectName::build("/tdm-shm-", "a/b\0c");
        assert_eq!(name.as_str(), "/tdm-shm-a_b_c");
        assert!(name.to_c_string().is_ok());
    }
}
