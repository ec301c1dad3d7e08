use std::io;
use std::time::Duration;

use thiserror::Error;

/// Everything that can go wrong while building or driving a channel.
///
/// Construction failures (`NameCollision`, `NotFound`, `MappingFailure`,
/// `Layout`) leave the endpoint unusable. Per-call failures (`TimedOut`,
/// `Abandoned`, `OversizePayload`, `BufferTooSmall`) leave it intact.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("'{name}' already exists")]
    NameCollision { name: String },

    #[error("'{name}' does not exist")]
    NotFound { name: String },

    #[error("wait on '{name}' timed out after {waited:?}")]
    TimedOut { name: String, waited: Duration },

    #[error("peer of '{name}' terminated while the channel was in use")]
    Abandoned { name: String },

    #[error("payload of {requested} bytes exceeds the capacity of {capacity} bytes")]
    OversizePayload { requested: usize, capacity: usize },

    #[error("message of {needed} bytes does not fit a {available} byte buffer")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("failed to map '{name}'")]
    MappingFailure {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("'{name}' is malformed: {reason}")]
    Layout { name: String, reason: &'static str },

    #[error("posting {count} to '{name}' would exceed its ceiling of {max}")]
    CountOverflow { name: String, count: u32, max: u32 },

    #[error("{op} failed for '{name}'")]
    Os {
        op: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, IpcError>;

impl IpcError {
    /// True for failures that leave the endpoint usable; the caller may
    /// retry (`TimedOut`), resize (`OversizePayload`, `BufferTooSmall`) or
    /// reset (`Abandoned`).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            IpcError::TimedOut { .. }
                | IpcError::Abandoned { .. }
                | IpcError::OversizePayload { .. }
                | IpcError::BufferTooSmall { .. }
                | IpcError::CountOverflow { .. }
        )
    }

    /// Maps an errno from a create/open call onto the taxonomy.
    pub fn from_open(op: &'static str, name: &str, source: io::Error) -> Self {
        match source.raw_os_error() {
            Some(libc::EEXIST) => IpcError::NameCollision {
                name: name.to_owned(),
            },
            Some(libc::ENOENT) => IpcError::NotFound {
                name: name.to_owned(),
            },
            _ => IpcError::Os {
                op,
                name: name.to_owned(),
                source,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_errors_map_onto_taxonomy() {
        let exists = IpcError::from_open("sem_open", "/x", io::Error::from_raw_os_error(libc::EEXIST));
        assert!(matches!(exists, IpcError::NameCollision { .. }));

        let missing = IpcError::from_open("sem_open", "/x", io::Error::from_raw_os_error(libc::ENOENT));
        assert!(matches!(missing, IpcError::NotFound { .. }));

        let denied = IpcError::from_open("sem_open", "/x", io::Error::from_raw_os_error(libc::EACCES));
        assert!(matches!(denied, IpcError::Os { op: "sem_open", .. }));
    }

    #[test]
    fn per_call_failures_are_recoverable() {
        let timed_out = IpcError::TimedOut {
            name: "/x".into(),
            waited: Duration::from_millis(5),
        };
        assert!(timed_out.is_recoverable());
        assert!(
            IpcError::OversizePayload {
                requested: 10,
                capacity: 4
            }
            .is_recoverable()
        );
        assert!(!IpcError::NotFound { name: "/x".into() }.is_recoverable());
    }
}
