use std::fmt;
use std::time::{Duration, Instant};

/// Startup role for a named object.
///
/// Exactly one process creates the objects behind a channel name; the other
/// attaches. Only the creator removes the name again when it is done.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Creator,
    Attacher,
}

impl Role {
    #[inline]
    pub fn is_creator(self) -> bool {
        matches!(self, Role::Creator)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Creator => f.write_str("creator"),
            Role::Attacher => f.write_str("attacher"),
        }
    }
}

/// How long a blocking call may wait.
///
/// There is no default: an unbounded wait has to be asked for by name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    Bounded(Duration),
    Infinite,
}

impl Timeout {
    pub const fn from_millis(ms: u64) -> Self {
        Timeout::Bounded(Duration::from_millis(ms))
    }

    /// Absolute deadline for a wait starting at `start`, `None` when unbounded.
    ///
    /// A bound too large to represent is treated as unbounded.
    pub fn deadline_from(self, start: Instant) -> Option<Instant> {
        match self {
            Timeout::Bounded(d) => start.checked_add(d),
            Timeout::Infinite => None,
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::Bounded(d)
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeout::Bounded(d) => write!(f, "{d:?}"),
            Timeout::Infinite => f.write_str("infinite"),
        }
    }
}
