//! Building blocks shared by every tandem crate: kernel object naming, the
//! access descriptor applied at creation time, startup roles, wait timeouts
//! and the error taxonomy.

mod access;
mod error;
mod name;
mod role;

pub use access::AccessDescriptor;
pub use error::{IpcError, Result};
pub use name::{NAME_CAPACITY, ObjectName};
pub use role::{Role, Timeout};
