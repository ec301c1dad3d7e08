mod channel;
mod endpoint;
mod peer;
mod slot_layout;

pub use channel::{Channel, ChannelOptions};
pub use endpoint::{Endpoint, EndpointBuilder, EndpointKind};
pub use slot_layout::{DEFAULT_CAPACITY, SLOT_MAGIC, SLOT_VERSION, bytes_for_slot};
pub use tandem_core::{AccessDescriptor, IpcError, Result, Role, Timeout};
