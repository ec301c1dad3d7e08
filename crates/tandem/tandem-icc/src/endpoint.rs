//! The two sides of a bidirectional conversation.
//!
//! An endpoint owns two channels with swapped roles. Both sides name them by
//! the same pair of ids:
//!
//! ```text
//!             channel `client_id`  (server -> client)
//!   Server  ───────────────────────────────────────▶  Client
//!   (init)  ◀───────────────────────────────────────  (connect)
//!             channel `server_id`  (client -> server)
//! ```
//!
//! The server creates all kernel objects; the client attaches to them.

use std::fmt;
use std::time::Duration;

use tandem_core::{AccessDescriptor, Result, Role, Timeout};
use tracing::info;

use crate::channel::{Channel, ChannelOptions};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointKind {
    Server,
    Client,
}

impl EndpointKind {
    #[inline]
    pub fn role(self) -> Role {
        match self {
            EndpointKind::Server => Role::Creator,
            EndpointKind::Client => Role::Attacher,
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointKind::Server => f.write_str("server"),
            EndpointKind::Client => f.write_str("client"),
        }
    }
}

/// Configures how endpoints are built.
///
/// The access descriptor is borrowed so a single value can be shared by
/// every endpoint (and every primitive inside it) in the process.
#[derive(Clone, Copy, Debug)]
pub struct EndpointBuilder<'a> {
    options: ChannelOptions,
    access: &'a AccessDescriptor,
}

impl Default for EndpointBuilder<'static> {
    fn default() -> Self {
        Self {
            options: ChannelOptions::default(),
            access: AccessDescriptor::process_default(),
        }
    }
}

impl EndpointBuilder<'static> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'a> EndpointBuilder<'a> {
    /// Payload capacity of both channels. Only matters for the server.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.options.capacity = capacity;
        self
    }

    /// How often blocked calls check that the peer process still exists.
    pub fn liveness_interval(mut self, interval: Duration) -> Self {
        self.options.liveness_interval = interval;
        self
    }

    pub fn access<'b>(self, access: &'b AccessDescriptor) -> EndpointBuilder<'b> {
        EndpointBuilder {
            options: self.options,
            access,
        }
    }

    /// Server side: creates both channels.
    ///
    /// # Errors
    /// `NameCollision` if either channel was already initialized.
    pub fn init(&self, client_id: &str, server_id: &str) -> Result<Endpoint> {
        let outbound = Channel::create(client_id, self.options, self.access)?;
        let inbound = Channel::create(server_id, self.options, self.access)?;
        info!(client_id, server_id, capacity = self.options.capacity, "server endpoint ready");
        Ok(Endpoint {
            kind: EndpointKind::Server,
            inbound,
            outbound,
        })
    }

    /// Client side: attaches to both channels.
    ///
    /// # Errors
    /// `NotFound` if the server has not initialized them yet.
    pub fn connect(&self, client_id: &str, server_id: &str) -> Result<Endpoint> {
        let inbound = Channel::attach(client_id, self.options, self.access)?;
        let outbound = Channel::attach(server_id, self.options, self.access)?;
        info!(client_id, server_id, capacity = outbound.capacity(), "client endpoint connected");
        Ok(Endpoint {
            kind: EndpointKind::Client,
            inbound,
            outbound,
        })
    }
}

pub struct Endpoint {
    kind: EndpointKind,
    inbound: Channel,
    outbound: Channel,
}

impl Endpoint {
    /// Server with default options. See [`EndpointBuilder::init`].
    pub fn init(client_id: &str, server_id: &str) -> Result<Self> {
        EndpointBuilder::new().init(client_id, server_id)
    }

    /// Client with default options. See [`EndpointBuilder::connect`].
    pub fn connect(client_id: &str, server_id: &str) -> Result<Self> {
        EndpointBuilder::new().connect(client_id, server_id)
    }

    pub fn builder() -> EndpointBuilder<'static> {
        EndpointBuilder::new()
    }

    /// Removes names left behind by a server that did not shut down.
    /// Returns how many objects were removed.
    pub fn purge(client_id: &str, server_id: &str) -> Result<usize> {
        Ok(Channel::purge(client_id)? + Channel::purge(server_id)?)
    }

    #[inline]
    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.kind.role()
    }

    /// Largest message `send` accepts.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.outbound.capacity()
    }

    /// Largest message the peer can send.
    #[inline]
    pub fn inbound_capacity(&self) -> usize {
        self.inbound.capacity()
    }

    /// Sends one message to the peer; see [`Channel::send`].
    pub fn send(&mut self, payload: &[u8], timeout: impl Into<Timeout>) -> Result<()> {
        self.outbound.send(payload, timeout.into())
    }

    /// Receives one message from the peer; see [`Channel::receive`].
    pub fn receive(&mut self, buf: &mut [u8], timeout: impl Into<Timeout>) -> Result<usize> {
        self.inbound.receive(buf, timeout.into())
    }

    /// Resets both channels after the peer was reported `Abandoned`.
    pub fn reset(&mut self) -> Result<()> {
        self.inbound.reset()?;
        self.outbound.reset()
    }

    pub fn inbound(&self) -> &Channel {
        &self.inbound
    }

    pub fn outbound(&self) -> &Channel {
        &self.outbound
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("kind", &self.kind)
            .field("inbound", &self.inbound.id())
            .field("outbound", &self.outbound.id())
            .field("capacity", &self.capacity())
            .finish()
    }
}
