//! Communicator Capability
//!
//! A communicator owns one peer's network connection and wire protocol. The
//! network thread drives it through the hooks below and never lets it touch
//! the pipe directly: application-bound data goes through the
//! [`DeliverySink`] handed over in `attach`.

use std::net::SocketAddr;

use distwork_core::{Message, PeerRole, TransportResult, WorkerError, WorkerResult};
use futures::stream::BoxStream;
use tokio::net::tcp::OwnedWriteHalf;

use crate::shared::DeliverySink;

// ----------------------------------------------------------------------------
// Peer Input
// ----------------------------------------------------------------------------

/// Readiness reported by a communicator's reactor source
#[derive(Debug)]
pub enum PeerInput {
    /// A message read from the peer link
    Message(Message),
    /// A listening link accepted a peer
    Attached {
        writer: OwnedWriteHalf,
        peer: SocketAddr,
    },
    /// The peer link ended
    Detached { reason: String },
}

/// Readable source a communicator registers with the reactor
pub type PeerSource = BoxStream<'static, PeerInput>;

// ----------------------------------------------------------------------------
// Communicator Trait
// ----------------------------------------------------------------------------

/// Capability interface polymorphic over peer role
///
/// Every hook runs on the network thread. Hooks are isolated from each
/// other: an `Err` is logged and counted, a panic quarantines only the
/// communicator that raised it.
#[async_trait::async_trait]
pub trait Communicator: Send {
    /// Receive the write-only path to the application; called before `connect`
    fn attach(&mut self, sink: DeliverySink);

    /// Establish the network-facing connection; a failure aborts startup
    async fn connect(&mut self) -> TransportResult<()>;

    /// Hand over a new reactor source, replacing the previous one
    ///
    /// Polled after `connect` and at the end of every loop iteration.
    fn take_source(&mut self) -> Option<PeerSource> {
        None
    }

    /// React to an item from this communicator's reactor source
    async fn handle_input(&mut self, _input: PeerInput) -> TransportResult<()> {
        Ok(())
    }

    /// Once per heartbeat interval with no readiness on any source
    async fn reactor_timed_out(&mut self) -> TransportResult<()>;

    /// Once per loop iteration, unconditionally
    async fn reactor_served_requests(&mut self) -> TransportResult<()>;

    /// Encode and transmit application frames (tag already stripped)
    async fn handle_outgoing_message(&mut self, message: Message) -> TransportResult<()>;

    /// Release the connection; must tolerate never having connected
    async fn disconnect(&mut self) -> TransportResult<()>;
}

// ----------------------------------------------------------------------------
// Communicator Registry
// ----------------------------------------------------------------------------

/// At most one communicator per addressable role
#[derive(Default)]
pub struct CommunicatorRegistry {
    slots: [Option<Box<dyn Communicator>>; PeerRole::COUNT],
    order: Vec<PeerRole>,
}

impl CommunicatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, role: PeerRole, communicator: Box<dyn Communicator>) -> WorkerResult<()> {
        let slot = role
            .slot()
            .ok_or(WorkerError::InvalidRole { tag: role.tag() })?;
        if self.slots[slot].is_some() {
            return Err(WorkerError::AlreadyRegistered { role });
        }
        self.slots[slot] = Some(communicator);
        self.order.push(role);
        Ok(())
    }

    pub fn contains(&self, role: PeerRole) -> bool {
        role.slot().is_some_and(|slot| self.slots[slot].is_some())
    }

    pub fn get_mut(&mut self, role: PeerRole) -> Option<&mut Box<dyn Communicator>> {
        self.slots[role.slot()?].as_mut()
    }

    pub fn remove(&mut self, role: PeerRole) -> Option<Box<dyn Communicator>> {
        let communicator = self.slots[role.slot()?].take()?;
        self.order.retain(|r| *r != role);
        Some(communicator)
    }

    /// Registered roles in registration order
    pub fn roles(&self) -> &[PeerRole] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl core::fmt::Debug for CommunicatorRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommunicatorRegistry")
            .field("roles", &self.order)
            .finish()
    }
}
