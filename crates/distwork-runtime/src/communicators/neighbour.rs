//! Neighbour communicator
//!
//! Links two workers of a pipeline. The left side listens for its upstream
//! neighbour and the right side dials its downstream one, so a pipeline is
//! started from its rightmost worker. Frames start with the protocol header
//! and a one-byte command: `HELLO` (identity), `DATA` (payload),
//! `HEARTBEAT` and `BYE`.

use distwork_core::{Endpoint, Message, PeerRole, TransportError, TransportResult, WorkerConfig};
use tracing::{debug, info, warn};

use super::link::{Link, LinkMode};
use crate::communicator::{Communicator, PeerInput, PeerSource};
use crate::shared::DeliverySink;

/// Protocol header leading every neighbour frame list
pub const NEIGHBOUR_PROTOCOL: &[u8] = b"DWNB01";

pub const HELLO: u8 = 0x01;
pub const DATA: u8 = 0x02;
pub const HEARTBEAT: u8 = 0x03;
pub const BYE: u8 = 0x04;

pub fn command(command: u8, body: Vec<Vec<u8>>) -> Message {
    let mut message = Message::from_frames(body);
    message.push_front(vec![command]);
    message.push_front(NEIGHBOUR_PROTOCOL.to_vec());
    message
}

pub fn parse(mut message: Message) -> TransportResult<(u8, Message)> {
    match message.pop_front() {
        Some(header) if header == NEIGHBOUR_PROTOCOL => {}
        Some(header) => {
            return Err(TransportError::protocol_mismatch(
                String::from_utf8_lossy(NEIGHBOUR_PROTOCOL),
                String::from_utf8_lossy(&header),
            ))
        }
        None => return Err(TransportError::protocol_mismatch("DWNB01 header", "empty message")),
    }
    match message.pop_front().as_deref() {
        Some([command]) => Ok((*command, message)),
        _ => Err(TransportError::protocol_mismatch("one-byte command", "malformed frame")),
    }
}

// ----------------------------------------------------------------------------
// Neighbour Communicator
// ----------------------------------------------------------------------------

/// Communicator for the `LeftNeighbour` or `RightNeighbour` role
pub struct NeighbourCommunicator {
    role: PeerRole,
    identity: String,
    link: Link,
    sink: Option<DeliverySink>,
    neighbour: Option<String>,
}

impl NeighbourCommunicator {
    /// Upstream side; listens on `endpoint`
    pub fn left(endpoint: Endpoint, config: &WorkerConfig) -> Self {
        Self::new(PeerRole::LeftNeighbour, endpoint, LinkMode::Listen, config)
    }

    /// Downstream side; dials `endpoint`
    pub fn right(endpoint: Endpoint, config: &WorkerConfig) -> Self {
        Self::new(PeerRole::RightNeighbour, endpoint, LinkMode::Dial, config)
    }

    fn new(role: PeerRole, endpoint: Endpoint, mode: LinkMode, config: &WorkerConfig) -> Self {
        Self {
            role,
            identity: config.identity.clone(),
            link: Link::new(endpoint, mode, config),
            sink: None,
            neighbour: None,
        }
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Identity announced by the attached neighbour
    pub fn neighbour(&self) -> Option<&str> {
        self.neighbour.as_deref()
    }

    fn hello(&self) -> Message {
        command(HELLO, vec![self.identity.as_bytes().to_vec()])
    }

    fn forget_neighbour(&mut self) {
        self.neighbour = None;
    }
}

#[async_trait::async_trait]
impl Communicator for NeighbourCommunicator {
    fn attach(&mut self, sink: DeliverySink) {
        self.sink = Some(sink);
    }

    async fn connect(&mut self) -> TransportResult<()> {
        self.link.open().await?;
        if self.link.mode() == LinkMode::Dial {
            let hello = self.hello();
            self.link.send_now(&hello).await?;
        }
        info!(role = %self.role, endpoint = %self.link.endpoint(), "Neighbour link open");
        Ok(())
    }

    fn take_source(&mut self) -> Option<PeerSource> {
        self.link.take_source()
    }

    async fn handle_input(&mut self, input: PeerInput) -> TransportResult<()> {
        match input {
            PeerInput::Attached { writer, peer } => {
                info!(role = %self.role, %peer, "Neighbour attached");
                self.link.attach(writer, peer);
                let hello = self.hello();
                self.link.send_now(&hello).await
            }
            PeerInput::Detached { reason } => {
                if self.link.is_attached() {
                    warn!(role = %self.role, reason = %reason, "Neighbour link lost");
                }
                self.link.detach();
                self.forget_neighbour();
                Ok(())
            }
            PeerInput::Message(message) => {
                self.link.refresh();
                let (cmd, body) = parse(message)?;
                match cmd {
                    DATA => {
                        let sink = self.sink.as_ref().ok_or_else(|| {
                            TransportError::shutdown("neighbour communicator is not attached")
                        })?;
                        sink.deliver(body);
                        Ok(())
                    }
                    HELLO => {
                        let name = body
                            .front()
                            .map(|frame| String::from_utf8_lossy(frame).into_owned())
                            .unwrap_or_default();
                        debug!(role = %self.role, neighbour = %name, "Neighbour identified");
                        self.neighbour = Some(name);
                        Ok(())
                    }
                    HEARTBEAT => Ok(()),
                    BYE => {
                        info!(role = %self.role, "Neighbour said goodbye");
                        self.link.drop_link("neighbour left");
                        self.forget_neighbour();
                        Ok(())
                    }
                    other => Err(TransportError::protocol_mismatch(
                        "HELLO, DATA, HEARTBEAT or BYE",
                        format!("command {other:#04x}"),
                    )),
                }
            }
        }
    }

    async fn reactor_timed_out(&mut self) -> TransportResult<()> {
        if self.link.expire() {
            warn!(role = %self.role, "Neighbour heartbeat expired");
            self.link.drop_link("heartbeat expired");
            self.forget_neighbour();
        }
        Ok(())
    }

    async fn reactor_served_requests(&mut self) -> TransportResult<()> {
        if self.link.reconnect_if_due().await {
            let hello = self.hello();
            self.link.send_now(&hello).await?;
        }
        if self.link.heartbeat_due() {
            self.link.mark_heartbeat();
            self.link.send_now(&command(HEARTBEAT, Vec::new())).await?;
        }
        self.link.flush().await
    }

    async fn handle_outgoing_message(&mut self, message: Message) -> TransportResult<()> {
        self.link.queue(command(DATA, message.into_frames()))
    }

    async fn disconnect(&mut self) -> TransportResult<()> {
        if self.link.is_attached() {
            // Deliver what is still queued before saying goodbye
            if let Err(e) = self.link.flush().await {
                debug!(role = %self.role, error = %e, "Outbound flush failed during disconnect");
            }
            if let Err(e) = self.link.send_now(&command(BYE, Vec::new())).await {
                debug!(role = %self.role, error = %e, "Could not notify neighbour of disconnect");
            }
        }
        debug!(role = %self.role, unsent = self.link.queued(), "Closing neighbour link");
        self.link.close().await;
        Ok(())
    }
}
