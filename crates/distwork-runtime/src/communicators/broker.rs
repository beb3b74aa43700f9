//! Broker communicator
//!
//! Speaks a Majordomo-style worker protocol with a central broker. Every
//! frame list starts with the protocol header and a one-byte command:
//!
//! | command      | byte | body            |
//! |--------------|------|-----------------|
//! | `READY`      | 0x01 | worker identity |
//! | `REQUEST`    | 0x02 | payload frames  |
//! | `REPLY`      | 0x03 | payload frames  |
//! | `HEARTBEAT`  | 0x04 |                 |
//! | `DISCONNECT` | 0x05 |                 |

use distwork_core::{Endpoint, Message, TransportError, TransportResult, WorkerConfig};
use tracing::{debug, info, warn};

use super::link::{Link, LinkMode};
use crate::communicator::{Communicator, PeerInput, PeerSource};
use crate::shared::DeliverySink;

/// Protocol header leading every broker frame list
pub const MDP_WORKER: &[u8] = b"MDPW01";

pub const READY: u8 = 0x01;
pub const REQUEST: u8 = 0x02;
pub const REPLY: u8 = 0x03;
pub const HEARTBEAT: u8 = 0x04;
pub const DISCONNECT: u8 = 0x05;

/// Build a broker command message with the given body frames
pub fn command(command: u8, body: Vec<Vec<u8>>) -> Message {
    let mut message = Message::from_frames(body);
    message.push_front(vec![command]);
    message.push_front(MDP_WORKER.to_vec());
    message
}

/// Split a broker message into its command and body
pub fn parse(mut message: Message) -> TransportResult<(u8, Message)> {
    match message.pop_front() {
        Some(header) if header == MDP_WORKER => {}
        Some(header) => {
            return Err(TransportError::protocol_mismatch(
                String::from_utf8_lossy(MDP_WORKER),
                String::from_utf8_lossy(&header),
            ))
        }
        None => return Err(TransportError::protocol_mismatch("MDPW01 header", "empty message")),
    }
    match message.pop_front().as_deref() {
        Some([command]) => Ok((*command, message)),
        Some(other) => Err(TransportError::protocol_mismatch(
            "one-byte command",
            format!("{} bytes", other.len()),
        )),
        None => Err(TransportError::protocol_mismatch("command frame", "none")),
    }
}

// ----------------------------------------------------------------------------
// Broker Communicator
// ----------------------------------------------------------------------------

/// Communicator for the `Broker` role; dials the broker endpoint
pub struct BrokerCommunicator {
    identity: String,
    link: Link,
    sink: Option<DeliverySink>,
}

impl BrokerCommunicator {
    pub fn new(endpoint: Endpoint, config: &WorkerConfig) -> Self {
        Self {
            identity: config.identity.clone(),
            link: Link::new(endpoint, LinkMode::Dial, config),
            sink: None,
        }
    }

    fn ready(&self) -> Message {
        command(READY, vec![self.identity.as_bytes().to_vec()])
    }

    fn deliver(&self, payload: Message) -> TransportResult<()> {
        let sink = self
            .sink
            .as_ref()
            .ok_or_else(|| TransportError::shutdown("broker communicator is not attached"))?;
        sink.deliver(payload);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Communicator for BrokerCommunicator {
    fn attach(&mut self, sink: DeliverySink) {
        self.sink = Some(sink);
    }

    async fn connect(&mut self) -> TransportResult<()> {
        self.link.open().await?;
        let ready = self.ready();
        self.link.send_now(&ready).await?;
        info!(endpoint = %self.link.endpoint(), identity = %self.identity, "Registered with broker");
        Ok(())
    }

    fn take_source(&mut self) -> Option<PeerSource> {
        self.link.take_source()
    }

    async fn handle_input(&mut self, input: PeerInput) -> TransportResult<()> {
        match input {
            PeerInput::Message(message) => {
                self.link.refresh();
                let (cmd, body) = parse(message)?;
                match cmd {
                    REQUEST => self.deliver(body),
                    HEARTBEAT => Ok(()),
                    DISCONNECT => {
                        info!(endpoint = %self.link.endpoint(), "Broker requested disconnect");
                        self.link.drop_link("broker disconnect");
                        Ok(())
                    }
                    other => Err(TransportError::protocol_mismatch(
                        "REQUEST, HEARTBEAT or DISCONNECT",
                        format!("command {other:#04x}"),
                    )),
                }
            }
            PeerInput::Attached { peer, .. } => {
                warn!(%peer, "Unexpected inbound peer on a dialing broker link");
                Ok(())
            }
            PeerInput::Detached { reason } => {
                warn!(endpoint = %self.link.endpoint(), reason = %reason, "Broker link lost");
                self.link.detach();
                Ok(())
            }
        }
    }

    async fn reactor_timed_out(&mut self) -> TransportResult<()> {
        if self.link.expire() {
            warn!(endpoint = %self.link.endpoint(), "Broker heartbeat expired");
            self.link.drop_link("heartbeat expired");
        }
        Ok(())
    }

    async fn reactor_served_requests(&mut self) -> TransportResult<()> {
        if self.link.reconnect_if_due().await {
            let ready = self.ready();
            self.link.send_now(&ready).await?;
        }
        if self.link.heartbeat_due() {
            self.link.mark_heartbeat();
            self.link.send_now(&command(HEARTBEAT, Vec::new())).await?;
        }
        self.link.flush().await
    }

    async fn handle_outgoing_message(&mut self, message: Message) -> TransportResult<()> {
        self.link.queue(command(REPLY, message.into_frames()))
    }

    async fn disconnect(&mut self) -> TransportResult<()> {
        if self.link.is_attached() {
            if let Err(e) = self.link.flush().await {
                debug!(error = %e, "Outbound flush failed during disconnect");
            }
            if let Err(e) = self.link.send_now(&command(DISCONNECT, Vec::new())).await {
                debug!(error = %e, "Could not notify broker of disconnect");
            }
        }
        debug!(unsent = self.link.queued(), "Closing broker link");
        self.link.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_layout() {
        let msg = command(REPLY, vec![b"client".to_vec(), b"body".to_vec()]);
        assert_eq!(
            msg.frames(),
            &[
                MDP_WORKER.to_vec(),
                vec![REPLY],
                b"client".to_vec(),
                b"body".to_vec()
            ]
        );

        let (cmd, body) = parse(msg).unwrap();
        assert_eq!(cmd, REPLY);
        assert_eq!(body.len(), 2);
    }

    #[test]
    fn test_parse_rejects_foreign_frames() {
        let foreign = Message::from_frames(vec![b"HTTP/1.1".to_vec(), vec![REQUEST]]);
        assert!(matches!(
            parse(foreign),
            Err(TransportError::ProtocolMismatch { .. })
        ));

        let wide_command = Message::from_frames(vec![MDP_WORKER.to_vec(), vec![1, 2]]);
        assert!(parse(wide_command).is_err());
        assert!(parse(Message::new()).is_err());
    }

    #[tokio::test]
    async fn test_disconnect_without_connect() {
        let endpoint = Endpoint::new("127.0.0.1", 1);
        let mut broker = BrokerCommunicator::new(endpoint, &WorkerConfig::testing("w1"));
        assert!(broker.disconnect().await.is_ok());
        assert!(broker.reactor_timed_out().await.is_ok());
    }
}
