//! TCP link shared by the broker and neighbour communicators
//!
//! A link either dials its endpoint or listens on it and serves one peer at
//! a time. It owns the write half, the outbound queue and the liveness
//! bookkeeping; the read half lives in the reactor source it hands out.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use distwork_core::{Endpoint, LinkConfig, Message, TransportError, TransportResult, WorkerConfig};
use futures::stream::{self, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::codec;
use crate::communicator::{PeerInput, PeerSource};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkMode {
    Dial,
    Listen,
}

pub(crate) struct Link {
    endpoint: Endpoint,
    mode: LinkMode,
    config: LinkConfig,
    heartbeat_interval: Duration,
    liveness_limit: u32,
    listener: Option<Arc<TcpListener>>,
    writer: Option<OwnedWriteHalf>,
    peer: Option<SocketAddr>,
    source: Option<PeerSource>,
    outbound: VecDeque<Message>,
    liveness: u32,
    heartbeat_at: Instant,
    reconnect_at: Option<Instant>,
    reconnect_failures: u32,
}

impl Link {
    pub fn new(endpoint: Endpoint, mode: LinkMode, config: &WorkerConfig) -> Self {
        Self {
            endpoint,
            mode,
            config: config.link.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            liveness_limit: config.heartbeat.liveness,
            listener: None,
            writer: None,
            peer: None,
            source: None,
            outbound: VecDeque::new(),
            liveness: config.heartbeat.liveness,
            heartbeat_at: Instant::now(),
            reconnect_at: None,
            reconnect_failures: 0,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn mode(&self) -> LinkMode {
        self.mode
    }

    pub fn is_attached(&self) -> bool {
        self.writer.is_some()
    }

    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    pub fn take_source(&mut self) -> Option<PeerSource> {
        self.source.take()
    }

    // ------------------------------------------------------------------------
    // Connection Management
    // ------------------------------------------------------------------------

    /// Dial the peer, or bind the listening socket
    pub async fn open(&mut self) -> TransportResult<()> {
        match self.mode {
            LinkMode::Dial => self.dial().await,
            LinkMode::Listen => self.bind().await,
        }
    }

    async fn dial(&mut self) -> TransportResult<()> {
        let address = self.endpoint.socket_address();
        let stream = tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(address.as_str()))
            .await
            .map_err(|_| TransportError::Timeout {
                duration_ms: self.config.connect_timeout_ms,
            })?
            .map_err(|e| TransportError::ConnectionFailed {
                endpoint: self.endpoint.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;

        let (reader, writer) = stream.into_split();
        self.source = Some(read_stream(reader, self.config.max_frame_size));
        self.attach(writer, peer);
        self.reconnect_at = None;
        self.reconnect_failures = 0;
        debug!(endpoint = %self.endpoint, %peer, "Link dialed");
        Ok(())
    }

    async fn bind(&mut self) -> TransportResult<()> {
        let listener = TcpListener::bind(self.endpoint.socket_address())
            .await
            .map_err(|e| TransportError::ConnectionFailed {
                endpoint: self.endpoint.to_string(),
                reason: e.to_string(),
            })?;
        let listener = Arc::new(listener);
        self.source = Some(accept_stream(Arc::clone(&listener), self.config.max_frame_size));
        self.listener = Some(listener);
        debug!(endpoint = %self.endpoint, "Link listening");
        Ok(())
    }

    /// Re-dial a dropped link once its reconnect delay has passed
    ///
    /// Returns whether a fresh connection was established.
    pub async fn reconnect_if_due(&mut self) -> bool {
        let due = self.mode == LinkMode::Dial
            && !self.is_attached()
            && self.reconnect_at.is_some_and(|at| Instant::now() >= at);
        if !due {
            return false;
        }

        match self.dial().await {
            Ok(()) => {
                info!(endpoint = %self.endpoint, "Link re-established");
                true
            }
            Err(e) => {
                self.reconnect_failures = self.reconnect_failures.saturating_add(1);
                let retry_in = self.config.reconnect_delay(self.reconnect_failures);
                warn!(
                    endpoint = %self.endpoint,
                    error = %e,
                    failures = self.reconnect_failures,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "Reconnect attempt failed"
                );
                self.schedule_reconnect();
                false
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.mode == LinkMode::Dial {
            let delay = self.config.reconnect_delay(self.reconnect_failures);
            self.reconnect_at = Some(Instant::now() + delay);
        }
    }

    /// Install the write half of a newly connected peer
    pub fn attach(&mut self, writer: OwnedWriteHalf, peer: SocketAddr) {
        self.writer = Some(writer);
        self.peer = Some(peer);
        self.liveness = self.liveness_limit;
        self.heartbeat_at = Instant::now() + self.heartbeat_interval;
    }

    /// Forget the peer after its reader reported the end of the link
    pub fn detach(&mut self) {
        self.writer = None;
        self.peer = None;
        self.schedule_reconnect();
    }

    /// Tear the link down while its reader may still be live
    ///
    /// The reader is replaced too: a listening link goes back to accepting,
    /// a dialing link waits for its reconnect.
    pub fn drop_link(&mut self, reason: &str) {
        debug!(endpoint = %self.endpoint, peer = ?self.peer, reason, "Dropping link");
        self.detach();
        self.source = match (&self.listener, self.mode) {
            (Some(listener), LinkMode::Listen) => Some(accept_stream(
                Arc::clone(listener),
                self.config.max_frame_size,
            )),
            _ => Some(stream::empty().boxed()),
        };
    }

    /// Close everything; safe on a link that never opened
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        self.peer = None;
        self.listener = None;
        self.source = None;
        self.reconnect_at = None;
    }

    // ------------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------------

    /// Any traffic from the peer proves it alive
    pub fn refresh(&mut self) {
        self.liveness = self.liveness_limit;
    }

    /// Count one silent heartbeat interval; true once liveness ran out
    pub fn expire(&mut self) -> bool {
        if !self.is_attached() {
            return false;
        }
        self.liveness = self.liveness.saturating_sub(1);
        self.liveness == 0
    }

    pub fn heartbeat_due(&self) -> bool {
        self.is_attached() && Instant::now() >= self.heartbeat_at
    }

    pub fn mark_heartbeat(&mut self) {
        self.heartbeat_at = Instant::now() + self.heartbeat_interval;
    }

    // ------------------------------------------------------------------------
    // Outbound Traffic
    // ------------------------------------------------------------------------

    /// Queue a message until the next flush
    pub fn queue(&mut self, message: Message) -> TransportResult<()> {
        if self.outbound.len() >= self.config.outbound_queue_limit {
            return Err(TransportError::SendBufferFull {
                capacity: self.config.outbound_queue_limit,
            });
        }
        self.outbound.push_back(message);
        Ok(())
    }

    /// Write a message immediately, bypassing the queue
    pub async fn send_now(&mut self, message: &Message) -> TransportResult<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(TransportError::shutdown("link is not attached"));
        };
        if let Err(e) = write_bounded(writer, message, &self.config).await {
            self.drop_link(write_failure(&e));
            return Err(e);
        }
        Ok(())
    }

    /// Write queued messages while the peer is attached
    pub async fn flush(&mut self) -> TransportResult<()> {
        while let Some(writer) = self.writer.as_mut() {
            let Some(message) = self.outbound.pop_front() else {
                break;
            };
            match write_bounded(writer, &message, &self.config).await {
                Ok(()) => {}
                Err(TransportError::FrameTooLarge { size, max_size }) => {
                    // Oversized messages are discarded
                    return Err(TransportError::FrameTooLarge { size, max_size });
                }
                Err(e) => {
                    // Resent whole on the next connection
                    self.outbound.push_front(message);
                    self.drop_link(write_failure(&e));
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

/// Write one message, giving up once the peer stops draining the socket
async fn write_bounded(
    writer: &mut OwnedWriteHalf,
    message: &Message,
    config: &LinkConfig,
) -> TransportResult<()> {
    tokio::time::timeout(
        config.write_timeout(),
        codec::write_message(writer, message, config.max_frame_size),
    )
    .await
    .map_err(|_| TransportError::Timeout {
        duration_ms: config.write_timeout_ms,
    })?
}

fn write_failure(error: &TransportError) -> &'static str {
    match error {
        TransportError::Timeout { .. } => "write stalled",
        _ => "write failed",
    }
}

// ----------------------------------------------------------------------------
// Reactor Sources
// ----------------------------------------------------------------------------

fn read_stream(reader: OwnedReadHalf, max_size: usize) -> PeerSource {
    stream::unfold(Some(reader), move |state| async move {
        let mut reader = state?;
        match codec::read_message(&mut reader, max_size).await {
            Ok(Some(message)) => Some((PeerInput::Message(message), Some(reader))),
            Ok(None) => Some((
                PeerInput::Detached {
                    reason: "peer closed the connection".into(),
                },
                None,
            )),
            Err(e) => Some((PeerInput::Detached { reason: e.to_string() }, None)),
        }
    })
    .boxed()
}

enum AcceptState {
    Accepting,
    Reading(OwnedReadHalf),
}

/// Accept one peer, read it until it leaves, then accept the next
fn accept_stream(listener: Arc<TcpListener>, max_size: usize) -> PeerSource {
    stream::unfold(
        (listener, AcceptState::Accepting),
        move |(listener, state)| async move {
            match state {
                AcceptState::Accepting => match listener.accept().await {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let (reader, writer) = stream.into_split();
                        Some((
                            PeerInput::Attached { writer, peer },
                            (listener, AcceptState::Reading(reader)),
                        ))
                    }
                    Err(e) => {
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        Some((
                            PeerInput::Detached {
                                reason: format!("accept failed: {e}"),
                            },
                            (listener, AcceptState::Accepting),
                        ))
                    }
                },
                AcceptState::Reading(mut reader) => {
                    match codec::read_message(&mut reader, max_size).await {
                        Ok(Some(message)) => Some((
                            PeerInput::Message(message),
                            (listener, AcceptState::Reading(reader)),
                        )),
                        Ok(None) => Some((
                            PeerInput::Detached {
                                reason: "peer closed the connection".into(),
                            },
                            (listener, AcceptState::Accepting),
                        )),
                        Err(e) => Some((
                            PeerInput::Detached { reason: e.to_string() },
                            (listener, AcceptState::Accepting),
                        )),
                    }
                }
            }
        },
    )
    .boxed()
}
