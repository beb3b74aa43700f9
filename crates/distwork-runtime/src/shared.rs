//! Shared Network State
//!
//! The only state touched directly by both threads of a worker. The
//! interrupt flag and the pending-delivery queue sit behind one mutex so the
//! queue is drained and cleared atomically with respect to producers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use distwork_core::{Message, NetworkStats, PeerRole, WorkerConfig};

/// Frame bytes shown per frame in verbose message traces
const TRACE_BYTES: usize = 16;

#[derive(Debug, Default)]
struct NetworkState {
    interrupted: bool,
    pending: VecDeque<Message>,
    failure: Option<String>,
}

/// State shared between the worker facade and its network thread
#[derive(Debug)]
pub struct SharedState {
    identity: String,
    verbose: bool,
    state: Mutex<NetworkState>,
    stats: NetworkStats,
}

impl SharedState {
    pub fn new(config: &WorkerConfig) -> Arc<Self> {
        Arc::new(Self {
            identity: config.identity.clone(),
            verbose: config.verbose,
            state: Mutex::new(NetworkState::default()),
            stats: NetworkStats::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        // Every critical section leaves the state structurally valid
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    /// Ask the network loop to exit at its next condition check
    pub fn interrupt(&self) {
        self.lock().interrupted = true;
    }

    pub fn is_interrupted(&self) -> bool {
        self.lock().interrupted
    }

    /// Append an already-tagged message to the pending-delivery queue
    pub(crate) fn push_pending(&self, message: Message) {
        self.lock().pending.push_back(message);
    }

    /// Move every pending message out, leaving the queue empty
    pub(crate) fn take_pending(&self) -> VecDeque<Message> {
        std::mem::take(&mut self.lock().pending)
    }

    /// Remember why the network thread gave up, for the facade to report
    pub(crate) fn record_failure<T: Into<String>>(&self, reason: T) {
        self.lock().failure = Some(reason.into());
    }

    pub(crate) fn take_failure(&self) -> Option<String> {
        self.lock().failure.take()
    }

    /// Clear the flags of a previous session before a new start
    pub(crate) fn reset(&self) {
        let mut state = self.lock();
        state.interrupted = false;
        state.pending.clear();
        state.failure = None;
    }
}

// ----------------------------------------------------------------------------
// Delivery Sink
// ----------------------------------------------------------------------------

/// Write-only path from a communicator into the pending-delivery queue
///
/// A sink is bound to the role of the communicator it was handed to, so every
/// message it delivers carries that role's tag.
#[derive(Debug, Clone)]
pub struct DeliverySink {
    role: PeerRole,
    shared: Arc<SharedState>,
}

impl DeliverySink {
    pub(crate) fn new(role: PeerRole, shared: Arc<SharedState>) -> Self {
        Self { role, shared }
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Identity of the worker owning this sink
    pub fn identity(&self) -> &str {
        self.shared.identity()
    }

    /// Queue a peer message for the application
    pub fn deliver(&self, message: Message) {
        if self.shared.verbose() {
            tracing::debug!(role = %self.role, frames = %describe(&message), "Peer message queued");
        }
        self.shared.push_pending(message.tagged(self.role));
    }
}

/// Compact hex rendering of a message for verbose traces
pub(crate) fn describe(message: &Message) -> String {
    message
        .frames()
        .iter()
        .map(|frame| {
            let shown = &frame[..frame.len().min(TRACE_BYTES)];
            if frame.len() > TRACE_BYTES {
                format!("{}..({}B)", hex::encode(shown), frame.len())
            } else {
                hex::encode(shown)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_tags_messages() {
        let shared = SharedState::new(&WorkerConfig::testing("w1"));
        let sink = DeliverySink::new(PeerRole::RightNeighbour, Arc::clone(&shared));

        sink.deliver(Message::from_frames(vec![b"hello".to_vec()]));

        let mut pending = shared.take_pending();
        assert_eq!(pending.len(), 1);
        let mut msg = pending.pop_front().unwrap();
        assert_eq!(msg.take_tag().unwrap(), PeerRole::RightNeighbour);
        assert_eq!(msg.frames(), &[b"hello".to_vec()]);
        assert!(shared.take_pending().is_empty());
    }

    #[test]
    fn test_reset_clears_session_state() {
        let shared = SharedState::new(&WorkerConfig::testing("w1"));
        shared.interrupt();
        shared.record_failure("boom");
        shared.push_pending(Message::new().tagged(PeerRole::Broker));

        shared.reset();
        assert!(!shared.is_interrupted());
        assert!(shared.take_pending().is_empty());
        assert_eq!(shared.take_failure(), None);
    }

    #[test]
    fn test_describe_truncates_long_frames() {
        let msg = Message::from_frames(vec![vec![0xab; 2], vec![0x01; 40]]);
        let text = describe(&msg);
        assert!(text.starts_with("abab "));
        assert!(text.ends_with("..(40B)"));
    }
}
