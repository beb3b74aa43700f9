//! Core types for the distwork agent
//!
//! This module defines the peer roles a worker can address, the multi-frame
//! message that crosses the inter-thread pipe, and the out-of-band signals
//! used for the startup and shutdown handshakes.

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::errors::{WorkerError, WorkerResult};

// ----------------------------------------------------------------------------
// Peer Role
// ----------------------------------------------------------------------------

/// Addressable communication endpoint of a worker
///
/// The discriminant is the single-byte tag that leads every message on the
/// pipe. `Undefined` is never a valid addressing target.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PeerRole {
    Undefined = 0,
    Broker = 1,
    LeftNeighbour = 2,
    RightNeighbour = 3,
}

impl PeerRole {
    /// Addressable roles in the fixed scan order used by role-agnostic receives
    pub const ADDRESSABLE: [PeerRole; 3] = [
        PeerRole::Broker,
        PeerRole::LeftNeighbour,
        PeerRole::RightNeighbour,
    ];

    /// Number of addressable roles (size of every per-role table)
    pub const COUNT: usize = Self::ADDRESSABLE.len();

    /// Index of this role in a per-role table, `None` for `Undefined`
    pub fn slot(self) -> Option<usize> {
        match self {
            PeerRole::Undefined => None,
            role => Some(role as usize - 1),
        }
    }

    /// Role stored at a per-role table index
    pub fn from_slot(slot: usize) -> Option<Self> {
        Self::ADDRESSABLE.get(slot).copied()
    }

    /// The pipe tag byte for this role
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn is_addressable(self) -> bool {
        self != PeerRole::Undefined
    }
}

impl TryFrom<u8> for PeerRole {
    type Error = WorkerError;

    /// Only addressable tags convert; `0` and anything past the last role are rejected
    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(PeerRole::Broker),
            2 => Ok(PeerRole::LeftNeighbour),
            3 => Ok(PeerRole::RightNeighbour),
            _ => Err(WorkerError::InvalidRole { tag }),
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Undefined => write!(f, "Undefined"),
            PeerRole::Broker => write!(f, "Broker"),
            PeerRole::LeftNeighbour => write!(f, "LeftNeighbour"),
            PeerRole::RightNeighbour => write!(f, "RightNeighbour"),
        }
    }
}

// ----------------------------------------------------------------------------
// Message
// ----------------------------------------------------------------------------

/// One opaque frame of a message
pub type Frame = Vec<u8>;

/// Ordered sequence of opaque frames
///
/// Messages are moved between threads, never shared. When a message crosses
/// the pipe its first frame is the single-byte [`PeerRole`] tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    frames: Vec<Frame>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_frames(frames: Vec<Frame>) -> Self {
        Self { frames }
    }

    pub fn push_back<F: Into<Frame>>(&mut self, frame: F) {
        self.frames.push(frame.into());
    }

    pub fn push_front<F: Into<Frame>>(&mut self, frame: F) {
        self.frames.insert(0, frame.into());
    }

    pub fn pop_front(&mut self) -> Option<Frame> {
        if self.frames.is_empty() {
            None
        } else {
            Some(self.frames.remove(0))
        }
    }

    pub fn front(&self) -> Option<&Frame> {
        self.frames.first()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }

    /// Number of frames
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Prepend the role tag frame
    pub fn tagged(mut self, role: PeerRole) -> Self {
        self.push_front(vec![role.tag()]);
        self
    }

    /// Read the leading role tag without removing it
    pub fn peek_tag(&self) -> WorkerResult<PeerRole> {
        match self.frames.first().map(Vec::as_slice) {
            Some([tag]) => PeerRole::try_from(*tag),
            Some(frame) => Err(WorkerError::InvalidRole {
                tag: frame.first().copied().unwrap_or(0),
            }),
            None => Err(WorkerError::InvalidRole { tag: 0 }),
        }
    }

    /// Validate and strip the leading role tag
    ///
    /// The message is left untouched when the tag is invalid.
    pub fn take_tag(&mut self) -> WorkerResult<PeerRole> {
        let role = self.peek_tag()?;
        self.frames.remove(0);
        Ok(role)
    }
}

impl From<Vec<Frame>> for Message {
    fn from(frames: Vec<Frame>) -> Self {
        Self::from_frames(frames)
    }
}

impl FromIterator<Frame> for Message {
    fn from_iter<I: IntoIterator<Item = Frame>>(iter: I) -> Self {
        Self::from_frames(iter.into_iter().collect())
    }
}

// ----------------------------------------------------------------------------
// Signal
// ----------------------------------------------------------------------------

/// Out-of-band, frame-free values exchanged between the two threads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signal {
    /// Handshake succeeded (ready after startup, clean after shutdown)
    Ok,
    /// Handshake failed (startup failure, unclean shutdown)
    Ko,
    /// Shutdown request from the application thread
    Stop,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Ok => write!(f, "ok"),
            Signal::Ko => write!(f, "ko"),
            Signal::Stop => write!(f, "stop"),
        }
    }
}
