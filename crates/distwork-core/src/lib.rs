//! distwork Core Types
//!
//! This crate provides the foundational types shared by both sides of a
//! distwork worker: peer roles, multi-frame messages and handshake signals,
//! the error taxonomy, configuration records, peer endpoint parsing and the
//! network statistics counters. It owns no threads and no sockets; the
//! engine lives in `distwork-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod endpoint;
pub mod errors;
pub mod stats;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{HeartbeatConfig, LinkConfig, PipeConfig, WorkerConfig};
pub use endpoint::Endpoint;
pub use errors::{TransportError, TransportResult, WorkerError, WorkerResult};
pub use stats::{NetworkStats, NetworkStatsSnapshot};
pub use types::{Frame, Message, PeerRole, Signal};
