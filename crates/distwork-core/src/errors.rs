//! Error types for the distwork agent
//!
//! This module contains the error taxonomy shared by the core types, the
//! network thread and the worker facade: transport errors raised by
//! communicators on their network links, and the `WorkerError` type that
//! every public operation of the facade reports.

use crate::types::PeerRole;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Errors raised by a communicator while talking to its peer
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },
    #[error("Network I/O error: {0}")]
    NetworkIo(#[from] std::io::Error),
    #[error("Protocol mismatch: expected {expected}, got {actual}")]
    ProtocolMismatch { expected: String, actual: String },
    #[error("Frame too large: {size} bytes (max: {max_size})")]
    FrameTooLarge { size: usize, max_size: usize },
    #[error("Outbound queue full (capacity: {capacity})")]
    SendBufferFull { capacity: usize },
    #[error("Transport timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("Invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("Transport shutdown: {reason}")]
    Shutdown { reason: String },
    #[error("Wire encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

// ----------------------------------------------------------------------------
// Worker Error
// ----------------------------------------------------------------------------

/// Errors reported by the worker facade
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Another worker in the same context already bound this pipe address
    #[error("Endpoint '{address}' already taken")]
    AddressInUse { address: String },

    #[error("A communicator is already registered for {role}")]
    AlreadyRegistered { role: PeerRole },

    #[error("Worker is already started")]
    AlreadyStarted,

    #[error("Worker is not started")]
    NotStarted,

    /// A role tag that does not name an addressable peer role
    #[error("Invalid peer role tag {tag}")]
    InvalidRole { tag: u8 },

    /// The role is valid but no communicator is registered for it
    #[error("No communicator registered for {role}")]
    UnroutableRole { role: PeerRole },

    #[error("Network thread failed to start: {reason}")]
    StartupFailed { reason: String },

    #[error("Pipe is full (capacity: {capacity})")]
    PipeFull { capacity: usize },

    #[error("Pipe is closed")]
    PipeClosed,

    /// The network thread terminated but could not release every communicator cleanly
    #[error("Network thread did not shut down cleanly")]
    UncleanShutdown,

    #[error("Forced stop is not supported")]
    ForceStopUnsupported,

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl WorkerError {
    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        WorkerError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a startup failure with a reason
    pub fn startup_failed<T: Into<String>>(reason: T) -> Self {
        WorkerError::StartupFailed {
            reason: reason.into(),
        }
    }
}

impl TransportError {
    /// Create a protocol mismatch error
    pub fn protocol_mismatch<E: Into<String>, A: Into<String>>(expected: E, actual: A) -> Self {
        TransportError::ProtocolMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a shutdown error with a reason
    pub fn shutdown<T: Into<String>>(reason: T) -> Self {
        TransportError::Shutdown {
            reason: reason.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type WorkerResult<T> = core::result::Result<T, WorkerError>;
pub type TransportResult<T> = core::result::Result<T, TransportError>;
