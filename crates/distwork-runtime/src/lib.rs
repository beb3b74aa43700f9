//! distwork Runtime Engine
//!
//! This crate contains the engine of a distwork worker:
//! - `WorkerApi`: the synchronous facade used by the application thread
//! - the inter-thread pipe and its endpoint namespace (`PipeContext`)
//! - the network thread, its `Reactor` and the shared network state
//! - the `Communicator` capability and the TCP broker and neighbour
//!   communicators
//!
//! `distwork-core` provides the types, errors and configuration shared by
//! both threads.

pub mod communicator;
pub mod communicators;
mod network;
pub mod pipe;
pub mod reactor;
mod shared;
mod worker;

pub use communicator::{Communicator, CommunicatorRegistry, PeerInput, PeerSource};
pub use communicators::{BrokerCommunicator, NeighbourCommunicator};
pub use pipe::{PipeBinding, PipeContext};
pub use reactor::{Reactor, ReactorEvent};
pub use shared::DeliverySink;
pub use worker::{StopOptions, WorkerApi};

// Re-export core types for convenience
pub use distwork_core::{
    Endpoint, Message, NetworkStatsSnapshot, PeerRole, Signal, TransportError, TransportResult,
    WorkerConfig, WorkerError, WorkerResult,
};
