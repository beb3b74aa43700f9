//! Concrete TCP communicators
//!
//! - [`BrokerCommunicator`]: dials the central broker
//! - [`NeighbourCommunicator`]: links adjacent workers of a pipeline

pub mod broker;
pub mod codec;
mod link;
pub mod neighbour;

pub use broker::BrokerCommunicator;
pub use neighbour::NeighbourCommunicator;
