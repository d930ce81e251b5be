//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Connector` / `Link` traits. Broker client libraries are hidden behind
//! feature flags and exposed only through their connector types.
//!
//! Domain code must not depend on transport-specific types.

mod amqp;
mod memory;

#[cfg(feature = "transport_lapin")]
pub use amqp::LapinConnector;

pub use memory::{global_memory_broker, MemoryBroker};
