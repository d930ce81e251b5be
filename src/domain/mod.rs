//! Domain layer public interface.
//!
//! This module defines abstractions that are independent of any broker client
//! library. All consumers import symbols via this module, not by referencing
//! individual files directly.

mod transport;

// --- Transport domain re-exports ---

pub use transport::{
    //
    ConnectionState,
    Connector,
    ConnectorPtr,
    ConsumerPtr,
    DeliveryConsumer,
    Envelope,
    Link,
    LinkLost,
    LinkPtr,
    LossNotifier,
    MessageProperties,
};
