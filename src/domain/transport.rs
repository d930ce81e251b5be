// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the seam between the connection manager and concrete
//! broker clients. It avoids any reference to a specific client library.
//!
//! A [`Connector`] opens [`Link`]s. A link is one live connection plus one
//! channel; it knows how to declare a [`Topology`], publish an [`Envelope`]
//! and attach a [`DeliveryConsumer`] to a queue. Links do not reconnect on
//! their own: when one dies it reports through its [`LossNotifier`], and the
//! connection manager decides what happens next.
//!
//! Concrete implementations live under `src/transport/`.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{CorrelationId, Result, Topology};

/// Process-wide state of the broker link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link; publish and consume fail.
    Disconnected,
    /// A link is being opened or its topology declared.
    Connecting,
    /// A link is up and the topology is in place.
    Connected,
}

/// Broker-native message properties used by the RPC layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Correlation identifier linking a reply to its request.
    pub correlation_id: Option<CorrelationId>,

    /// Queue the reply must be routed to. Set on requests only.
    pub reply_to: Option<String>,

    /// Informational payload format, e.g. `"application/json"`.
    pub content_type: Option<String>,
}

/// An opaque message as seen by the transport layer.
///
/// Used for both directions: outgoing publishes name the exchange and routing
/// key to publish to, inbound deliveries carry the exchange and routing key
/// they arrived with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    // ---
    pub exchange: String,
    pub routing_key: String,
    pub payload: Bytes,
    pub properties: MessageProperties,
}

impl Envelope {
    /// Create a request envelope carrying correlation and reply routing.
    pub fn request(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: Bytes,
        correlation_id: CorrelationId,
        reply_to: impl Into<String>,
    ) -> Self {
        // ---
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload,
            properties: MessageProperties {
                correlation_id: Some(correlation_id),
                reply_to: Some(reply_to.into()),
                content_type: Some("application/json".into()),
            },
        }
    }

    /// Create a reply envelope, as a worker would publish it.
    pub fn reply(
        exchange: impl Into<String>,
        reply_to: impl Into<String>,
        payload: Bytes,
        correlation_id: CorrelationId,
    ) -> Self {
        // ---
        Self {
            exchange: exchange.into(),
            routing_key: reply_to.into(),
            payload,
            properties: MessageProperties {
                correlation_id: Some(correlation_id),
                reply_to: None,
                content_type: Some("application/json".into()),
            },
        }
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.properties.correlation_id.as_ref()
    }
}

/// Receiver of messages delivered on a consumed queue.
///
/// Returning an error does not stop the delivery loop; the link logs it and
/// moves on to the next message.
#[async_trait::async_trait]
pub trait DeliveryConsumer: Send + Sync {
    async fn handle_delivery(&self, env: Envelope) -> Result<()>;
}

/// Shared consumer pointer.
pub type ConsumerPtr = Arc<dyn DeliveryConsumer>;

/// Reports the loss of one specific link to its connection manager.
///
/// Each link is opened with a notifier tagged by a generation number, so a
/// late report from an already replaced link can be told apart from a loss
/// of the current one.
#[derive(Clone, Debug)]
pub struct LossNotifier {
    generation: u64,
    tx: mpsc::UnboundedSender<LinkLost>,
}

/// A link-loss report.
#[derive(Clone, Debug)]
pub struct LinkLost {
    pub generation: u64,
    pub reason: String,
}

impl LossNotifier {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<LinkLost>) -> Self {
        Self { generation, tx }
    }

    /// Report that the link died. Safe to call from any thread, any number of times.
    pub fn notify(&self, reason: impl Into<String>) {
        // ---
        let _ = self.tx.send(LinkLost {
            generation: self.generation,
            reason: reason.into(),
        });
    }
}

/// One live connection plus channel to the broker.
#[async_trait::async_trait]
pub trait Link: Send + Sync {
    /// Declare exchanges, queues and bindings. Must be idempotent.
    async fn declare(&self, topology: &Topology) -> Result<()>;

    /// Hand one message to the channel.
    ///
    /// `Ok(true)` means the channel accepted the message for buffering; it says
    /// nothing about broker-side delivery. `Ok(false)` means it was refused.
    async fn publish(&self, env: &Envelope) -> Result<bool>;

    /// Start delivering messages from `queue` to `consumer`.
    async fn consume(&self, queue: &str, consumer: ConsumerPtr) -> Result<()>;

    /// Close the channel, then the connection.
    async fn close(&self) -> Result<()>;
}

/// Shared link pointer.
pub type LinkPtr = Arc<dyn Link>;

/// Factory for links to one broker.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Open a fresh link. The link must call `lost.notify(..)` when it dies.
    async fn open(&self, lost: LossNotifier) -> Result<LinkPtr>;
}

/// Shared connector pointer.
pub type ConnectorPtr = Arc<dyn Connector>;
