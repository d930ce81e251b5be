//! Asynchronous RPC over AMQP with automatic request/response correlation
//!
//! This library dispatches long-running units of work to worker services
//! through a message broker and hands each caller exactly one correlated
//! result or failure. It handles the broker connection and its reconnection,
//! topology declaration, correlation id generation, reply matching and
//! per-call timeouts.
//!
//! ```no_run
//! use mom_dispatch::{DispatchConfig, RpcClientBuilder, VideoLiteRequest};
//!
//! # async fn example() -> mom_dispatch::Result<()> {
//! let config = DispatchConfig::from_env()?;
//! let client = RpcClientBuilder::new().config(&config).build().await?;
//!
//! let request = VideoLiteRequest {
//!     file: Some("s3://uploads/face.png".into()),
//!     ..Default::default()
//! };
//! let output = client.call(&request, &config.video_lite).await?;
//! println!("result: {output}");
//! # Ok(())
//! # }
//! ```

// Import all sub modules once...
mod client;
mod client_builder;
mod codec;
mod config;
mod connection;
mod correlation;
mod domain;
mod error;
mod features;
mod macros;
mod protocol;
mod topology;
mod transport;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use client::{
    // ---
    CallOutcome,
    CorrelationRegistry,
    PendingReply,
    ReplyConsumer,
    Resolution,
    RpcClient,
};
pub use client_builder::RpcClientBuilder;
pub use connection::ConnectionManager;

pub use codec::{Codec, CodecPtr, JsonCodec};
pub use config::{
    // ---
    BrokerConfig,
    DispatchConfig,
    FeatureTarget,
    ReconnectPolicy,
    DEFAULT_QUEUE,
    DEFAULT_REQUEST_EXCHANGE,
    DEFAULT_RESULT_EXCHANGE,
};
pub use correlation::CorrelationId;
pub use error::{FailureKind, Result, RpcError};
pub use features::{
    // ---
    CombineImageRequest,
    Image2ImageRequest,
    VideoLiteRequest,
    VideoMode,
    VideoStatus,
};
pub use protocol::{expected_output_path, RequestEnvelope, ResponseEnvelope};
pub use topology::{BindingSpec, ExchangeKind, ExchangeSpec, QueueSpec, Topology};

#[cfg(feature = "transport_lapin")]
pub use transport::LapinConnector;

pub use transport::{global_memory_broker, MemoryBroker};

// --- public re-exports
pub use domain::{
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
