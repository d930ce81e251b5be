//! RPC client builder.
//!
//! Provides a fluent builder API that assembles configuration, a connector,
//! a codec and the connection manager into a connected [`RpcClient`].

use std::sync::Arc;

use crate::{
    // ---
    global_memory_broker,
    log_info,
    BrokerConfig,
    CodecPtr,
    ConnectionManager,
    ConnectionState,
    ConnectorPtr,
    DispatchConfig,
    JsonCodec,
    ReconnectPolicy,
    Result,
    RpcClient,
    RpcError,
    Topology,
};

/// Builder for [`RpcClient`] instances.
///
/// # Examples
///
/// ## From the environment
/// ```no_run
/// use mom_dispatch::{DispatchConfig, RpcClientBuilder};
///
/// # async fn example() -> mom_dispatch::Result<()> {
/// let config = DispatchConfig::from_env()?;
/// let client = RpcClientBuilder::new().config(&config).build().await?;
///
/// let result = client
///     .call(&serde_json::json!({"file": "s3://in/cat.png"}), &config.image2image)
///     .await?;
/// # Ok(())
/// # }
/// ```
///
/// ## In-process broker
/// ```no_run
/// use mom_dispatch::{BrokerConfig, MemoryBroker, RpcClientBuilder};
///
/// # async fn example() -> mom_dispatch::Result<()> {
/// let broker = MemoryBroker::new();
/// let client = RpcClientBuilder::new()
///     .broker(BrokerConfig::new("memory://").with_reply_queue("workflow-test"))
///     .connector(broker.connector())
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct RpcClientBuilder {
    // ---
    broker: Option<BrokerConfig>,
    reconnect: Option<ReconnectPolicy>,

    // Collaborators (optional, defaults chosen from the URL)
    connector: Option<ConnectorPtr>,
    codec: Option<CodecPtr>,
}

impl RpcClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take broker settings and reconnect policy from a full config.
    pub fn config(mut self, config: &DispatchConfig) -> Self {
        // ---
        self.broker = Some(config.broker.clone());
        self.reconnect = Some(config.reconnect);
        self
    }

    /// Set broker connection and naming parameters.
    pub fn broker(mut self, broker: BrokerConfig) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Set the reconnect policy.
    ///
    /// Default: 5 attempts, 5s apart.
    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    /// Use an explicit connector instead of the one implied by the URL.
    pub fn connector(mut self, connector: ConnectorPtr) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Set the payload codec.
    ///
    /// Default: [`JsonCodec`].
    pub fn codec(mut self, codec: CodecPtr) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Build the client and connect it (consumes self).
    ///
    /// A failed initial connection does not fail the build: the connection
    /// manager keeps retrying in the background, and calls fail with
    /// `RpcError::NotConnected` until it succeeds.
    ///
    /// # Errors
    ///
    /// - `RpcError::MissingConfig` if no broker settings were given
    /// - `RpcError::Config` if they are invalid, or no transport serves the URL
    pub async fn build(self) -> Result<RpcClient> {
        // ---
        let broker = self
            .broker
            .ok_or_else(|| RpcError::MissingConfig("broker".into()))?;
        broker.validate()?;

        let connector = match self.connector {
            Some(connector) => connector,
            None => default_connector(&broker.url)?,
        };
        let codec = self.codec.unwrap_or_else(|| Arc::new(JsonCodec));
        let policy = self.reconnect.unwrap_or_default();

        let connection = ConnectionManager::new(connector, Topology::from_config(&broker), policy);
        if connection.connect().await == ConnectionState::Connected {
            log_info!("rpc client ready, replies on {}", broker.reply_queue);
        }

        Ok(RpcClient::new(connection, codec))
    }
}

/// Pick the connector serving `url`.
fn default_connector(url: &str) -> Result<ConnectorPtr> {
    // ---
    if url.starts_with("memory://") {
        return Ok(global_memory_broker().connector());
    }

    #[cfg(feature = "transport_lapin")]
    {
        Ok(Arc::new(crate::LapinConnector::new(url)))
    }

    #[cfg(not(feature = "transport_lapin"))]
    {
        Err(RpcError::Config(format!(
            "no transport available for {url}; enable the transport_lapin feature"
        )))
    }
}
