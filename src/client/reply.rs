//! Reply consumer loop.
//!
//! One [`ReplyConsumer`] is attached to the process's reply queue. The link
//! drives the receive loop and hands every delivery to
//! [`DeliveryConsumer::handle_delivery`]. This module only decides what a
//! delivery means:
//!
//! - no correlation id → dropped with a warning
//! - undecodable body → `RpcError::Decode` returned, which the link logs; no
//!   call is touched
//! - otherwise → forwarded to the [`CorrelationRegistry`]
//!
//! Errors never terminate the loop. One bad message must not stop replies for
//! every other in-flight call.

use crate::{
    // ---
    log_debug,
    log_warn,
    CodecPtr,
    CorrelationRegistry,
    DeliveryConsumer,
    Envelope,
    Resolution,
    Result,
};

/// Decodes replies and forwards them to the registry.
pub struct ReplyConsumer {
    registry: CorrelationRegistry,
    codec: CodecPtr,
}

impl ReplyConsumer {
    pub fn new(registry: CorrelationRegistry, codec: CodecPtr) -> Self {
        Self { registry, codec }
    }
}

#[async_trait::async_trait]
impl DeliveryConsumer for ReplyConsumer {
    async fn handle_delivery(&self, env: Envelope) -> Result<()> {
        // ---
        let Some(correlation_id) = env.properties.correlation_id else {
            log_warn!("reply on {} without correlation_id, dropped", env.routing_key);
            return Ok(());
        };

        let response = self.codec.decode(&env.payload).map_err(|e| {
            log_warn!("malformed reply for {correlation_id}: {e}");
            e
        })?;

        match self.registry.resolve(&correlation_id, &response) {
            Resolution::Settled => {}
            Resolution::Pending => {
                log_debug!("non-terminal reply for {correlation_id}, still waiting");
            }
            Resolution::Unknown => {
                log_debug!("no pending call for {correlation_id}, reply dropped");
            }
        }

        Ok(())
    }
}
