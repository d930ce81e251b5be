// src/client/mod.rs
//! RPC call façade.
//!
//! This module contains the [`RpcClient`] type, which sends requests to worker
//! services over a [`ConnectionManager`] and awaits their correlated replies.
//!
//! # Architecture
//!
//! Each call mints a fresh [`CorrelationId`], registers a pending call in the
//! [`CorrelationRegistry`], and publishes the encoded request to the request
//! exchange with the worker service as routing key and the process reply
//! queue as `reply_to`. The [`ReplyConsumer`] attached to the reply queue
//! settles the call when a terminal reply arrives.
//!
//! The pending-call registry belongs to the [`ConnectionManager`], so every
//! client built on one manager shares it along with the one reply consumer.
//! The consumer is attached lazily on the first call; the codec of the client
//! that attaches it decodes replies for all of them.
//!
//! # Concurrency
//!
//! Any number of calls may be in flight at once; they share one link and one
//! reply consumer. Calls carry no ordering guarantee. A call is never retried.

mod registry;
mod reply;

pub use registry::{CallOutcome, CorrelationRegistry, Resolution};
pub use reply::ReplyConsumer;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{oneshot, OnceCell};

use crate::{
    // ---
    expected_output_path,
    log_debug,
    log_warn,
    CodecPtr,
    ConnectionManager,
    CorrelationId,
    Envelope,
    FeatureTarget,
    RequestEnvelope,
    Result,
    RpcError,
};

/// RPC client shared by every call site in a process.
///
/// Cheap to clone (internally `Arc`-backed).
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    connection: ConnectionManager,
    registry: CorrelationRegistry,
    codec: CodecPtr,
    request_exchange: String,
    reply_queue: String,

    /// Set once the reply consumer is attached.
    reply_consumer: OnceCell<()>,
}

/// A published call whose reply has not been awaited yet.
///
/// Obtained from [`RpcClient::begin`]. The correlation id can be handed to
/// [`RpcClient::cancel`] from anywhere while [`wait`](Self::wait) is pending.
///
/// Dropping it before the call settles cancels the call.
pub struct PendingReply {
    correlation_id: CorrelationId,
    rx: oneshot::Receiver<CallOutcome>,
    registry: CorrelationRegistry,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Wait for the call to settle.
    ///
    /// # Errors
    ///
    /// - `RpcError::Remote` if the worker reported a failure
    /// - `RpcError::Timeout` if no terminal reply arrived in time
    /// - `RpcError::Publish` if the request never left the process
    /// - `RpcError::Cancelled` if the call was cancelled
    pub async fn wait(mut self) -> Result<String> {
        // ---
        match (&mut self.rx).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::Cancelled),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        // No-op once the call has settled.
        if self.registry.cancel(&self.correlation_id) {
            log_debug!("call {} abandoned by its waiter", self.correlation_id);
        }
    }
}

impl std::fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply")
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Create a client on top of an existing connection manager.
    ///
    /// Exchange and reply queue names are taken from the manager's topology.
    /// Clients built on the same manager share its pending-call registry.
    pub fn new(connection: ConnectionManager, codec: CodecPtr) -> Self {
        // ---
        let topology = connection.topology();
        let request_exchange = topology.request_exchange.name.clone();
        let reply_queue = topology.reply_to().to_string();
        let registry = connection.replies().clone();

        Self {
            inner: Arc::new(Inner {
                connection,
                registry,
                codec,
                request_exchange,
                reply_queue,
                reply_consumer: OnceCell::new(),
            }),
        }
    }

    /// Send `payload` to `target` and wait for the result reference.
    ///
    /// `payload` must serialize to a JSON object. `targetFeature` and
    /// `expectOutputPath` are added to it before encoding.
    ///
    /// # Errors
    ///
    /// - `RpcError::Encode` if the payload is not a JSON object
    /// - `RpcError::NotConnected` / `RpcError::Publish` if the request could
    ///   not be published
    /// - any error listed on [`PendingReply::wait`]
    pub async fn call<P>(&self, payload: &P, target: &FeatureTarget) -> Result<String>
    where
        P: Serialize + ?Sized,
    {
        self.begin(payload, target).await?.wait().await
    }

    /// Like [`call`](Self::call), with the target given field by field.
    pub async fn call_with<P>(
        &self,
        payload: &P,
        target_service: &str,
        target_feature: &str,
        timeout_ms: u64,
    ) -> Result<String>
    where
        P: Serialize + ?Sized,
    {
        // ---
        let target = FeatureTarget::new(
            target_service,
            target_feature,
            Duration::from_millis(timeout_ms),
        );
        self.call(payload, &target).await
    }

    /// Run `items` against `target` one after another.
    ///
    /// Stops at the first failure and returns it; results of the calls that
    /// completed before it are discarded.
    pub async fn call_each<I, P>(&self, items: I, target: &FeatureTarget) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = P>,
        P: Serialize,
    {
        // ---
        let mut results = Vec::new();
        for (_index, item) in items.into_iter().enumerate() {
            match self.call(&item, target).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    log_warn!("batch call #{_index} to {} failed: {e}", target.target_service);
                    return Err(e);
                }
            }
        }
        Ok(results)
    }

    /// Publish a call and return without waiting for its reply.
    ///
    /// A publish failure does not surface here: the call is settled with
    /// `RpcError::Publish` immediately and [`PendingReply::wait`] returns it.
    ///
    /// # Errors
    ///
    /// - `RpcError::Encode` if the payload is not a JSON object
    /// - `RpcError::NotConnected` / `RpcError::Publish` if the reply consumer
    ///   could not be attached
    pub async fn begin<P>(&self, payload: &P, target: &FeatureTarget) -> Result<PendingReply>
    where
        P: Serialize + ?Sized,
    {
        // ---
        let payload = to_object(payload)?;
        let correlation_id = CorrelationId::generate();

        self.ensure_reply_consumer().await?;

        let rx = self
            .inner
            .registry
            .register(correlation_id.clone(), target.timeout)?;

        let expect_output_path = expected_output_path(
            RequestEnvelope::input_ref(&payload),
            &target.target_service,
            &target.target_feature,
            &correlation_id,
        );

        let body = match self.inner.codec.encode(RequestEnvelope {
            payload,
            target_feature: target.target_feature.clone(),
            expect_output_path,
        }) {
            Ok(body) => body,
            Err(e) => {
                self.inner.registry.cancel(&correlation_id);
                return Err(e);
            }
        };

        let env = Envelope::request(
            self.inner.request_exchange.as_str(),
            target.target_service.as_str(),
            body,
            correlation_id.clone(),
            self.inner.reply_queue.as_str(),
        );

        let failure = match self.inner.connection.publish(&env).await {
            Ok(true) => None,
            Ok(false) => Some(RpcError::Publish(format!(
                "request for {} was not accepted by the channel",
                target.target_service
            ))),
            Err(e) => Some(RpcError::Publish(e.to_string())),
        };

        match failure {
            Some(e) => {
                log_warn!(
                    "call {correlation_id} to {} failed to publish: {e}",
                    target.target_service
                );
                self.inner.registry.settle(&correlation_id, Err(e));
            }
            None => {
                log_debug!(
                    "call {correlation_id} published to {} ({})",
                    target.target_service,
                    target.target_feature
                );
            }
        }

        Ok(PendingReply {
            correlation_id,
            rx,
            registry: self.inner.registry.clone(),
        })
    }

    /// Cancel a pending call. Its waiter gets `RpcError::Cancelled`.
    ///
    /// Returns `false` if no call was pending under `id`.
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        self.inner.registry.cancel(id)
    }

    /// Number of calls currently awaiting a reply, across every client that
    /// shares this client's connection manager.
    pub fn pending_calls(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    /// Close the underlying connection.
    pub async fn close(&self) -> Result<()> {
        self.inner.connection.close().await
    }

    async fn ensure_reply_consumer(&self) -> Result<()> {
        // ---
        self.inner
            .reply_consumer
            .get_or_try_init(|| async {
                let consumer = Arc::new(ReplyConsumer::new(
                    self.inner.registry.clone(),
                    self.inner.codec.clone(),
                ));
                self.inner
                    .connection
                    .consume(&self.inner.reply_queue, consumer)
                    .await
                    .map_err(|e| match e {
                        RpcError::NotConnected => RpcError::NotConnected,
                        other => RpcError::Publish(format!("reply consumer not attached: {other}")),
                    })
            })
            .await
            .map(|_| ())
    }
}

/// Serialize `payload` and require a JSON object.
fn to_object<P>(payload: &P) -> Result<Map<String, Value>>
where
    P: Serialize + ?Sized,
{
    // ---
    match serde_json::to_value(payload) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(RpcError::Encode("request payload must be a JSON object".into())),
        Err(e) => Err(RpcError::Encode(e.to_string())),
    }
}
