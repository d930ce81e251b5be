//! In-memory broker.
//!
//! A pure in-process stand-in for an AMQP broker, implementing the
//! [`Connector`] / [`Link`] seam. It is intended for testing and local
//! execution, and as the reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! - Direct exchanges: a message reaches every queue bound to its exchange
//!   under exactly its routing key. Publishing to an undeclared exchange fails.
//! - Declarations are idempotent. Re-declaring an exchange or queue with
//!   different attributes fails, as a real broker would.
//! - Messages are buffered in a queue until a consumer attaches.
//! - A queue has at most one consumer. When the link owning that consumer
//!   closes or is severed, `auto_delete` queues are deleted with their
//!   bindings.
//!
//! ## Fault injection
//!
//! [`MemoryBroker::sever_links`] kills every open link and reports the loss,
//! [`MemoryBroker::refuse_connections`] makes the next connection attempts fail,
//! and [`MemoryBroker::set_reject_publishes`] makes channels refuse messages.
//!
//! ## Non-Goals
//!
//! Persistence, acknowledgements and prefetch are not modelled.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio::sync::mpsc;

#[allow(unused_imports)]
use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    BindingSpec,
    Connector,
    ConnectorPtr,
    ConsumerPtr,
    Envelope,
    ExchangeSpec,
    Link,
    LinkPtr,
    LossNotifier,
    QueueSpec,
    Result,
    RpcError,
    Topology,
};

/// Owner id for consumers attached from outside any link (taps).
const TAP_OWNER: u64 = 0;

struct MemoryQueue {
    spec: QueueSpec,
    buffered: VecDeque<Envelope>,
    consumer: Option<(u64, mpsc::UnboundedSender<Envelope>)>,
}

impl MemoryQueue {
    fn push(&mut self, env: Envelope) {
        // ---
        let env = match &self.consumer {
            Some((_, tx)) => match tx.send(env) {
                Ok(()) => return,
                Err(mpsc::error::SendError(env)) => {
                    self.consumer = None;
                    env
                }
            },
            None => env,
        };
        self.buffered.push_back(env);
    }
}

#[derive(Default)]
struct HubState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<BindingSpec>,
    links: HashMap<u64, LossNotifier>,
    next_link_id: u64,

    refuse_connections: u32,
    reject_publishes: bool,
    connections_opened: u32,
    declarations: u32,
}

impl HubState {
    fn route(&mut self, env: &Envelope) -> Result<usize> {
        // ---
        if !self.exchanges.contains_key(&env.exchange) {
            return Err(RpcError::Transport(format!(
                "NOT_FOUND - no exchange '{}'",
                env.exchange
            )));
        }

        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == env.exchange && b.routing_key == env.routing_key)
            .map(|b| b.queue.clone())
            .collect();

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.push(env.clone());
            }
        }

        Ok(targets.len())
    }

    fn declare_queue(&mut self, spec: &QueueSpec) -> Result<()> {
        // ---
        match self.queues.get(&spec.name) {
            Some(existing) if existing.spec != *spec => Err(RpcError::Transport(format!(
                "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                spec.name
            ))),
            Some(_) => Ok(()),
            None => {
                self.queues.insert(
                    spec.name.clone(),
                    MemoryQueue {
                        spec: spec.clone(),
                        buffered: VecDeque::new(),
                        consumer: None,
                    },
                );
                Ok(())
            }
        }
    }

    fn bind(&mut self, binding: BindingSpec) {
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
    }

    /// Detach every consumer owned by `link_id` and apply auto-delete.
    fn release_link(&mut self, link_id: u64) {
        // ---
        let mut deleted = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            if matches!(queue.consumer, Some((owner, _)) if owner == link_id) {
                queue.consumer = None;
                if queue.spec.auto_delete {
                    deleted.push(name.clone());
                }
            }
        }

        for name in &deleted {
            self.queues.remove(name);
            self.bindings.retain(|b| &b.queue != name);
            log_debug!("auto-deleted queue {name}");
        }

        self.links.remove(&link_id);
    }
}

/// Shared in-process broker.
///
/// Every [`Connector`] handed out by [`connector`](Self::connector) talks to
/// the same exchanges and queues, exactly as processes connected to one real
/// broker would.
pub struct MemoryBroker {
    // ---
    state: Mutex<HubState>,
}

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MemoryBroker {
    /// Create a new, empty broker.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self {
            state: Mutex::new(HubState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        lock_ignore_poison(&self.state)
    }

    /// Connector opening links to this broker.
    pub fn connector(self: &Arc<Self>) -> ConnectorPtr {
        Arc::new(MemoryConnector {
            broker: Arc::clone(self),
        })
    }

    /// Kill every open link and report the loss to its owner.
    pub fn sever_links(&self) {
        // ---
        let mut state = self.lock();
        let ids: Vec<u64> = state.links.keys().copied().collect();
        for id in ids {
            if let Some(notifier) = state.links.get(&id).cloned() {
                state.release_link(id);
                notifier.notify("connection reset by memory broker");
            }
        }
        log_info!("memory broker severed all links");
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_connections(&self, count: u32) {
        self.lock().refuse_connections = count;
    }

    /// Make every channel refuse (or accept again) published messages.
    pub fn set_reject_publishes(&self, reject: bool) {
        self.lock().reject_publishes = reject;
    }

    /// Route a message as if another client had published it.
    ///
    /// Used to play the worker side in tests. Returns the number of queues
    /// the message reached.
    pub fn inject(&self, env: Envelope) -> Result<usize> {
        self.lock().route(&env)
    }

    /// Declare `queue`, bind it to `exchange` under `routing_key`, and receive
    /// everything routed to it.
    ///
    /// The exchange is declared as a direct exchange if it does not exist yet.
    pub fn tap(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>> {
        // ---
        let mut state = self.lock();

        state
            .exchanges
            .entry(exchange.to_string())
            .or_insert_with(|| ExchangeSpec {
                name: exchange.to_string(),
                kind: crate::ExchangeKind::Direct,
                durable: false,
            });
        state.declare_queue(&QueueSpec {
            name: queue.to_string(),
            durable: false,
            auto_delete: false,
        })?;
        state.bind(BindingSpec {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(q) = state.queues.get_mut(queue) {
            for env in q.buffered.drain(..) {
                let _ = tx.send(env);
            }
            q.consumer = Some((TAP_OWNER, tx));
        }
        Ok(rx)
    }

    /// Number of successful connections opened so far.
    pub fn connections_opened(&self) -> u32 {
        self.lock().connections_opened
    }

    /// Number of topology declarations performed so far.
    pub fn declarations(&self) -> u32 {
        self.lock().declarations
    }

    /// Number of currently open links.
    pub fn open_links(&self) -> usize {
        self.lock().links.len()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumer.as_ref().is_some_and(|(_, tx)| !tx.is_closed()))
            .unwrap_or(false)
    }

    /// Messages waiting in `queue` for a consumer.
    pub fn buffered(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.buffered.len())
            .unwrap_or(0)
    }
}

/// Opens [`MemoryLink`]s on a shared [`MemoryBroker`].
struct MemoryConnector {
    broker: Arc<MemoryBroker>,
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, lost: LossNotifier) -> Result<LinkPtr> {
        // ---
        let mut state = self.broker.lock();

        if state.refuse_connections > 0 {
            state.refuse_connections -= 1;
            return Err(RpcError::Connection(
                "connection refused by memory broker".into(),
            ));
        }

        state.next_link_id += 1;
        let id = state.next_link_id;
        state.links.insert(id, lost);
        state.connections_opened += 1;

        log_debug!("memory link #{id} opened");

        Ok(Arc::new(MemoryLink {
            id,
            broker: Arc::clone(&self.broker),
            closed: AtomicBool::new(false),
        }))
    }
}

/// One connection + channel on a [`MemoryBroker`].
struct MemoryLink {
    id: u64,
    broker: Arc<MemoryBroker>,
    closed: AtomicBool,
}

impl MemoryLink {
    /// Fails once the link was closed locally or severed by the broker.
    fn ensure_open(&self, state: &HubState) -> Result<()> {
        // ---
        if self.closed.load(Ordering::SeqCst) || !state.links.contains_key(&self.id) {
            return Err(RpcError::Transport(format!(
                "memory link #{} is closed",
                self.id
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Link for MemoryLink {
    async fn declare(&self, topology: &Topology) -> Result<()> {
        // ---
        let mut guard = self.broker.lock();
        let state = &mut *guard;
        self.ensure_open(state)?;

        for exchange in topology.exchanges() {
            match state.exchanges.get(&exchange.name) {
                Some(existing) if existing != exchange => {
                    return Err(RpcError::Transport(format!(
                        "PRECONDITION_FAILED - inequivalent arg for exchange '{}'",
                        exchange.name
                    )));
                }
                Some(_) => {}
                None => {
                    state.exchanges.insert(exchange.name.clone(), exchange.clone());
                }
            }
        }

        for queue in topology.queues() {
            state.declare_queue(queue)?;
        }

        for binding in topology.bindings() {
            state.bind(binding);
        }

        state.declarations += 1;
        Ok(())
    }

    async fn publish(&self, env: &Envelope) -> Result<bool> {
        // ---
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;

        if state.reject_publishes {
            return Ok(false);
        }

        let routed = state.route(env)?;
        if routed == 0 {
            log_debug!(
                "memory link #{}: message to {}/{} was unroutable",
                self.id,
                env.exchange,
                env.routing_key
            );
        }
        Ok(true)
    }

    async fn consume(&self, queue: &str, consumer: ConsumerPtr) -> Result<()> {
        // ---
        let rx = {
            let mut state = self.broker.lock();
            self.ensure_open(&state)?;

            let q = state.queues.get_mut(queue).ok_or_else(|| {
                RpcError::Transport(format!("NOT_FOUND - no queue '{queue}'"))
            })?;

            if q.consumer.as_ref().is_some_and(|(_, tx)| !tx.is_closed()) {
                return Err(RpcError::Transport(format!(
                    "queue '{queue}' already has a consumer"
                )));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            for env in q.buffered.drain(..) {
                let _ = tx.send(env);
            }
            q.consumer = Some((self.id, tx));
            rx
        };

        let link_id = self.id;
        let queue = queue.to_string();
        tokio::spawn(async move {
            let mut rx = rx;
            while let Some(env) = rx.recv().await {
                if let Err(_e) = consumer.handle_delivery(env).await {
                    log_warn!("memory link #{link_id}: consumer error on {queue}: {_e}");
                }
            }
            log_debug!("memory link #{link_id}: consumer for {queue} stopped");
        });

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.broker.lock().release_link(self.id);
        log_debug!("memory link #{} closed", self.id);
        Ok(())
    }
}

/// Process-global broker used for `memory://` URLs.
static GLOBAL_BROKER: OnceLock<Arc<MemoryBroker>> = OnceLock::new();

/// The process-global memory broker.
///
/// All clients built for a `memory://` URL without an explicit connector
/// share it. Tests that need isolation construct their own [`MemoryBroker`].
pub fn global_memory_broker() -> Arc<MemoryBroker> {
    GLOBAL_BROKER.get_or_init(MemoryBroker::new).clone()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{BrokerConfig, CorrelationId};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Forward(mpsc::UnboundedSender<Envelope>);

    #[async_trait::async_trait]
    impl crate::DeliveryConsumer for Forward {
        async fn handle_delivery(&self, env: Envelope) -> Result<()> {
            let _ = self.0.send(env);
            Ok(())
        }
    }

    fn topology() -> Topology {
        Topology::from_config(
            &BrokerConfig::new("memory://").with_reply_queue("workflow-memtest"),
        )
    }

    async fn open(broker: &Arc<MemoryBroker>) -> LinkPtr {
        let (tx, _rx) = mpsc::unbounded_channel();
        broker
            .connector()
            .open(LossNotifier::new(1, tx))
            .await
            .expect("open failed")
    }

    #[tokio::test]
    async fn test_declare_is_idempotent() {
        // ---
        let broker = MemoryBroker::new();
        let link = open(&broker).await;

        link.declare(&topology()).await.unwrap();
        link.declare(&topology()).await.unwrap();

        assert_eq!(broker.declarations(), 2);
        assert!(broker.queue_exists("workflow-queue-local"));
        assert!(broker.queue_exists("workflow-memtest"));
    }

    #[tokio::test]
    async fn test_declare_conflicting_attributes_fails() {
        // ---
        let broker = MemoryBroker::new();
        let link = open(&broker).await;
        link.declare(&topology()).await.unwrap();

        let mut changed = topology();
        changed.shared_queue.durable = false;

        let err = link.declare(&changed).await.unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
    }

    #[tokio::test]
    async fn test_routing_and_buffering() {
        // ---
        let broker = MemoryBroker::new();
        let link = open(&broker).await;
        let topology = topology();
        link.declare(&topology).await.unwrap();

        let env = Envelope::reply(
            "ai-result",
            "workflow-memtest",
            Bytes::from_static(b"{}"),
            CorrelationId::generate(),
        );
        assert!(link.publish(&env).await.unwrap());
        assert_eq!(broker.buffered("workflow-memtest"), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        link.consume("workflow-memtest", Arc::new(Forward(tx)))
            .await
            .unwrap();

        let received = timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("timed out waiting for buffered message")
            .expect("consumer channel closed");
        assert_eq!(received, env);
        assert_eq!(broker.buffered("workflow-memtest"), 0);
    }

    #[tokio::test]
    async fn test_sever_notifies_and_auto_deletes() {
        // ---
        let broker = MemoryBroker::new();
        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel();
        let link = broker
            .connector()
            .open(LossNotifier::new(7, lost_tx))
            .await
            .unwrap();
        link.declare(&topology()).await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        link.consume("workflow-memtest", Arc::new(Forward(tx)))
            .await
            .unwrap();

        broker.sever_links();

        let lost = lost_rx.recv().await.expect("no loss reported");
        assert_eq!(lost.generation, 7);
        assert!(!broker.queue_exists("workflow-memtest"));
        assert!(broker.queue_exists("workflow-queue-local"));
        assert!(link.publish(&Envelope::reply(
            "ai-result",
            "x",
            Bytes::new(),
            CorrelationId::generate()
        ))
        .await
        .is_err());
    }

    #[tokio::test]
    async fn test_refuse_and_reject() {
        // ---
        let broker = MemoryBroker::new();
        broker.refuse_connections(1);

        let (tx, _rx) = mpsc::unbounded_channel();
        let connector = broker.connector();
        assert!(connector.open(LossNotifier::new(1, tx.clone())).await.is_err());

        let link = connector.open(LossNotifier::new(2, tx)).await.unwrap();
        link.declare(&topology()).await.unwrap();

        broker.set_reject_publishes(true);
        let env = Envelope::request(
            "ai-request",
            "svc",
            Bytes::new(),
            CorrelationId::generate(),
            "workflow-memtest",
        );
        assert!(!link.publish(&env).await.unwrap());
    }
}
