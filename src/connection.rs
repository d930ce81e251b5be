//! Broker connection manager.
//!
//! Owns the single live [`Link`] a process multiplexes all of its calls over,
//! and keeps the broker-side [`Topology`] in place across reconnects.
//!
//! ## Lifecycle
//!
//! - [`connect`](ConnectionManager::connect) opens a link, declares the
//!   topology and re-attaches every registered consumer. A failure is not
//!   returned to the caller; it starts the reconnect procedure instead.
//! - When a link dies, its [`LossNotifier`] wakes the supervisor task, which
//!   runs the reconnect procedure: up to `max_attempts` tries, each after a
//!   fixed `interval`. Success resets the counter. Exhaustion is logged and
//!   leaves the manager `Disconnected` until [`reconnect`] is called.
//! - [`close`](ConnectionManager::close) closes the link and stops the
//!   supervisor. It is idempotent and final.
//!
//! ## Concurrency model
//!
//! - Reconnects run one at a time inside the supervisor task.
//! - The current link sits behind a `tokio::sync::RwLock`; publishers clone
//!   the pointer and release the lock before touching the link.
//! - The consumer table is locked for the whole of a link swap, so a
//!   concurrent `consume` either lands before the swap (and is re-attached by
//!   it) or after it (and attaches to the new link).
//!
//! ## Replies
//!
//! The manager also owns the [`CorrelationRegistry`] for its reply queue.
//! Every client built on one manager registers its calls there, so the single
//! consumer attached to the reply queue settles calls for all of them.
//!
//! [`reconnect`]: ConnectionManager::reconnect

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;

use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    ConnectionState,
    ConnectorPtr,
    ConsumerPtr,
    CorrelationRegistry,
    Envelope,
    LinkLost,
    LinkPtr,
    LossNotifier,
    ReconnectPolicy,
    Result,
    RpcError,
    Topology,
};

/// Upper bound on how long closing a (possibly dead) link may take.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Process-wide broker connection, shared by cloning.
///
/// Construct one per process and pass clones to every call site.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    connector: ConnectorPtr,
    topology: Topology,
    policy: ReconnectPolicy,

    link: RwLock<Option<LinkPtr>>,
    consumers: tokio::sync::Mutex<HashMap<String, ConsumerPtr>>,
    replies: CorrelationRegistry,
    state: watch::Sender<ConnectionState>,

    attempts: AtomicU32,
    generation: AtomicU64,
    closed: AtomicBool,

    lost_tx: mpsc::UnboundedSender<LinkLost>,
    lost_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkLost>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a manager. Nothing is opened until [`connect`](Self::connect).
    pub fn new(connector: ConnectorPtr, topology: Topology, policy: ReconnectPolicy) -> Self {
        // ---
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            inner: Arc::new(Inner {
                connector,
                topology,
                policy,
                link: RwLock::new(None),
                consumers: tokio::sync::Mutex::new(HashMap::new()),
                replies: CorrelationRegistry::new(),
                state,
                attempts: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                lost_tx,
                lost_rx: Mutex::new(Some(lost_rx)),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Open the link and declare the topology.
    ///
    /// Never fails: on error the reconnect procedure takes over in the
    /// background. The returned state tells whether the link is already up.
    pub async fn connect(&self) -> ConnectionState {
        // ---
        if self.inner.closed.load(Ordering::SeqCst) {
            log_warn!("connect() called on a closed connection manager");
            return self.state();
        }

        self.ensure_supervisor();

        match self.inner.try_connect().await {
            Ok(()) => {}
            Err(e) => {
                log_error!("failed to connect to broker: {e}");
                self.inner.report_loss(e.to_string());
            }
        }

        self.state()
    }

    /// Retry immediately with a fresh attempt budget.
    ///
    /// Used to recover after the automatic budget has been exhausted.
    pub async fn reconnect(&self) -> Result<()> {
        // ---
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Connection("connection manager is closed".into()));
        }

        self.ensure_supervisor();
        self.inner.attempts.store(0, Ordering::SeqCst);
        self.inner.try_connect().await
    }

    /// Publish one message on the current link.
    ///
    /// # Returns
    ///
    /// - `Ok(true)` if the channel accepted the message for buffering
    /// - `Ok(false)` if the channel refused it or the link failed mid-publish
    ///
    /// # Errors
    ///
    /// [`RpcError::NotConnected`] if no channel is established.
    pub async fn publish(&self, env: &Envelope) -> Result<bool> {
        // ---
        let link = self.inner.current_link().await.ok_or(RpcError::NotConnected)?;

        match link.publish(env).await {
            Ok(accepted) => {
                if accepted {
                    log_debug!("published to {}/{}", env.exchange, env.routing_key);
                } else {
                    log_warn!("channel refused message for {}/{}", env.exchange, env.routing_key);
                }
                Ok(accepted)
            }
            Err(e) => {
                log_error!("failed to publish message: {e}");
                Ok(false)
            }
        }
    }

    /// Attach `consumer` to `queue`.
    ///
    /// At most one consumer is kept per queue; registering another for the
    /// same queue is a no-op. Registered consumers are re-attached after every
    /// reconnect.
    ///
    /// # Errors
    ///
    /// [`RpcError::NotConnected`] if no channel is established, or the link's
    /// error if the broker refuses the subscription.
    pub async fn consume(&self, queue: &str, consumer: ConsumerPtr) -> Result<()> {
        // ---
        let mut consumers = self.inner.consumers.lock().await;
        if consumers.contains_key(queue) {
            log_debug!("queue {queue} already has a consumer");
            return Ok(());
        }

        let link = self.inner.current_link().await.ok_or(RpcError::NotConnected)?;
        link.consume(queue, consumer.clone()).await?;

        log_info!("consuming queue {queue}");
        consumers.insert(queue.to_string(), consumer);
        Ok(())
    }

    /// Close the channel and connection. Idempotent.
    pub async fn close(&self) -> Result<()> {
        // ---
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(handle) = lock_ignore_poison(&self.inner.supervisor).take() {
            handle.abort();
        }

        let result = self.inner.drop_link().await;
        self.inner.set_state(ConnectionState::Disconnected);
        log_info!("broker connection closed");
        result
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Observe connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the manager reaches `target`, for at most `timeout`.
    ///
    /// Returns `true` if the state was reached.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        // ---
        let mut rx = self.watch_state();
        tokio::time::timeout(timeout, rx.wait_for(|state| *state == target))
            .await
            .map(|res| res.is_ok())
            .unwrap_or(false)
    }

    /// Reconnect attempts made since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    /// Calls awaiting a reply on this manager's reply queue.
    pub fn replies(&self) -> &CorrelationRegistry {
        &self.inner.replies
    }

    fn ensure_supervisor(&self) {
        // ---
        let Some(lost_rx) = lock_ignore_poison(&self.inner.lost_rx).take() else {
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(supervise(weak, lost_rx));
        *lock_ignore_poison(&self.inner.supervisor) = Some(handle);
    }
}

/// Supervisor loop: turns link-loss reports into reconnect procedures.
async fn supervise(inner: Weak<Inner>, mut lost_rx: mpsc::UnboundedReceiver<LinkLost>) {
    // ---
    while let Some(lost) = lost_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };

        if inner.closed.load(Ordering::SeqCst) {
            break;
        }

        if lost.generation != inner.generation.load(Ordering::SeqCst) {
            log_debug!("ignoring loss report from replaced link #{}", lost.generation);
            continue;
        }

        log_warn!("broker link lost: {}", lost.reason);
        inner.handle_disconnect().await;
    }

    log_debug!("connection supervisor stopped");
}

impl Inner {
    async fn current_link(&self) -> Option<LinkPtr> {
        self.link.read().await.clone()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Queue a loss report for the current link generation.
    fn report_loss(&self, reason: String) {
        // ---
        let generation = self.generation.load(Ordering::SeqCst);
        LossNotifier::new(generation, self.lost_tx.clone()).notify(reason);
    }

    /// Open a link, declare topology, re-attach consumers, then install it.
    async fn try_connect(&self) -> Result<()> {
        // ---
        let mut consumers = self.consumers.lock().await;

        self.set_state(ConnectionState::Connecting);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let notifier = LossNotifier::new(generation, self.lost_tx.clone());

        let link = match self.connector.open(notifier).await {
            Ok(link) => link,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        if let Err(e) = attach(&link, &self.topology, &consumers).await {
            close_quietly(&link).await;
            self.set_state(ConnectionState::Disconnected);
            return Err(e);
        }

        let previous = self.link.write().await.replace(link);
        if let Some(previous) = previous {
            close_quietly(&previous).await;
        }

        // Consumer table stays locked until the new link is visible.
        drop(consumers);

        self.attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        log_info!("connected to broker (link #{generation})");
        Ok(())
    }

    /// Bounded, fixed-interval reconnect procedure.
    async fn handle_disconnect(&self) {
        // ---
        if let Some(link) = self.link.write().await.take() {
            close_quietly(&link).await;
        }
        self.set_state(ConnectionState::Disconnected);

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            let attempt = self.attempts.load(Ordering::SeqCst);
            if attempt >= self.policy.max_attempts {
                log_error!(
                    "max reconnection attempts ({}) reached, giving up",
                    self.policy.max_attempts
                );
                self.set_state(ConnectionState::Disconnected);
                return;
            }

            let attempt = attempt + 1;
            self.attempts.store(attempt, Ordering::SeqCst);
            self.set_state(ConnectionState::Connecting);
            log_warn!(
                "reconnecting in {:?} (attempt {attempt}/{})",
                self.policy.interval,
                self.policy.max_attempts
            );

            tokio::time::sleep(self.policy.interval).await;

            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            match self.try_connect().await {
                Ok(()) => return,
                Err(e) => log_warn!("reconnect attempt {attempt} failed: {e}"),
            }
        }
    }

    async fn drop_link(&self) -> Result<()> {
        // ---
        let link = self.link.write().await.take();
        match link {
            Some(link) => match tokio::time::timeout(CLOSE_GRACE, link.close()).await {
                Ok(result) => result,
                Err(_) => Err(RpcError::Connection("timed out closing link".into())),
            },
            None => Ok(()),
        }
    }
}

async fn attach(
    link: &LinkPtr,
    topology: &Topology,
    consumers: &HashMap<String, ConsumerPtr>,
) -> Result<()> {
    // ---
    link.declare(topology).await?;
    for (queue, consumer) in consumers {
        link.consume(queue, consumer.clone()).await?;
        log_debug!("re-attached consumer for {queue}");
    }
    Ok(())
}

async fn close_quietly(link: &LinkPtr) {
    // ---
    match tokio::time::timeout(CLOSE_GRACE, link.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(_e)) => log_debug!("closing stale link: {_e}"),
        Err(_) => log_debug!("closing stale link timed out"),
    }
}
