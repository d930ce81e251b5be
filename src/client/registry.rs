use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::{
    // ---
    log_debug,
    log_warn,
    CorrelationId,
    ResponseEnvelope,
    Result,
    RpcError,
};

/// Final value of one call: the result reference, or why it failed.
pub type CallOutcome = Result<String>;

/// What `resolve` did with an inbound reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The reply was terminal and settled its call.
    Settled,
    /// The reply was not terminal; the call is still waiting.
    Pending,
    /// No call is pending under this id; the reply was dropped.
    Unknown,
}

/// One outstanding call, owned by the registry until it settles.
struct PendingCall {
    created_at: Instant,
    timeout: Duration,
    slot: oneshot::Sender<CallOutcome>,
    timer: JoinHandle<()>,
}

impl PendingCall {
    /// Consume the call: stop its timer and hand `outcome` to the waiter.
    fn settle(self, id: &CorrelationId, outcome: CallOutcome) {
        // ---
        self.timer.abort();
        log_debug!(
            "settled {id} after {:?} (timeout {:?}): {}",
            self.created_at.elapsed(),
            self.timeout,
            if outcome.is_ok() { "ok" } else { "failed" }
        );
        // Receiver gone means the caller stopped waiting; nothing to deliver.
        let _ = self.slot.send(outcome);
    }
}

type CallMap = HashMap<CorrelationId, PendingCall>;

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Exactly-once matching of replies to outstanding calls.
///
/// Every registered call leaves the map through exactly one path: a terminal
/// reply ([`resolve`](Self::resolve)), its timer firing, or
/// [`cancel`](Self::cancel). All three remove the entry under the same lock
/// before settling it, so whichever path gets there first wins and the others
/// find nothing to do.
///
/// The lock is a plain `std::sync::Mutex` and is never held across an await.
#[derive(Clone, Default)]
pub struct CorrelationRegistry {
    calls: Arc<Mutex<CallMap>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending call and arm its timeout.
    ///
    /// Returns the receiver the caller awaits. The receiver yields the outcome
    /// once; if the call is cancelled the sender is dropped instead.
    ///
    /// Must be called from within a tokio runtime, since the timer is a task.
    ///
    /// # Errors
    ///
    /// [`RpcError::DuplicateCorrelationId`] if `id` is already pending.
    pub fn register(
        &self,
        id: CorrelationId,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<CallOutcome>> {
        // ---
        let mut calls = lock_ignore_poison(&self.calls);
        if calls.contains_key(&id) {
            return Err(RpcError::DuplicateCorrelationId(id));
        }

        let (slot, rx) = oneshot::channel();
        let timer = self.arm_timer(id.clone(), timeout);

        calls.insert(
            id,
            PendingCall {
                created_at: Instant::now(),
                timeout,
                slot,
                timer,
            },
        );

        Ok(rx)
    }

    fn arm_timer(&self, id: CorrelationId, timeout: Duration) -> JoinHandle<()> {
        // ---
        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if registry.settle(&id, Err(RpcError::Timeout(timeout))) {
                log_warn!("call {id} timed out after {timeout:?}");
            }
        })
    }

    /// Apply an inbound reply to the call pending under `id`.
    pub fn resolve(&self, id: &CorrelationId, response: &ResponseEnvelope) -> Resolution {
        // ---
        let call = {
            let mut calls = lock_ignore_poison(&self.calls);
            if !calls.contains_key(id) {
                return Resolution::Unknown;
            }
            match response.outcome() {
                Some(outcome) => calls.remove(id).map(|call| (call, outcome)),
                None => return Resolution::Pending,
            }
        };

        match call {
            Some((call, outcome)) => {
                call.settle(id, outcome);
                Resolution::Settled
            }
            None => Resolution::Unknown,
        }
    }

    /// Settle the call under `id` with `outcome`, if it is still pending.
    ///
    /// Returns `true` if this call did the settling.
    pub fn settle(&self, id: &CorrelationId, outcome: CallOutcome) -> bool {
        // ---
        let call = lock_ignore_poison(&self.calls).remove(id);
        match call {
            Some(call) => {
                call.settle(id, outcome);
                true
            }
            None => false,
        }
    }

    /// Remove the call under `id` without a value.
    ///
    /// The waiter observes its channel closing. Returns `false` if nothing was
    /// pending, which makes repeated cancels harmless.
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        // ---
        let call = lock_ignore_poison(&self.calls).remove(id);
        match call {
            Some(call) => {
                call.timer.abort();
                log_debug!("cancelled {id} after {:?}", call.created_at.elapsed());
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        lock_ignore_poison(&self.calls).contains_key(id)
    }

    /// Number of pending calls.
    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.calls).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
