//! Pending-call registry.
//!
//! Tracks locally-initiated calls until they settle. Every entry settles
//! exactly once, through exactly one of: a matching response, its timeout
//! (or an explicit cancel), or a bulk drain when the connection goes away.
//! Settlement removes the entry from the map under the lock, so whichever
//! path gets there first wins and every later attempt finds nothing.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::envelope::{CorrelationId, ErrorDetail};
use crate::error::BridgeError;

type Outcome = Result<Value, BridgeError>;

/// Counters describing what the registry has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub registered: u64,
    pub resolved: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub drained: u64,
    /// Responses for ids we issued that had already settled (duplicates,
    /// or answers arriving after a timeout).
    pub late_responses: u64,
    /// Responses for ids we never issued.
    pub unmatched_responses: u64,
}

/// Result of trying to settle an entry from a peer response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The entry was pending and is now settled.
    Settled,
    /// The id was issued here but has already settled.
    Late,
    /// The id was never issued here.
    Unmatched,
}

struct PendingCall {
    procedure: String,
    created_at: DateTime<Utc>,
    timeout: Duration,
    reply: oneshot::Sender<Outcome>,
    timer: Option<JoinHandle<()>>,
}

impl PendingCall {
    fn finish(mut self, id: CorrelationId, outcome: Outcome) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if self.reply.send(outcome).is_err() {
            debug!("Caller for {} ({}) stopped waiting", id, self.procedure);
        }
    }

    fn elapsed(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or_default()
    }
}

struct RegistryState {
    next_id: u64,
    entries: HashMap<CorrelationId, PendingCall>,
    stats: RegistryStats,
}

impl RegistryState {
    /// Next id not currently registered. Id 0 is never issued.
    fn allocate_id(&mut self) -> CorrelationId {
        loop {
            let id = CorrelationId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    fn classify_stray(&mut self, id: CorrelationId, kind: &str) -> Settlement {
        if id.0 != 0 && id.0 < self.next_id {
            self.stats.late_responses += 1;
            warn!("Dropping late {} for {}: call already settled", kind, id);
            Settlement::Late
        } else {
            self.stats.unmatched_responses += 1;
            warn!("Dropping {} for {}: no such call was issued", kind, id);
            Settlement::Unmatched
        }
    }
}

/// Registry of outbound calls awaiting a result.
pub struct PendingCalls {
    state: Mutex<RegistryState>,
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                next_id: 1,
                entries: HashMap::new(),
                stats: RegistryStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a call and start its timeout timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(
        self: &Arc<Self>,
        procedure: &str,
        timeout: Duration,
    ) -> (CorrelationId, PendingReply) {
        let (tx, rx) = oneshot::channel();

        let mut state = self.lock();
        let id = state.allocate_id();

        // The timer needs the lock to expire, so it cannot observe the map
        // before the entry below is inserted.
        let registry: Weak<Self> = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(registry) = registry.upgrade() {
                registry.expire(id);
            }
        });

        state.entries.insert(
            id,
            PendingCall {
                procedure: procedure.to_string(),
                created_at: Utc::now(),
                timeout,
                reply: tx,
                timer: Some(timer),
            },
        );
        state.stats.registered += 1;
        drop(state);

        debug!("Registered {} ({}) with timeout {:?}", id, procedure, timeout);

        let reply = PendingReply {
            id,
            procedure: procedure.to_string(),
            rx,
        };
        (id, reply)
    }

    /// Settle an entry with the peer's result.
    pub fn resolve(&self, id: CorrelationId, value: Value) -> Settlement {
        let mut state = self.lock();
        let Some(call) = state.entries.remove(&id) else {
            return state.classify_stray(id, "response");
        };
        state.stats.resolved += 1;
        drop(state);

        debug!("Resolved {} ({}) after {:?}", id, call.procedure, call.elapsed());
        call.finish(id, Ok(value));
        Settlement::Settled
    }

    /// Settle an entry with the peer's error.
    pub fn reject(&self, id: CorrelationId, detail: ErrorDetail) -> Settlement {
        let mut state = self.lock();
        let Some(call) = state.entries.remove(&id) else {
            return state.classify_stray(id, "error-response");
        };
        state.stats.rejected += 1;
        drop(state);

        debug!("Rejected {} ({}): {}", id, call.procedure, detail.message);
        let error = BridgeError::from_detail(&call.procedure, detail);
        call.finish(id, Err(error));
        Settlement::Settled
    }

    /// Settle an entry with `Timeout` if it is still pending.
    pub fn expire(&self, id: CorrelationId) -> bool {
        let mut state = self.lock();
        let Some(mut call) = state.entries.remove(&id) else {
            return false;
        };
        state.stats.timed_out += 1;
        drop(state);

        // Expiry runs on the timer task itself
        call.timer = None;
        warn!("Call {} ({}) timed out after {:?}", id, call.procedure, call.timeout);
        let timeout = call.timeout;
        call.finish(id, Err(BridgeError::Timeout(timeout)));
        true
    }

    /// Give up on a pending call now, exactly as if its timeout had elapsed.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        let mut state = self.lock();
        let Some(call) = state.entries.remove(&id) else {
            return false;
        };
        state.stats.cancelled += 1;
        drop(state);

        let elapsed = call.elapsed();
        info!("Cancelled {} ({}) after {:?}", id, call.procedure, elapsed);
        call.finish(id, Err(BridgeError::Timeout(elapsed)));
        true
    }

    /// Settle one pending call with a locally produced error.
    pub fn fail(&self, id: CorrelationId, error: BridgeError) -> bool {
        let mut state = self.lock();
        let Some(call) = state.entries.remove(&id) else {
            return false;
        };
        state.stats.rejected += 1;
        drop(state);

        debug!("Failed {} ({}): {}", id, call.procedure, error);
        call.finish(id, Err(error));
        true
    }

    /// Settle every pending call with `error` and clear the registry.
    pub fn drain_all(&self, error: BridgeError) -> usize {
        let mut state = self.lock();
        let drained = std::mem::take(&mut state.entries);
        state.stats.drained += drained.len() as u64;
        drop(state);

        let count = drained.len();
        if count > 0 {
            info!("Settling {} pending call(s): {}", count, error);
        }
        for (id, call) in drained {
            call.finish(id, Err(error.clone()));
        }
        count
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.lock().entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        self.lock().stats
    }
}

/// Completion future for one registered call.
///
/// Resolves to the peer's result or to the error that settled the call.
pub struct PendingReply {
    id: CorrelationId,
    procedure: String,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingReply {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn procedure(&self) -> &str {
        &self.procedure
    }
}

impl Future for PendingReply {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(BridgeError::ConnectionLost(
                    "pending call was discarded".to_string(),
                ))
            })
        })
    }
}
