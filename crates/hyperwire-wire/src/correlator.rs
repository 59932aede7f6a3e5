//! Request/response correlation.
//!
//! The [`Correlator`] owns the table of in-flight requests. Each entry is
//! created when a request is handed to the transport and resolved exactly
//! once: by a matching response, by its deadline, by a transport failure,
//! by cancellation, or by shutdown. Removing an entry from the table under
//! its lock is the only way to resolve it, so a late response and an
//! expiring deadline can never both reach the caller.

use crate::error::RpcError;
use crate::message::{CorrelationId, Envelope, Response};
use crate::transport::Transport;
use hyperwire_types::Address;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

type ReplySlot = oneshot::Sender<Result<Vec<u8>, RpcError>>;

/// An outstanding call awaiting its response.
#[derive(Debug)]
struct PendingRequest {
    target: Address,
    payload: Vec<u8>,
    timeout: Duration,
    deadline: Instant,
    reply: ReplySlot,
}

impl PendingRequest {
    fn resolve(self, result: Result<Vec<u8>, RpcError>) {
        // The receiver is gone only if the caller stopped waiting.
        let _ = self.reply.send(result);
    }

    fn timeout_error(&self, id: CorrelationId) -> RpcError {
        RpcError::Timeout {
            id,
            after: self.timeout,
        }
    }
}

#[derive(Debug)]
struct PendingTable {
    pending: Mutex<HashMap<CorrelationId, PendingRequest>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl PendingTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CorrelationId, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolve `id` with a timeout if it is still pending.
    fn expire(&self, id: CorrelationId) -> bool {
        let mut pending = self.lock();
        match pending.remove(&id) {
            Some(entry) => {
                debug!(id = %id, target = %entry.target, "Request timed out");
                let err = entry.timeout_error(id);
                entry.resolve(Err(err));
                true
            }
            None => false,
        }
    }

    /// Drop `id` without resolving it; the caller no longer cares.
    fn cancel(&self, id: CorrelationId) -> bool {
        let removed = self.lock().remove(&id);
        if let Some(entry) = &removed {
            debug!(id = %id, target = %entry.target, "Request cancelled");
        }
        removed.is_some()
    }

    fn sweep(&self, now: Instant) -> usize {
        let mut pending = self.lock();
        let expired: Vec<CorrelationId> = pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(entry) = pending.remove(id) {
                debug!(id = %id, target = %entry.target, "Sweeper expired request");
                let err = entry.timeout_error(*id);
                entry.resolve(Err(err));
            }
        }
        expired.len()
    }
}

/// Tracks in-flight requests by correlation id.
///
/// Cloning is cheap; clones share one pending table.
#[derive(Clone)]
pub struct Correlator {
    our: Address,
    table: Arc<PendingTable>,
    transport: Arc<dyn Transport>,
}

impl Correlator {
    /// Create a correlator that sends as `our` through `transport`.
    pub fn new(our: Address, transport: Arc<dyn Transport>) -> Self {
        Self {
            our,
            table: Arc::new(PendingTable {
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
            transport,
        }
    }

    /// The address requests are sent from.
    pub fn our(&self) -> &Address {
        &self.our
    }

    fn next_id(&self) -> CorrelationId {
        CorrelationId(self.table.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn ensure_open(&self) -> Result<(), RpcError> {
        if self.table.closed.load(Ordering::Acquire) {
            return Err(RpcError::Shutdown);
        }
        Ok(())
    }

    /// Send a request and wait for its response or its deadline.
    pub async fn send(
        &self,
        target: Address,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, RpcError> {
        self.start_request(target, payload, timeout)
            .await?
            .wait()
            .await
    }

    /// Register a pending request and hand it to the transport.
    ///
    /// Returns once the transport accepted the envelope. A transport failure
    /// removes the entry and is returned immediately. A transport that has
    /// not accepted the envelope by the deadline yields a timeout.
    pub async fn start_request(
        &self,
        target: Address,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<ResponseHandle, RpcError> {
        self.ensure_open()?;

        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        {
            let mut pending = self.table.lock();
            pending.insert(
                id,
                PendingRequest {
                    target: target.clone(),
                    payload: payload.clone(),
                    timeout,
                    deadline,
                    reply: tx,
                },
            );
        }

        // Owns the entry from here on: dropping it before resolution cancels.
        let handle = ResponseHandle {
            id,
            deadline,
            rx: Some(rx),
            table: Arc::clone(&self.table),
        };

        debug!(id = %id, target = %target, bytes = payload.len(), "Sending request");
        let envelope = Envelope::request(id, self.our.clone(), target, payload, true);
        // The hand-off counts against the request's own deadline.
        match tokio::time::timeout_at(deadline, self.transport.deliver_outbound(envelope)).await {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(e)) => {
                warn!(id = %id, error = %e, "Transport rejected request");
                self.table.cancel(id);
                Err(RpcError::Transport(e))
            }
            Err(_elapsed) => {
                warn!(id = %id, after = ?timeout, "Transport did not accept request before its deadline");
                self.table.cancel(id);
                Err(RpcError::Timeout { id, after: timeout })
            }
        }
    }

    /// Send a request without registering for its response.
    ///
    /// Any response that later arrives for this call is unmatched and
    /// discarded.
    pub async fn send_fire_and_forget(
        &self,
        target: Address,
        payload: Vec<u8>,
    ) -> Result<(), RpcError> {
        self.ensure_open()?;

        let id = self.next_id();
        debug!(id = %id, target = %target, bytes = payload.len(), "Sending fire-and-forget request");
        let envelope = Envelope::request(id, self.our.clone(), target, payload, false);
        self.transport.deliver_outbound(envelope).await?;
        Ok(())
    }

    /// Route a response from `source` to the request waiting on `id`.
    ///
    /// Returns `true` if a caller received `result`. Responses for unknown
    /// or already-resolved ids, or arriving past their deadline, are
    /// discarded. A response from a node other than the request's target is
    /// discarded and the request stays pending.
    pub fn on_response(&self, id: CorrelationId, source: &Address, result: Response) -> bool {
        let mut pending = self.table.lock();
        if let Some(entry) = pending.get(&id) {
            if entry.target.node() != source.node() {
                warn!(
                    id = %id,
                    target = %entry.target,
                    source = %source,
                    "Discarding response from a node the request was not sent to"
                );
                return false;
            }
        }
        match pending.remove(&id) {
            Some(entry) if Instant::now() >= entry.deadline => {
                debug!(id = %id, target = %entry.target, "Discarding response past its deadline");
                let err = entry.timeout_error(id);
                entry.resolve(Err(err));
                false
            }
            Some(entry) => {
                debug!(id = %id, target = %entry.target, ok = result.is_ok(), "Response matched");
                entry.resolve(result.map_err(RpcError::Remote));
                true
            }
            None => {
                debug!(id = %id, "Discarding unmatched response");
                false
            }
        }
    }

    /// Resolve every request whose deadline has passed with a timeout.
    pub fn sweep_expired(&self) -> usize {
        self.table.sweep(Instant::now())
    }

    /// Periodically sweep expired requests until shutdown.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let table: Weak<PendingTable> = Arc::downgrade(&self.table);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(table) = table.upgrade() else { break };
                if table.closed.load(Ordering::Acquire) {
                    break;
                }
                let expired = table.sweep(Instant::now());
                if expired > 0 {
                    debug!(expired, "Swept expired requests");
                }
            }
        })
    }

    /// Fail every outstanding request with [`RpcError::Shutdown`] and refuse
    /// new ones. Returns the number of requests that were outstanding.
    pub fn shutdown(&self) -> usize {
        self.table.closed.store(true, Ordering::Release);
        let drained: Vec<(CorrelationId, PendingRequest)> = self.table.lock().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            debug!(id = %id, target = %entry.target, "Failing request on shutdown");
            entry.resolve(Err(RpcError::Shutdown));
        }
        count
    }

    /// Whether [`Correlator::shutdown`] has run.
    pub fn is_shut_down(&self) -> bool {
        self.table.closed.load(Ordering::Acquire)
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.table.lock().len()
    }

    /// Whether `id` is still awaiting a response.
    pub fn is_pending(&self, id: CorrelationId) -> bool {
        self.table.lock().contains_key(&id)
    }

    /// Payload of a pending request, if it is still outstanding.
    pub fn pending_payload(&self, id: CorrelationId) -> Option<Vec<u8>> {
        self.table.lock().get(&id).map(|entry| entry.payload.clone())
    }
}

/// Caller's side of one pending request.
///
/// Dropping the handle before it resolves removes the request from the
/// table.
#[derive(Debug)]
pub struct ResponseHandle {
    id: CorrelationId,
    deadline: Instant,
    rx: Option<oneshot::Receiver<Result<Vec<u8>, RpcError>>>,
    table: Arc<PendingTable>,
}

impl ResponseHandle {
    /// Correlation id carried by the request and its response.
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Instant after which [`ResponseHandle::wait`] gives up.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the response, or for the deadline to pass.
    pub async fn wait(mut self) -> Result<Vec<u8>, RpcError> {
        let Some(mut rx) = self.rx.take() else {
            return Err(RpcError::Shutdown);
        };

        let received = match tokio::time::timeout_at(self.deadline, &mut rx).await {
            Ok(received) => received,
            Err(_elapsed) => {
                // Whoever removes the entry resolves it; if a response won the
                // race, its result is already in the channel.
                self.table.expire(self.id);
                (&mut rx).await
            }
        };

        match received {
            Ok(result) => result,
            Err(_) => Err(RpcError::Shutdown),
        }
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        self.table.cancel(self.id);
    }
}
