//! Correlated request/response waiters keyed by request ID.
//!
//! A bus implementation registers a waiter before sending a request and then
//! awaits it with a deadline. The transport side calls
//! [`PendingRequests::complete`] for every response it receives. Exactly one
//! waiter is woken per request ID; a response that arrives after its waiter
//! timed out finds nothing and is discarded.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cmdbridge_types::{BridgeError, MessageEnvelope};
use tokio::sync::oneshot;
use tracing::debug;

struct Waiter {
    ticket: u64,
    tx: oneshot::Sender<MessageEnvelope>,
}

/// Table of in-flight requests.
///
/// The internal lock is only taken to insert or remove an entry and is never
/// held across an `.await`.
#[derive(Default)]
pub struct PendingRequests {
    waiters: Mutex<HashMap<String, Waiter>>,
    next_ticket: AtomicU64,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `request_id`.
    ///
    /// Fails with [`BridgeError::Transport`] when the ID is empty or already
    /// has a request in flight.
    pub fn register(&self, request_id: &str) -> Result<PendingResponse<'_>, BridgeError> {
        if request_id.is_empty() {
            return Err(BridgeError::Transport(
                "request ID is required to correlate a response".to_string(),
            ));
        }
        let (tx, rx) = oneshot::channel();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let mut waiters = self.lock();
        if waiters.contains_key(request_id) {
            return Err(BridgeError::Transport(format!(
                "request '{request_id}' is already in flight"
            )));
        }
        waiters.insert(request_id.to_string(), Waiter { ticket, tx });
        Ok(PendingResponse {
            table: self,
            request_id: request_id.to_string(),
            ticket,
            rx,
        })
    }

    /// Hand `response` to the waiter registered for its request ID.
    ///
    /// Returns `false` when nobody is waiting (unknown or timed-out request).
    pub fn complete(&self, response: MessageEnvelope) -> bool {
        let waiter = self.lock().remove(&response.request_id);
        match waiter {
            Some(waiter) => {
                let request_id = response.request_id.clone();
                if waiter.tx.send(response).is_err() {
                    debug!(request_id = %request_id, "waiter dropped before response was delivered");
                    return false;
                }
                true
            }
            None => {
                debug!(request_id = %response.request_id, "discarding response with no pending request");
                false
            }
        }
    }

    /// Number of requests currently awaiting a response.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Waiter>> {
        self.waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, request_id: &str, ticket: u64) {
        let mut waiters = self.lock();
        if waiters.get(request_id).is_some_and(|w| w.ticket == ticket) {
            waiters.remove(request_id);
        }
    }
}

/// A registered waiter. Dropping it unregisters the request.
pub struct PendingResponse<'a> {
    table: &'a PendingRequests,
    request_id: String,
    ticket: u64,
    rx: oneshot::Receiver<MessageEnvelope>,
}

impl PendingResponse<'_> {
    /// Wait for the correlated response for at most `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<MessageEnvelope, BridgeError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(BridgeError::Transport(format!(
                "response channel for request '{}' closed",
                self.request_id
            ))),
            Err(_) => Err(BridgeError::Timeout {
                request_id: self.request_id.clone(),
                after: timeout,
            }),
        }
    }
}

impl Drop for PendingResponse<'_> {
    fn drop(&mut self) {
        self.table.release(&self.request_id, self.ticket);
    }
}
