//! Outbound HTTP transaction pool.
//!
//! Sessions originate request/response transactions (today: OAuth token
//! validation). Each transaction gets a monotonic id, runs on its own
//! runtime task, and reports back through the completion the caller
//! supplied. The pool only tracks what is in flight; completions whose
//! owning session has already gone are the caller's problem to abandon.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::StatusCode;
use tracing::debug;

/// Response of a completed transaction.
#[derive(Debug, Clone)]
pub struct Reply {
    /// HTTP status of the response.
    pub status: StatusCode,
    /// Response body, decoded as text.
    pub body: String,
}

/// Pool of in-flight outbound transactions sharing one HTTP client.
pub struct ClientTransactions {
    client: reqwest::Client,
    next_id: AtomicU64,
    in_flight: Arc<Mutex<HashSet<u64>>>,
}

impl ClientTransactions {
    /// Builds the pool with the configured per-request timeout.
    pub fn new(request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            next_id: AtomicU64::new(1),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// The shared HTTP client, for building requests.
    #[must_use]
    pub const fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Issues `request` and hands the outcome to `complete` on a runtime
    /// task. Returns the transaction id.
    pub fn post<C>(&self, request: reqwest::RequestBuilder, complete: C) -> u64
    where
        C: FnOnce(u64, Result<Reply, reqwest::Error>) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.in_flight.lock().insert(id);
        let in_flight = Arc::clone(&self.in_flight);
        tokio::spawn(async move {
            debug!(id, "transaction started");
            let outcome = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    response.text().await.map(|body| Reply { status, body })
                }
                Err(send_error) => Err(send_error),
            };
            in_flight.lock().remove(&id);
            match &outcome {
                Ok(reply) => debug!(id, status = %reply.status, "transaction reply"),
                Err(transaction_error) => {
                    debug!(id, error = %transaction_error, "transaction failed");
                }
            }
            complete(id, outcome);
        });
        id
    }

    /// Number of transactions started but not yet completed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Forgets in-flight bookkeeping during shutdown. Outstanding tasks
    /// drain on their own; their completions find no session and abandon.
    pub fn demobilize(&self) {
        self.in_flight.lock().clear();
    }
}
