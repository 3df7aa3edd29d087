//! Outbound request queue.
//!
//! Holds requests as two conceptual runs: a prefix of urgent requests
//! ordered by creation time, followed by normal requests in arrival order.
//! A single worker task drains the head, paces each send through the
//! connection's rate limiter, and hands the request to the transport.

use crate::connection::Connection;
use crate::limiter::RateLimiter;
use crate::request::Request;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long the worker idles when the queue is empty.
const EMPTY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Ordered outbound queue with a rate-limited worker.
pub struct RequestQueue {
    queue: Mutex<VecDeque<Request>>,
    limiter: RateLimiter,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RequestQueue {
    pub fn new(messages_per_second: u32) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            limiter: RateLimiter::new(messages_per_second),
            worker: tokio::sync::Mutex::new(None),
        }
    }

    /// Inserts a request without blocking the caller.
    ///
    /// Urgent requests join the urgent prefix after every urgent request
    /// created no later than themselves; normal requests append to the tail.
    pub fn enqueue(&self, mut request: Request, urgent: bool) {
        request.urgent = request.urgent || urgent;
        let mut queue = self.queue.lock();
        if request.urgent {
            let pos = queue
                .iter()
                .take_while(|queued| queued.urgent && queued.created_at <= request.created_at)
                .count();
            queue.insert(pos, request);
        } else {
            queue.push_back(request);
        }
    }

    /// Number of requests waiting to be sent.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    fn pop(&self) -> Option<Request> {
        self.queue.lock().pop_front()
    }

    /// Starts the processing worker. Called by the transport on connect.
    pub(crate) async fn start(self: &Arc<Self>, conn: Arc<Connection>, shutdown: CancellationToken) {
        let handle = tokio::spawn(self.clone().run(conn, shutdown));
        *self.worker.lock().await = Some(handle);
    }

    /// Stops the worker and awaits its exit. Queued requests are dropped,
    /// which resolves their completion slots with no reply.
    pub(crate) async fn stop(&self) {
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
        self.queue.lock().clear();
    }

    async fn run(self: Arc<Self>, conn: Arc<Connection>, shutdown: CancellationToken) {
        tracing::debug!("request queue worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let request = match self.pop() {
                Some(request) => request,
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(EMPTY_POLL_INTERVAL) => {}
                    }
                    continue;
                }
            };

            if !self.limiter.acquire(&shutdown).await {
                // Shutdown while blocked on the limiter; dropping the
                // request resolves its completion slot with no reply.
                break;
            }

            let message_id = request.message_id;
            if let Err(err) = conn.send(request).await {
                // The send path has already failed the completion slot; no
                // automatic retry, that policy belongs to the caller.
                tracing::debug!(message_id, error = %err, "send failed");
                conn.report_error(&err);
            }
        }
        tracing::debug!("request queue worker stopped");
    }
}
