//! Connection management.
//!
//! Owns the TCP socket for one matrix, performs sequential port-failover
//! connection attempts, runs the background read loop feeding the frame
//! assembler, and correlates decoded replies back to waiting callers.

use crate::error::ClientError;
use crate::queue::RequestQueue;
use crate::request::Request;
use crate::{DEFAULT_PORT_END, DEFAULT_PORT_START};
use mxlink_protocol::{decode_reply, DecoderRegistry, FrameAssembler, Reply};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Default outbound rate limit in messages per second.
pub const DEFAULT_MESSAGES_PER_SECOND: u32 = 20;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Matrix hostname or address.
    pub host: String,
    /// First port to try. May be above or below `port_end`; the scan walks
    /// toward `port_end` one port at a time.
    pub port_start: u16,
    /// Last port to try, inclusive.
    pub port_end: u16,
    /// Per-port connection attempt timeout.
    pub connect_timeout: Duration,
    /// Default timeout for awaited requests.
    pub request_timeout: Duration,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Outbound rate limit shared by all sends on this connection.
    pub messages_per_second: u32,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port_start: DEFAULT_PORT_START,
            port_end: DEFAULT_PORT_END,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            messages_per_second: DEFAULT_MESSAGES_PER_SECOND,
        }
    }

    /// Sets the port range. `start > end` scans downward.
    pub fn with_port_range(mut self, start: u16, end: u16) -> Self {
        self.port_start = start;
        self.port_end = end;
        self
    }

    /// Pins the connection to a single port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port_start = port;
        self.port_end = port;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_rate_limit(mut self, messages_per_second: u32) -> Self {
        self.messages_per_second = messages_per_second;
        self
    }
}

/// Ports to attempt, in order, for a configured range.
pub fn port_sequence(start: u16, end: u16) -> Vec<u16> {
    if start <= end {
        (start..=end).collect()
    } else {
        (end..=start).rev().collect()
    }
}

/// Capacity of the broadcast channels feeding observers.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A connection to one MXP matrix.
pub struct Connection {
    config: ConnectionConfig,
    queue: Arc<RequestQueue>,
    registry: DecoderRegistry,
    /// Write half of the stream (for sending requests).
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Shared frame buffer fed by the read loop.
    assembler: Mutex<FrameAssembler>,
    /// Pending requests keyed by expected reply message id.
    pending: Mutex<HashMap<u16, oneshot::Sender<Reply>>>,
    connected: AtomicBool,
    /// Port of the current connection; 0 when disconnected.
    current_port: AtomicU16,
    /// Cancels the read loop and queue worker of the current connection.
    shutdown: parking_lot::Mutex<CancellationToken>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    state_tx: broadcast::Sender<bool>,
    message_tx: broadcast::Sender<Reply>,
    error_tx: broadcast::Sender<String>,
}

impl Connection {
    /// Creates a new connection (not yet connected) with the built-in
    /// decoder registry.
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_registry(config, DecoderRegistry::with_defaults())
    }

    /// Creates a new connection using a caller-supplied decoder registry.
    pub fn with_registry(config: ConnectionConfig, registry: DecoderRegistry) -> Self {
        let (state_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (message_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (error_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            queue: Arc::new(RequestQueue::new(config.messages_per_second)),
            config,
            registry,
            writer: Mutex::new(None),
            assembler: Mutex::new(FrameAssembler::new()),
            pending: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            current_port: AtomicU16::new(0),
            shutdown: parking_lot::Mutex::new(CancellationToken::new()),
            read_task: Mutex::new(None),
            state_tx,
            message_tx,
            error_tx,
        }
    }

    /// Subscribes to connection state changes (true = connected).
    pub fn subscribe_state(&self) -> broadcast::Receiver<bool> {
        self.state_tx.subscribe()
    }

    /// Subscribes to every decoded inbound reply, solicited or not.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Reply> {
        self.message_tx.subscribe()
    }

    /// Subscribes to transport-level error reports.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<String> {
        self.error_tx.subscribe()
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Port of the active connection, if any.
    pub fn current_port(&self) -> Option<u16> {
        match self.current_port.load(Ordering::SeqCst) {
            0 => None,
            port => Some(port),
        }
    }

    /// Number of requests awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.try_lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Number of requests queued for sending.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Connects to the matrix, walking the configured port range in order
    /// and stopping at the first port that accepts.
    ///
    /// Returns `Ok(true)` once connected, `Ok(false)` when every port in the
    /// range failed, and `Err(ClientError::Cancelled)` only when the caller's
    /// token fired. Individual attempt failures are logged and reported to
    /// error observers, never raised.
    pub async fn connect(self: &Arc<Self>, cancel: CancellationToken) -> Result<bool, ClientError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(true);
        }

        for port in port_sequence(self.config.port_start, self.config.port_end) {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            tracing::debug!(host = %self.config.host, port, "attempting connection");

            let attempt = tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                result = tokio::time::timeout(
                    self.config.connect_timeout,
                    TcpStream::connect((self.config.host.as_str(), port)),
                ) => result,
            };

            let stream = match attempt {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    tracing::debug!(port, error = %err, "connection attempt failed");
                    continue;
                }
                Err(_) => {
                    tracing::debug!(port, "connection attempt timed out");
                    continue;
                }
            };

            self.establish(stream, port).await;
            return Ok(true);
        }

        tracing::debug!(
            start = self.config.port_start,
            end = self.config.port_end,
            "all configured ports exhausted"
        );
        Ok(false)
    }

    async fn establish(self: &Arc<Self>, stream: TcpStream, port: u16) {
        stream.set_nodelay(true).ok();
        let (reader, writer) = stream.into_split();

        *self.writer.lock().await = Some(writer);
        self.assembler.lock().await.clear();
        self.pending.lock().await.clear();

        let shutdown = CancellationToken::new();
        *self.shutdown.lock() = shutdown.clone();

        self.current_port.store(port, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);

        let read_task = tokio::spawn(self.clone().read_loop(reader, shutdown.clone()));
        *self.read_task.lock().await = Some(read_task);
        self.queue.start(self.clone(), shutdown).await;

        let _ = self.state_tx.send(true);
        tracing::debug!(port, "connected");
    }

    /// Continuous socket read loop: append to the shared frame buffer,
    /// assemble, decode, dispatch. Frames are dispatched in exactly the
    /// order their bytes arrived.
    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf, shutdown: CancellationToken) {
        tracing::debug!("read loop started");
        let mut scratch = vec![0u8; self.config.read_buffer_size];

        loop {
            let read = tokio::select! {
                _ = shutdown.cancelled() => break,
                read = reader.read(&mut scratch) => read,
            };

            let n = match read {
                Ok(0) => {
                    tracing::debug!("remote closed connection");
                    break;
                }
                Ok(n) => n,
                Err(err) => {
                    tracing::debug!(error = %err, "read error");
                    let _ = self.error_tx.send(err.to_string());
                    break;
                }
            };

            // Append and assemble under the lock; decode with it released.
            let frames = {
                let mut assembler = self.assembler.lock().await;
                assembler.extend(&scratch[..n]);
                let mut frames = Vec::new();
                while let Some(frame) = assembler.next_frame() {
                    frames.push(frame);
                }
                frames
            };

            for frame in frames {
                match decode_reply(&frame, &self.registry) {
                    Ok(reply) => self.dispatch(reply).await,
                    // Framing and decode problems never unwind the loop.
                    Err(err) => tracing::warn!(error = %err, "undecodable frame"),
                }
            }
        }

        // Mirror disconnect: stop the queue worker and fail every waiter
        // promptly instead of letting them sit out their timeouts against a
        // dead peer. Dropping the queued requests and pending senders
        // resolves their completion slots with no reply.
        shutdown.cancel();
        self.queue.stop().await;
        self.pending.lock().await.clear();
        self.current_port.store(0, Ordering::SeqCst);

        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.state_tx.send(false);
        }
        tracing::debug!("read loop exited");
    }

    async fn dispatch(&self, reply: Reply) {
        if let Some(waiter) = self.pending.lock().await.remove(&reply.message_id) {
            tracing::debug!(message_id = reply.message_id, "correlated reply");
            let _ = waiter.send(reply.clone());
        }
        // Every reply reaches observers, matched or not.
        let _ = self.message_tx.send(reply);
    }

    /// Writes one request to the socket, recording its pending-reply
    /// expectation before the write completes so a racing reply is never
    /// missed.
    pub(crate) async fn send(&self, mut request: Request) -> Result<(), ClientError> {
        let frame = request.encode()?;
        let expect = request.expect_reply;

        if let Some(reply_id) = expect {
            if let Some(waiter) = request.completion.take() {
                let displaced = self.pending.lock().await.insert(reply_id, waiter);
                if displaced.is_some() {
                    // Overwrite policy: the displaced waiter resolves with
                    // no reply as its sender drops here.
                    tracing::debug!(reply_id, "displaced pending request for same reply id");
                }
            }
        }

        let result = {
            let mut guard = self.writer.lock().await;
            match guard.as_mut() {
                None => Err(ClientError::NotConnected),
                Some(writer) => writer.write_all(&frame).await.map_err(ClientError::Io),
            }
        };

        if result.is_err() {
            if let Some(reply_id) = expect {
                self.pending.lock().await.remove(&reply_id);
            }
        }
        result
    }

    /// Inserts a request into the outbound queue; never blocks.
    pub fn enqueue(&self, request: Request, urgent: bool) {
        self.queue.enqueue(request, urgent);
    }

    /// Enqueues a request and awaits its correlated reply.
    ///
    /// Returns `None` if the timeout elapses, the send fails, or the
    /// connection goes away first. A reply arriving after the timeout is
    /// still delivered to message observers but cannot resolve this call.
    pub async fn enqueue_and_wait(
        &self,
        mut request: Request,
        urgent: bool,
        timeout: Duration,
    ) -> Option<Reply> {
        let (waiter, slot) = oneshot::channel();
        request.completion = Some(waiter);
        let expect = request.expect_reply;
        if expect.is_none() {
            tracing::warn!(
                message_id = request.message_id,
                "awaiting a request that expects no reply"
            );
        }
        self.queue.enqueue(request, urgent);

        match tokio::time::timeout(timeout, slot).await {
            Ok(Ok(reply)) => Some(reply),
            // Sender dropped: send failure, displacement, or teardown.
            Ok(Err(_)) => None,
            Err(_) => {
                if let Some(reply_id) = expect {
                    let mut pending = self.pending.lock().await;
                    // The entry under this id may belong to another live
                    // caller (ours may still be queued, or was displaced).
                    // Only reap an entry whose receiver is gone; ours is,
                    // once the timeout drops it.
                    if pending.get(&reply_id).is_some_and(|w| w.is_closed()) {
                        pending.remove(&reply_id);
                    }
                }
                None
            }
        }
    }

    /// Default awaited-request timeout from the configuration.
    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }

    /// Closes the connection: stops the read loop and queue worker, closes
    /// the socket, clears the frame buffer and pending table, and notifies
    /// observers. Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        self.shutdown.lock().cancel();

        if let Some(task) = self.read_task.lock().await.take() {
            let _ = task.await;
        }
        self.queue.stop().await;

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        self.assembler.lock().await.clear();
        // Dropping the senders resolves any remaining waiters with no reply.
        self.pending.lock().await.clear();
        self.current_port.store(0, Ordering::SeqCst);

        if was_connected {
            let _ = self.state_tx.send(false);
        }
        tracing::debug!("disconnected");
    }

    /// Reports a transport-level failure to error observers.
    pub(crate) fn report_error(&self, err: &ClientError) {
        let _ = self.error_tx.send(err.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mxlink_protocol::message::id;
    use mxlink_protocol::{encode_frame, Body};
    use tokio::net::TcpListener;

    #[test]
    fn test_port_sequence_descending() {
        let ports = port_sequence(52020, 52001);
        assert_eq!(ports.len(), 20);
        assert_eq!(ports.first(), Some(&52020));
        assert_eq!(ports.last(), Some(&52001));
        assert!(ports.windows(2).all(|w| w[0] == w[1] + 1));
    }

    #[test]
    fn test_port_sequence_ascending() {
        let ports = port_sequence(7000, 7003);
        assert_eq!(ports, vec![7000, 7001, 7002, 7003]);
    }

    #[test]
    fn test_port_sequence_single() {
        assert_eq!(port_sequence(9000, 9000), vec![9000]);
    }

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::new("matrix.local");
        assert_eq!(config.port_start, DEFAULT_PORT_START);
        assert_eq!(config.port_end, DEFAULT_PORT_END);
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.messages_per_second, DEFAULT_MESSAGES_PER_SECOND);
    }

    #[test]
    fn test_config_buffer_clamping() {
        let config = ConnectionConfig::new("m").with_read_buffer_size(100);
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);

        let config = ConnectionConfig::new("m").with_read_buffer_size(10 * 1024 * 1024);
        assert_eq!(config.read_buffer_size, MAX_READ_BUFFER_SIZE);
    }

    /// Spawns a scripted matrix on an ephemeral port. `respond` maps each
    /// inbound (message id, payload) to an optional response frame, written
    /// after `reply_delay`.
    async fn spawn_matrix<F>(reply_delay: Duration, mut respond: F) -> u16
    where
        F: FnMut(u16, &[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let mut assembler = FrameAssembler::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                assembler.extend(&buf[..n]);
                while let Some(frame) = assembler.next_frame() {
                    let message_id = u16::from_be_bytes([frame[4], frame[5]]);
                    let payload = &frame[7..frame.len() - 2];
                    if let Some(response) = respond(message_id, payload) {
                        tokio::time::sleep(reply_delay).await;
                        if socket.write_all(&response).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        port
    }

    fn echo_matrix(message_id: u16, payload: &[u8]) -> Option<Vec<u8>> {
        match message_id {
            id::PING => Some(encode_frame(id::PONG, 0, &[]).unwrap().to_vec()),
            id::CROSSPOINT => Some(encode_frame(id::CROSSPOINT, 0, payload).unwrap().to_vec()),
            id::DEVICE_INFO => {
                let mut info = b"TEST-MTX\0\0\0\0\0\0\0\0".to_vec();
                info.extend_from_slice(&[1, 0]);
                info.extend_from_slice(&16u16.to_be_bytes());
                Some(encode_frame(id::DEVICE_INFO, 0, &info).unwrap().to_vec())
            }
            _ => None,
        }
    }

    fn connection_to(port: u16) -> Arc<Connection> {
        let config = ConnectionConfig::new("127.0.0.1")
            .with_port(port)
            .with_connect_timeout(Duration::from_secs(1))
            .with_rate_limit(100);
        Arc::new(Connection::new(config))
    }

    #[tokio::test]
    async fn test_connect_and_ping() {
        let port = spawn_matrix(Duration::ZERO, echo_matrix).await;
        let conn = connection_to(port);

        assert!(conn.connect(CancellationToken::new()).await.unwrap());
        assert!(conn.is_connected());
        assert_eq!(conn.current_port(), Some(port));

        let request = Request::new(id::PING, Vec::new()).expecting(id::PONG);
        let reply = conn
            .enqueue_and_wait(request, false, Duration::from_secs(2))
            .await
            .expect("ping should be answered");
        assert_eq!(reply.message_id, id::PONG);
        assert_eq!(reply.body, Some(Body::Pong));

        conn.disconnect().await;
        assert!(!conn.is_connected());
        assert_eq!(conn.current_port(), None);
    }

    #[tokio::test]
    async fn test_connect_exhausted_reports_false() {
        // Grab an ephemeral port, then free it so the attempt is refused.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let conn = connection_to(port);
        let connected = conn.connect(CancellationToken::new()).await.unwrap();
        assert!(!connected);
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_connect_cancelled() {
        let conn = connection_to(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = conn.connect(cancel).await;
        assert!(matches!(result, Err(ClientError::Cancelled)));
    }

    #[tokio::test]
    async fn test_correlation_resolves_matching_waiter() {
        let port = spawn_matrix(Duration::ZERO, echo_matrix).await;
        let conn = connection_to(port);
        conn.connect(CancellationToken::new()).await.unwrap();

        let ping = Request::new(id::PING, Vec::new()).expecting(id::PONG);
        let info = Request::new(id::DEVICE_INFO, Vec::new()).expecting(id::DEVICE_INFO);

        let (pong, device_info) = tokio::join!(
            conn.enqueue_and_wait(ping, false, Duration::from_secs(2)),
            conn.enqueue_and_wait(info, false, Duration::from_secs(2)),
        );

        assert_eq!(pong.unwrap().message_id, id::PONG);
        let device_info = device_info.unwrap();
        assert_eq!(device_info.message_id, id::DEVICE_INFO);
        let Some(Body::DeviceInfo(decoded)) = device_info.body else {
            panic!("expected device info body");
        };
        assert_eq!(decoded.name, "TEST-MTX");

        conn.disconnect().await;
    }

    #[tokio::test]
    async fn test_timeout_then_late_reply_does_not_double_resolve() {
        // The matrix answers pings, but 300 ms too late for the caller.
        let port = spawn_matrix(Duration::from_millis(300), echo_matrix).await;
        let conn = connection_to(port);
        conn.connect(CancellationToken::new()).await.unwrap();

        let mut messages = conn.subscribe_messages();

        let request = Request::new(id::PING, Vec::new()).expecting(id::PONG);
        let reply = conn
            .enqueue_and_wait(request, false, Duration::from_millis(100))
            .await;
        assert!(reply.is_none());
        assert_eq!(conn.pending_count(), 0);

        // The late reply still reaches observers.
        let observed = tokio::time::timeout(Duration::from_secs(2), messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(observed.message_id, id::PONG);

        conn.disconnect().await;
    }

    #[tokio::test]
    async fn test_duplicate_pending_id_overwrites() {
        // Replies arrive 200 ms late, so both requests are in flight and
        // the second displaces the first in the pending table.
        let port = spawn_matrix(Duration::from_millis(200), echo_matrix).await;
        let conn = connection_to(port);
        conn.connect(CancellationToken::new()).await.unwrap();

        let first = Request::new(id::PING, Vec::new()).expecting(id::PONG);
        let second = Request::new(id::PING, Vec::new()).expecting(id::PONG);

        let (first, second) = tokio::join!(
            conn.enqueue_and_wait(first, false, Duration::from_secs(2)),
            conn.enqueue_and_wait(second, false, Duration::from_secs(2)),
        );

        // Exactly one waiter wins; the displaced one resolves with none.
        assert!(first.is_some() != second.is_some());

        conn.disconnect().await;
    }

    #[tokio::test]
    async fn test_timeout_does_not_reap_other_callers_entry() {
        // Replies take 400 ms; one token per second, so the second request
        // is still queued behind the limiter when its timeout fires. Its
        // cleanup must not reap the first caller's pending entry.
        let port = spawn_matrix(Duration::from_millis(400), echo_matrix).await;
        let config = ConnectionConfig::new("127.0.0.1")
            .with_port(port)
            .with_rate_limit(1);
        let conn = Arc::new(Connection::new(config));
        conn.connect(CancellationToken::new()).await.unwrap();

        let sent = Request::new(id::PING, Vec::new()).expecting(id::PONG);
        let queued = Request::new(id::PING, Vec::new()).expecting(id::PONG);

        let (sent, queued) = tokio::join!(
            conn.enqueue_and_wait(sent, false, Duration::from_secs(2)),
            async {
                // Let the first request claim the only token.
                tokio::time::sleep(Duration::from_millis(50)).await;
                conn.enqueue_and_wait(queued, false, Duration::from_millis(150))
                    .await
            },
        );

        assert!(queued.is_none());
        assert_eq!(sent.expect("first caller keeps its reply").message_id, id::PONG);

        conn.disconnect().await;
    }

    #[tokio::test]
    async fn test_remote_close_fails_waiters_promptly() {
        // A matrix that reads one frame and hangs up without answering.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await;
        });

        let conn = connection_to(port);
        let mut state = conn.subscribe_state();
        conn.connect(CancellationToken::new()).await.unwrap();
        assert!(state.recv().await.unwrap());

        let started = std::time::Instant::now();
        let request = Request::new(id::PING, Vec::new()).expecting(id::PONG);
        let reply = conn
            .enqueue_and_wait(request, false, Duration::from_secs(3))
            .await;
        assert!(reply.is_none());
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "waiter should fail as soon as the peer is gone"
        );
        assert!(!state.recv().await.unwrap());
        assert!(!conn.is_connected());
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unsolicited_reply_reaches_observers() {
        let port = spawn_matrix(Duration::ZERO, |message_id, _| {
            // Answer any ping with an alarm nobody asked for.
            (message_id == id::PING).then(|| {
                let mut payload = 3u16.to_be_bytes().to_vec();
                payload.push(0x02); // sync lost
                payload.push(0x01);
                encode_frame(id::ALARM, 0, &payload).unwrap().to_vec()
            })
        })
        .await;

        let conn = connection_to(port);
        conn.connect(CancellationToken::new()).await.unwrap();
        let mut messages = conn.subscribe_messages();

        conn.enqueue(Request::new(id::PING, Vec::new()), false);

        let observed = tokio::time::timeout(Duration::from_secs(2), messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(observed.message_id, id::ALARM);
        assert!(matches!(observed.body, Some(Body::Alarm(_))));

        conn.disconnect().await;
    }

    #[tokio::test]
    async fn test_state_notifications() {
        let port = spawn_matrix(Duration::ZERO, echo_matrix).await;
        let conn = connection_to(port);
        let mut state = conn.subscribe_state();

        conn.connect(CancellationToken::new()).await.unwrap();
        assert!(state.recv().await.unwrap());

        conn.disconnect().await;
        assert!(!state.recv().await.unwrap());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let port = spawn_matrix(Duration::ZERO, echo_matrix).await;
        let conn = connection_to(port);

        conn.disconnect().await; // never connected: no-op
        conn.connect(CancellationToken::new()).await.unwrap();
        conn.disconnect().await;
        conn.disconnect().await; // second call: no-op
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let port = spawn_matrix(Duration::ZERO, echo_matrix).await;
        let conn = connection_to(port);

        conn.connect(CancellationToken::new()).await.unwrap();
        conn.disconnect().await;

        let port2 = spawn_matrix(Duration::ZERO, echo_matrix).await;
        let config = ConnectionConfig::new("127.0.0.1")
            .with_port(port2)
            .with_rate_limit(100);
        let conn = Arc::new(Connection::new(config));
        assert!(conn.connect(CancellationToken::new()).await.unwrap());

        let request = Request::new(id::PING, Vec::new()).expecting(id::PONG);
        assert!(conn
            .enqueue_and_wait(request, false, Duration::from_secs(2))
            .await
            .is_some());
        conn.disconnect().await;
    }
}
