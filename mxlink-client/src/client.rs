//! High-level matrix client.
//!
//! `MatrixClient` wraps a [`Connection`] with typed helpers for the common
//! control operations. Callers needing raw access can still build a
//! [`Request`] by hand and pass it through [`MatrixClient::request`].

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use crate::request::Request;
use mxlink_protocol::message::{id, Crosspoint, DeviceInfo, PortGain, PortLabel};
use mxlink_protocol::{Body, DecoderRegistry, Reply};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Port-list query mode byte: request labels.
const PORT_QUERY_LABELS: u8 = 0x00;
/// Port-list query mode byte: request gains.
const PORT_QUERY_GAINS: u8 = 0x01;

/// High-level client for one MXP matrix.
#[derive(Clone)]
pub struct MatrixClient {
    conn: Arc<Connection>,
}

impl MatrixClient {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
        }
    }

    /// Builds a client with a caller-supplied decoder registry, for
    /// deployments that register additional message decoders.
    pub fn with_registry(config: ConnectionConfig, registry: DecoderRegistry) -> Self {
        Self {
            conn: Arc::new(Connection::with_registry(config, registry)),
        }
    }

    /// Connects, walking the configured port range. Returns `Ok(true)` on
    /// success and `Ok(false)` when every port failed.
    pub async fn connect(&self) -> Result<bool, ClientError> {
        self.conn.connect(CancellationToken::new()).await
    }

    /// Like [`connect`](Self::connect) but abortable through `cancel`.
    pub async fn connect_with_cancel(
        &self,
        cancel: CancellationToken,
    ) -> Result<bool, ClientError> {
        self.conn.connect(cancel).await
    }

    pub async fn disconnect(&self) {
        self.conn.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Port of the active connection, if any.
    pub fn current_port(&self) -> Option<u16> {
        self.conn.current_port()
    }

    /// Connection state changes (true = connected).
    pub fn subscribe_state(&self) -> broadcast::Receiver<bool> {
        self.conn.subscribe_state()
    }

    /// Every decoded inbound message, solicited or not.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Reply> {
        self.conn.subscribe_messages()
    }

    /// Transport-level error reports.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<String> {
        self.conn.subscribe_errors()
    }

    /// Queues a fire-and-forget request.
    pub fn send(&self, request: Request) {
        let urgent = request.urgent;
        self.conn.enqueue(request, urgent);
    }

    /// Queues a request and awaits its correlated reply, using the
    /// configured request timeout.
    pub async fn request(&self, request: Request) -> Result<Reply, ClientError> {
        if !self.conn.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let urgent = request.urgent;
        let timeout = self.conn.request_timeout();
        self.conn
            .enqueue_and_wait(request, urgent, timeout)
            .await
            .ok_or(ClientError::Timeout)
    }

    /// Checks the matrix is alive.
    pub async fn ping(&self) -> Result<(), ClientError> {
        let request = Request::new(id::PING, Vec::new()).expecting(id::PONG);
        self.request(request).await.map(|_| ())
    }

    /// Queries device identity and port count.
    pub async fn device_info(&self) -> Result<DeviceInfo, ClientError> {
        let request = Request::new(id::DEVICE_INFO, Vec::new()).expecting(id::DEVICE_INFO);
        let reply = self.request(request).await?;
        match reply.body {
            Some(Body::DeviceInfo(info)) => Ok(info),
            _ => Err(ClientError::UnexpectedReply {
                message_id: reply.message_id,
            }),
        }
    }

    /// Connects or disconnects one crosspoint. The matrix acknowledges with
    /// the resulting crosspoint state.
    pub async fn set_crosspoint(
        &self,
        source: u16,
        destination: u16,
        connected: bool,
    ) -> Result<Crosspoint, ClientError> {
        let mut payload = Vec::with_capacity(5);
        payload.extend_from_slice(&source.to_be_bytes());
        payload.extend_from_slice(&destination.to_be_bytes());
        payload.push(connected as u8);

        // Control actions jump the queue ahead of routine polling.
        let request = Request::new(id::CROSSPOINT, payload)
            .expecting(id::CROSSPOINT)
            .urgent();
        let reply = self.request(request).await?;
        match reply.body {
            Some(Body::Crosspoint(state)) => Ok(state),
            _ => Err(ClientError::UnexpectedReply {
                message_id: reply.message_id,
            }),
        }
    }

    /// Queries the labels of every port.
    pub async fn port_labels(&self) -> Result<Vec<PortLabel>, ClientError> {
        let request =
            Request::new(id::PORT_LIST, vec![PORT_QUERY_LABELS]).expecting(id::PORT_LIST);
        let reply = self.request(request).await?;
        match reply.body {
            Some(Body::PortLabels(labels)) => Ok(labels),
            _ => Err(ClientError::UnexpectedReply {
                message_id: reply.message_id,
            }),
        }
    }

    /// Queries the gain settings of every port.
    pub async fn port_gains(&self) -> Result<Vec<PortGain>, ClientError> {
        let request = Request::new(id::PORT_LIST, vec![PORT_QUERY_GAINS]).expecting(id::PORT_LIST);
        let reply = self.request(request).await?;
        match reply.body {
            Some(Body::PortGains(gains)) => Ok(gains),
            _ => Err(ClientError::UnexpectedReply {
                message_id: reply.message_id,
            }),
        }
    }
}
