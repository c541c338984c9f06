//! Companion-app side of the message link.
//!
//! [`CompanionClient::connect`] opens the WebSocket, runs the
//! `ConnectRequest`/`ConnectResponse` handshake and then hands inbound
//! messages to [`CompanionClient::recv`] through a background reader task.
//! Transport loss is reported, never retried; reconnecting is up to the
//! caller.

use std::sync::Arc;
use std::time::Duration;

use companion_proto::codec::{self, CodecError};
use companion_proto::handshake::{self, ConnectAccepted, HandshakeError, PROTOCOL_VERSION};
use companion_proto::message::{ClientId, CompanionMessage, Envelope};
use companion_proto::permission::PermissionSet;
use companion_proto::session::{ConnectionEvent, ConnectionState};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::rest::RestClient;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSender = futures_util::stream::SplitSink<WsStream, Message>;
type WsReader = futures_util::stream::SplitStream<WsStream>;

/// Errors surfaced by [`CompanionClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// A connection phase did not finish in time.
    #[error("timed out {0}")]
    Timeout(&'static str),
    /// Nothing accepted the connection at the server address.
    #[error("server unreachable: {0}")]
    Unreachable(String),
    /// The server URL cannot be used.
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),
    /// The WebSocket failed for another reason.
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    /// The server refused the handshake; the message is its reason.
    #[error("connection rejected: {0}")]
    Rejected(String),
    /// The server broke the handshake protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The connection is gone.
    #[error("connection closed")]
    ConnectionClosed,
    /// An outbound message could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<HandshakeError> for ClientError {
    fn from(e: HandshakeError) -> Self {
        match e {
            HandshakeError::Rejected(reason) => Self::Rejected(reason),
            HandshakeError::UnexpectedMessage(_) | HandshakeError::ClientIdMismatch { .. } => {
                Self::Protocol(e.to_string())
            }
            HandshakeError::VersionMismatch { .. }
            | HandshakeError::EmptyClientId
            | HandshakeError::EmptyClientName => Self::Rejected(e.to_string()),
        }
    }
}

/// How to reach the game and who to claim to be.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// WebSocket URL of the game's message endpoint, e.g. `ws://host:34567/ws`.
    pub server_url: String,
    /// Name shown in the game.
    pub client_name: String,
    /// Stable identity; grants are keyed by it.
    pub client_id: ClientId,
    /// Limit for opening the WebSocket.
    pub connect_timeout: Duration,
    /// Limit for receiving the `ConnectResponse`.
    pub handshake_timeout: Duration,
    /// Keep-alive period. `None` sends no keep-alives.
    pub still_alive_interval: Option<Duration>,
    /// Capacity of the inbound message channel.
    pub channel_capacity: usize,
}

impl ConnectOptions {
    /// Options with default timeouts.
    pub fn new(
        server_url: impl Into<String>,
        client_name: impl Into<String>,
        client_id: ClientId,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            client_name: client_name.into(),
            client_id,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            still_alive_interval: Some(Duration::from_secs(5)),
            channel_capacity: 256,
        }
    }
}

/// State shared with the background tasks.
struct Shared {
    state: watch::Sender<ConnectionState>,
    permissions: RwLock<PermissionSet>,
}

impl Shared {
    fn advance(&self, event: ConnectionEvent) {
        advance(&self.state, event);
    }

    fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }
}

fn advance(state: &watch::Sender<ConnectionState>, event: ConnectionEvent) {
    state.send_if_modified(|current| match current.transition(event) {
        Ok(next) if next != *current => {
            tracing::debug!(from = %current, to = %next, "connection state changed");
            *current = next;
            true
        }
        Ok(_) => false,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring state event");
            false
        }
    });
}

/// A connected companion.
pub struct CompanionClient {
    server_url: String,
    accepted: ConnectAccepted,
    ws_sender: Arc<Mutex<WsSender>>,
    incoming: Mutex<mpsc::Receiver<CompanionMessage>>,
    shared: Arc<Shared>,
    reader_handle: JoinHandle<()>,
    keep_alive_handle: Option<JoinHandle<()>>,
}

impl CompanionClient {
    /// Connects to the game and completes the handshake.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Timeout`] if connecting or the handshake takes too long.
    /// - [`ClientError::Unreachable`] / [`ClientError::InvalidUrl`] /
    ///   [`ClientError::WebSocket`] if the WebSocket cannot be opened.
    /// - [`ClientError::Rejected`] if the server refuses, including on a
    ///   protocol version mismatch.
    /// - [`ClientError::Protocol`] / [`ClientError::ConnectionClosed`] if the
    ///   server answers with something unusable.
    pub async fn connect(options: &ConnectOptions) -> Result<Self, ClientError> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        advance(&state, ConnectionEvent::ConnectStarted);

        let (ws_sender, ws_reader, accepted) = match handshake(options).await {
            Ok(parts) => parts,
            Err(e) => {
                let event = if matches!(e, ClientError::Rejected(_)) {
                    ConnectionEvent::Rejected
                } else {
                    ConnectionEvent::Closed
                };
                advance(&state, event);
                return Err(e);
            }
        };
        advance(&state, ConnectionEvent::Accepted);
        tracing::info!(
            client_id = %accepted.client_id,
            http_server_port = accepted.http_server_port,
            permissions = ?accepted.permissions,
            "connected to game"
        );

        let shared = Arc::new(Shared {
            state,
            permissions: RwLock::new(accepted.permissions.clone()),
        });
        let ws_sender = Arc::new(Mutex::new(ws_sender));

        let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));
        let reader_handle = tokio::spawn(reader_loop(ws_reader, tx, Arc::clone(&shared)));
        let keep_alive_handle = options.still_alive_interval.map(|interval| {
            tokio::spawn(keep_alive_loop(
                Arc::clone(&ws_sender),
                Arc::clone(&shared),
                interval,
            ))
        });

        Ok(Self {
            server_url: options.server_url.clone(),
            accepted,
            ws_sender,
            incoming: Mutex::new(rx),
            shared,
            reader_handle,
            keep_alive_handle,
        })
    }

    /// Sends a message to the game.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionClosed`] when not connected or when
    /// the write fails, or [`ClientError::Codec`] if encoding fails.
    pub async fn send(&self, message: CompanionMessage) -> Result<(), ClientError> {
        if !self.shared.is_connected() {
            return Err(ClientError::ConnectionClosed);
        }
        let text = codec::encode(&Envelope::new(message))?;
        let mut sender = self.ws_sender.lock().await;
        sender.send(Message::text(text)).await.map_err(|e| {
            tracing::warn!(error = %e, "send failed");
            self.shared.advance(ConnectionEvent::Closed);
            ClientError::ConnectionClosed
        })
    }

    /// Waits for the next message pushed by the game.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionClosed`] once the connection is gone
    /// and every received message has been taken.
    pub async fn recv(&self) -> Result<CompanionMessage, ClientError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(ClientError::ConnectionClosed)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state change, including disconnects.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// This client's identity.
    #[must_use]
    pub const fn client_id(&self) -> &ClientId {
        &self.accepted.client_id
    }

    /// Current grants, updated by `Permissions` pushes.
    #[must_use]
    pub fn permissions(&self) -> PermissionSet {
        self.shared.permissions.read().clone()
    }

    /// Port of the game's REST API.
    #[must_use]
    pub const fn http_server_port(&self) -> u16 {
        self.accepted.http_server_port
    }

    /// Game round modifiers announced at connect time.
    #[must_use]
    pub fn available_modifiers(&self) -> &[String] {
        &self.accepted.available_modifiers
    }

    /// REST client for the game's HTTP API, authenticated as this client.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidUrl`] if the server URL has no host.
    pub fn rest(&self) -> Result<RestClient, ClientError> {
        let url =
            url::Url::parse(&self.server_url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        let host = url
            .host()
            .ok_or_else(|| ClientError::InvalidUrl(format!("{} has no host", self.server_url)))?;
        Ok(RestClient::new(
            format!("http://{host}:{}", self.accepted.http_server_port),
            self.accepted.client_id.clone(),
        ))
    }

    /// Closes the connection.
    pub async fn close(&self) {
        if let Some(handle) = &self.keep_alive_handle {
            handle.abort();
        }
        let mut sender = self.ws_sender.lock().await;
        if let Err(e) = sender.send(Message::Close(None)).await {
            tracing::debug!(error = %e, "close frame not sent");
        }
        self.shared.advance(ConnectionEvent::Closed);
        tracing::info!(client_id = %self.accepted.client_id, "connection closed by client");
    }
}

impl Drop for CompanionClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
        if let Some(handle) = &self.keep_alive_handle {
            handle.abort();
        }
    }
}

/// Opens the WebSocket and runs the handshake.
async fn handshake(
    options: &ConnectOptions,
) -> Result<(WsSender, WsReader, ConnectAccepted), ClientError> {
    let url = options.server_url.as_str();
    let (ws_stream, _response) = tokio::time::timeout(options.connect_timeout, connect_async(url))
        .await
        .map_err(|_| {
            tracing::warn!(url, "WebSocket connect timed out");
            ClientError::Timeout("connecting to server")
        })?
        .map_err(|e| {
            tracing::warn!(url, error = %e, "WebSocket connect failed");
            map_ws_connect_error(e)
        })?;
    let (mut ws_sender, mut ws_reader) = ws_stream.split();

    let request = CompanionMessage::ConnectRequest {
        protocol_version: PROTOCOL_VERSION,
        client_name: options.client_name.clone(),
        client_id: options.client_id.clone(),
    };
    let text = codec::encode(&Envelope::new(request))?;
    ws_sender
        .send(Message::text(text))
        .await
        .map_err(|e| ClientError::WebSocket(format!("failed to send ConnectRequest: {e}")))?;

    let response = tokio::time::timeout(
        options.handshake_timeout,
        wait_for_connect_response(&mut ws_reader),
    )
    .await
    .map_err(|_| {
        tracing::warn!(url, "ConnectResponse timed out");
        ClientError::Timeout("waiting for ConnectResponse")
    })??;

    let accepted =
        handshake::check_connect_response(&response, &options.client_id).map_err(|e| {
            tracing::warn!(error = %e, "handshake failed");
            ClientError::from(e)
        })?;
    Ok((ws_sender, ws_reader, accepted))
}

/// Reads frames until the first message arrives. Ping and pong are skipped.
async fn wait_for_connect_response(ws_reader: &mut WsReader) -> Result<CompanionMessage, ClientError> {
    while let Some(frame) = ws_reader.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                return codec::decode(text.as_str())
                    .map(|envelope| envelope.message)
                    .map_err(|e| ClientError::Protocol(format!("malformed handshake response: {e}")));
            }
            Ok(Message::Close(_)) => return Err(ClientError::ConnectionClosed),
            Ok(Message::Binary(_)) => {
                return Err(ClientError::Protocol(
                    "unexpected binary frame during handshake".to_string(),
                ));
            }
            Ok(_) => {}
            Err(e) => return Err(ClientError::WebSocket(e.to_string())),
        }
    }
    Err(ClientError::ConnectionClosed)
}

/// Background task that decodes inbound frames and forwards messages.
///
/// Undecodable frames are logged and skipped; the connection stays up.
/// Marks the connection closed when the stream ends.
async fn reader_loop(mut ws_reader: WsReader, tx: mpsc::Sender<CompanionMessage>, shared: Arc<Shared>) {
    while let Some(frame) = ws_reader.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let envelope = match codec::decode(text.as_str()) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping undecodable message");
                        continue;
                    }
                };
                let message = match envelope.message {
                    CompanionMessage::StillAliveResponse => {
                        tracing::trace!("keep-alive answered");
                        continue;
                    }
                    CompanionMessage::Permissions { permissions } => {
                        *shared.permissions.write() = permissions.iter().copied().collect();
                        tracing::info!(permissions = ?permissions, "permissions updated");
                        CompanionMessage::Permissions { permissions }
                    }
                    other
                        if other.message_type().sent_by_client()
                            || matches!(other, CompanionMessage::ConnectResponse { .. }) =>
                    {
                        tracing::warn!(message_type = %other.message_type(), "ignoring unexpected message");
                        continue;
                    }
                    other => other,
                };
                tracing::debug!(message_type = %message.message_type(), "received message");
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                tracing::info!("connection closed by server");
                break;
            }
            Ok(Message::Binary(data)) => {
                tracing::warn!(len = data.len(), "dropping binary frame");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket read error");
                break;
            }
        }
    }
    shared.advance(ConnectionEvent::Closed);
    tracing::debug!("reader task exiting");
}

/// Sends `StillAliveRequest` every `interval` while connected.
async fn keep_alive_loop(sender: Arc<Mutex<WsSender>>, shared: Arc<Shared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if !shared.is_connected() {
            break;
        }
        let text = match codec::encode(&Envelope::new(CompanionMessage::StillAliveRequest)) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode keep-alive");
                break;
            }
        };
        if let Err(e) = sender.lock().await.send(Message::text(text)).await {
            tracing::warn!(error = %e, "keep-alive failed");
            shared.advance(ConnectionEvent::Closed);
            break;
        }
    }
}

/// Map a `tokio_tungstenite` connection error to a [`ClientError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> ClientError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err)
            if matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::AddrNotAvailable
            ) =>
        {
            ClientError::Unreachable(io_err.to_string())
        }
        WsError::Url(e) => ClientError::InvalidUrl(e.to_string()),
        WsError::Http(response) => {
            ClientError::WebSocket(format!("HTTP error: status {}", response.status()))
        }
        other => ClientError::WebSocket(other.to_string()),
    }
}
