//! Companion server core: shared state, WebSocket handshake and dispatch,
//! and the push API the game uses to talk to its companions.
//!
//! One axum server carries both the `/ws` message endpoint and the REST API
//! under [`REST_PREFIX`], so the port it binds to is the `httpServerPort`
//! announced in every `ConnectResponse`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use companion_proto::codec;
use companion_proto::handshake::{self, PROTOCOL_VERSION};
use companion_proto::message::{ClientId, CompanionMessage, Envelope, MAX_MESSAGE_SIZE};
use companion_proto::permission::{Permission, PermissionSet};
use companion_proto::rest::REST_PREFIX;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::api;
use crate::backend::{GameBackend, InMemoryGameBackend};
use crate::events::{CompanionEvent, EVENT_CHANNEL_CAPACITY};
use crate::permissions::{PermissionStore, StoreError};
use crate::registry::{ClientRegistry, ClientSummary, ConnectionToken, Outbound, SendError};

/// How long a socket writer may take to flush after its client is gone.
const WRITER_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Tunables of the message endpoint.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Largest accepted text frame in bytes. Larger frames are dropped.
    pub max_message_size: usize,
    /// Maximum number of simultaneously connected clients.
    pub max_clients: usize,
    /// A connection with no inbound frame for this long is closed.
    pub idle_timeout: Duration,
    /// Time allowed between upgrade and `ConnectRequest`.
    pub handshake_timeout: Duration,
    /// Grants allocated to a client seen for the first time.
    pub default_grants: PermissionSet,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            max_clients: 16,
            idle_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(5),
            default_grants: PermissionSet::new(),
        }
    }
}

/// State shared by every socket task and REST handler.
pub struct CompanionState {
    registry: ClientRegistry,
    permissions: PermissionStore,
    backend: Arc<dyn GameBackend>,
    events: broadcast::Sender<CompanionEvent>,
    settings: ServerSettings,
    http_server_port: AtomicU16,
    /// Held across capacity check, grant load and registration, and by
    /// every grant change, so the registry never holds a stale grant set.
    admission: Mutex<()>,
}

impl Default for CompanionState {
    fn default() -> Self {
        Self::new(
            ServerSettings::default(),
            PermissionStore::in_memory(),
            Arc::new(InMemoryGameBackend::new()),
        )
    }
}

impl CompanionState {
    /// Creates the server state from its parts.
    #[must_use]
    pub fn new(
        settings: ServerSettings,
        permissions: PermissionStore,
        backend: Arc<dyn GameBackend>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry: ClientRegistry::new(),
            permissions,
            backend,
            events,
            settings,
            http_server_port: AtomicU16::new(0),
            admission: Mutex::new(()),
        }
    }

    /// Connected clients.
    #[must_use]
    pub const fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Persisted grants.
    #[must_use]
    pub const fn permission_store(&self) -> &PermissionStore {
        &self.permissions
    }

    /// The game model.
    #[must_use]
    pub fn backend(&self) -> &dyn GameBackend {
        self.backend.as_ref()
    }

    /// Endpoint tunables.
    #[must_use]
    pub const fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Port the server is bound to, or 0 before it starts.
    #[must_use]
    pub fn http_server_port(&self) -> u16 {
        self.http_server_port.load(Ordering::Relaxed)
    }

    /// Records the bound port announced to clients.
    pub fn set_http_server_port(&self, port: u16) {
        self.http_server_port.store(port, Ordering::Relaxed);
    }

    /// Subscribes to companion events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CompanionEvent> {
        self.events.subscribe()
    }

    /// Publishes an event. Having no subscriber is fine.
    pub(crate) fn publish(&self, event: CompanionEvent) {
        let _ = self.events.send(event);
    }

    /// Snapshots of all connected clients.
    pub async fn connected_clients(&self) -> Vec<ClientSummary> {
        self.registry.list().await
    }

    /// Pushes a message to one connected client.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] if the client is not connected.
    pub async fn send_to_client(
        &self,
        client_id: &ClientId,
        message: CompanionMessage,
    ) -> Result<(), SendError> {
        self.registry.send(client_id, Envelope::new(message)).await
    }

    /// Pushes a message to every connected client and returns how many
    /// accepted it.
    pub async fn broadcast(&self, message: CompanionMessage) -> usize {
        self.registry.broadcast(&Envelope::new(message)).await
    }

    /// Grants permissions to a client, connected or not.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the change cannot be persisted.
    pub async fn grant_permissions(
        &self,
        client_id: &ClientId,
        permissions: impl IntoIterator<Item = Permission>,
    ) -> Result<PermissionSet, StoreError> {
        let _admission = self.admission.lock().await;
        let updated = self.permissions.grant(client_id, permissions)?;
        self.apply_permissions(client_id, &updated).await;
        Ok(updated)
    }

    /// Revokes permissions from a client, connected or not.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the change cannot be persisted.
    pub async fn revoke_permissions(
        &self,
        client_id: &ClientId,
        permissions: impl IntoIterator<Item = Permission>,
    ) -> Result<PermissionSet, StoreError> {
        let _admission = self.admission.lock().await;
        let updated = self.permissions.revoke(client_id, permissions)?;
        self.apply_permissions(client_id, &updated).await;
        Ok(updated)
    }

    /// Closes a client's connection. Returns `false` if it is not connected.
    pub async fn disconnect(&self, client_id: &ClientId) -> bool {
        self.registry.close(client_id).await
    }

    async fn apply_permissions(&self, client_id: &ClientId, permissions: &PermissionSet) {
        if self
            .registry
            .set_permissions(client_id, permissions.clone())
            .await
        {
            let push = CompanionMessage::Permissions {
                permissions: permissions.to_vec(),
            };
            if let Err(e) = self.send_to_client(client_id, push).await {
                tracing::warn!(client_id = %client_id, error = %e, "failed to push permissions");
            }
        }
        tracing::info!(client_id = %client_id, permissions = ?permissions, "permissions changed");
        self.publish(CompanionEvent::PermissionsChanged {
            client_id: client_id.clone(),
            permissions: permissions.clone(),
        });
    }
}

/// Identity claimed in a `ConnectRequest`.
struct ConnectRequest {
    protocol_version: u32,
    client_name: String,
    client_id: ClientId,
}

/// A registered connection and the grants it was admitted with.
struct Admission {
    token: ConnectionToken,
    permissions: PermissionSet,
    replaced: bool,
}

impl CompanionState {
    /// Checks a `ConnectRequest` and registers the client, or returns the
    /// human-readable reason for refusing it.
    async fn admit(
        &self,
        request: &ConnectRequest,
        sender: mpsc::UnboundedSender<Outbound>,
    ) -> Result<Admission, String> {
        handshake::validate_connect_request(
            request.protocol_version,
            &request.client_name,
            &request.client_id,
            PROTOCOL_VERSION,
        )
        .map_err(|e| e.to_string())?;

        let _admission = self.admission.lock().await;
        let max = self.settings.max_clients;
        if self.registry.len().await >= max && !self.registry.contains(&request.client_id).await {
            return Err(format!(
                "the game already has the maximum of {max} companion apps connected"
            ));
        }

        let permissions = self
            .permissions
            .get_or_allocate(&request.client_id, &self.settings.default_grants)
            .map_err(|e| {
                tracing::error!(client_id = %request.client_id, error = %e, "failed to load permissions");
                "the game could not load the permissions of this companion app".to_string()
            })?;

        let (token, replaced) = self
            .registry
            .register(&request.client_id, &request.client_name, permissions.clone(), sender)
            .await;
        Ok(Admission {
            token,
            permissions,
            replaced,
        })
    }
}

/// Handles an upgraded WebSocket connection for a single companion.
///
/// The connection lifecycle:
/// 1. Wait for a `ConnectRequest` within the handshake timeout.
/// 2. Validate it; reject with an `errorMessage` or register the client.
/// 3. Answer with a `ConnectResponse`.
/// 4. Dispatch inbound messages until close, error or idle timeout.
/// 5. Unregister the client.
pub async fn handle_socket(socket: WebSocket, state: Arc<CompanionState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let request = match tokio::time::timeout(
        state.settings.handshake_timeout,
        wait_for_connect_request(&mut ws_receiver),
    )
    .await
    {
        Ok(Some(request)) => request,
        Ok(None) => {
            tracing::warn!("connection closed before handshake");
            return;
        }
        Err(_) => {
            tracing::warn!("handshake timed out");
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
    };
    let client_id = request.client_id.clone();
    let client_name = request.client_name.clone();

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let Admission {
        token,
        permissions,
        replaced,
    } = match state.admit(&request, tx).await {
        Ok(admission) => admission,
        Err(reason) => {
            reject(&mut ws_sender, &state, request, reason).await;
            return;
        }
    };
    if replaced {
        tracing::info!(client_id = %client_id, "replaced existing connection");
    }

    let response = CompanionMessage::ConnectResponse {
        client_id: client_id.clone(),
        client_name: client_name.clone(),
        error_message: None,
        http_server_port: state.http_server_port(),
        permissions: permissions.to_vec(),
        available_modifiers: state.backend.available_modifiers(),
    };
    if let Err(e) = send_envelope(&mut ws_sender, &Envelope::new(response)).await {
        tracing::error!(client_id = %client_id, error = %e, "failed to send ConnectResponse");
        state.registry.unregister(&client_id, token).await;
        return;
    }

    tracing::info!(client_id = %client_id, client_name = %client_name, "client connected");
    state.publish(CompanionEvent::ClientConnected {
        client_id: client_id.clone(),
        client_name: client_name.clone(),
    });

    // Writer: drains the outbound channel until the registry drops it.
    let writer_client_id = client_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Message(envelope) => {
                    if let Err(e) = send_envelope(&mut ws_sender, &envelope).await {
                        tracing::warn!(client_id = %writer_client_id, error = %e, "WebSocket write failed");
                        return;
                    }
                }
                Outbound::Close => break,
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    let reader_state = Arc::clone(&state);
    let reader_client_id = client_id.clone();
    let mut read_task = tokio::spawn(async move {
        read_loop(&mut ws_receiver, &reader_state, &reader_client_id, &client_name).await
    });

    let mut writer_done = false;
    let reason = tokio::select! {
        result = &mut read_task => result.unwrap_or_else(|e| format!("reader task failed: {e}")),
        _ = &mut write_task => {
            writer_done = true;
            read_task.abort();
            "closed by server".to_string()
        }
    };

    let removed = state.registry.unregister(&client_id, token).await;
    if !writer_done && tokio::time::timeout(WRITER_SHUTDOWN_GRACE, &mut write_task).await.is_err() {
        write_task.abort();
    }

    if removed {
        state.backend.forget_client(&client_id);
        tracing::info!(client_id = %client_id, reason = %reason, "client disconnected");
        state.publish(CompanionEvent::ClientDisconnected { client_id, reason });
    } else {
        tracing::debug!(client_id = %client_id, "superseded connection closed");
    }
}

/// Waits for the first message, expecting a `ConnectRequest`.
///
/// Ping and pong frames are skipped. Anything else ends the handshake.
async fn wait_for_connect_request(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<ConnectRequest> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                return match codec::decode(text.as_str()) {
                    Ok(Envelope {
                        message:
                            CompanionMessage::ConnectRequest {
                                protocol_version,
                                client_name,
                                client_id,
                            },
                        ..
                    }) => Some(ConnectRequest {
                        protocol_version,
                        client_name,
                        client_id,
                    }),
                    Ok(other) => {
                        tracing::warn!(message_type = %other.message_type(), "expected ConnectRequest");
                        None
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to decode handshake message");
                        None
                    }
                };
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Binary(_) | Message::Close(_) => return None,
        }
    }
    None
}

/// Sends a refusing `ConnectResponse` and closes the socket.
async fn reject(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    state: &CompanionState,
    request: ConnectRequest,
    reason: String,
) {
    tracing::warn!(
        client_id = %request.client_id,
        client_name = %request.client_name,
        reason = %reason,
        "connect request rejected"
    );
    let response = CompanionMessage::ConnectResponse {
        client_id: request.client_id.clone(),
        client_name: request.client_name.clone(),
        error_message: Some(reason.clone()),
        http_server_port: state.http_server_port(),
        permissions: Vec::new(),
        available_modifiers: Vec::new(),
    };
    if let Err(e) = send_envelope(ws_sender, &Envelope::new(response)).await {
        tracing::debug!(error = %e, "failed to send rejection");
    }
    let _ = ws_sender.send(Message::Close(None)).await;
    state.publish(CompanionEvent::ConnectRejected {
        client_id: request.client_id,
        client_name: request.client_name,
        reason,
    });
}

/// Reads frames until the connection ends and returns why it ended.
async fn read_loop(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    state: &CompanionState,
    client_id: &ClientId,
    client_name: &str,
) -> String {
    loop {
        let frame = match tokio::time::timeout(state.settings.idle_timeout, receiver.next()).await {
            Err(_) => return "idle timeout".to_string(),
            Ok(None) => return "connection closed".to_string(),
            Ok(Some(Err(e))) => return format!("transport error: {e}"),
            Ok(Some(Ok(frame))) => frame,
        };
        match frame {
            Message::Text(text) => {
                handle_text_message(state, client_id, client_name, text.as_str()).await;
            }
            Message::Binary(data) => {
                tracing::warn!(client_id = %client_id, len = data.len(), "dropping binary frame");
            }
            Message::Close(_) => return "closed by client".to_string(),
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

/// Decodes and dispatches one text frame from a connected client.
///
/// Every failure here is soft: the frame is dropped and the connection
/// stays open.
async fn handle_text_message(
    state: &CompanionState,
    client_id: &ClientId,
    client_name: &str,
    text: &str,
) {
    if text.len() > state.settings.max_message_size {
        tracing::warn!(
            client_id = %client_id,
            size = text.len(),
            max = state.settings.max_message_size,
            "dropping oversized message"
        );
        return;
    }

    let envelope = match codec::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(client_id = %client_id, error = %e, "dropping undecodable message");
            return;
        }
    };
    tracing::debug!(client_id = %client_id, message_type = %envelope.message_type(), "received message");

    match envelope.message {
        CompanionMessage::StillAliveRequest => {
            let reply = Envelope::new(CompanionMessage::StillAliveResponse);
            if let Err(e) = state.registry.send(client_id, reply).await {
                tracing::debug!(client_id = %client_id, error = %e, "failed to answer keep-alive");
            }
        }
        CompanionMessage::BeatPitchEvents { events } => {
            state
                .backend
                .record_microphone_data(client_id, client_name, events.clone());
            state.publish(CompanionEvent::MessageReceived {
                client_id: client_id.clone(),
                message: CompanionMessage::BeatPitchEvents { events },
            });
        }
        CompanionMessage::ConnectRequest { .. } => {
            tracing::warn!(client_id = %client_id, "ignoring ConnectRequest from connected client");
        }
        other => {
            tracing::warn!(
                client_id = %client_id,
                message_type = %other.message_type(),
                "ignoring server-only message type"
            );
        }
    }
}

/// Encodes an envelope and sends it as a text frame.
async fn send_envelope(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    envelope: &Envelope,
) -> Result<(), String> {
    let text = codec::encode(envelope).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

/// Builds the router carrying `/ws` and the REST API.
pub fn router(state: Arc<CompanionState>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .nest(REST_PREFIX, api::routes())
        .with_state(state)
}

/// Starts the server with default state on the given address and returns
/// the bound address and a join handle.
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub async fn start_server(
    addr: &str,
) -> Result<(SocketAddr, JoinHandle<()>), Box<dyn std::error::Error + Send + Sync>> {
    start_server_with_state(addr, Arc::new(CompanionState::default())).await
}

/// Starts the server with a pre-built [`CompanionState`].
///
/// The bound port is recorded as the state's `httpServerPort`.
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<CompanionState>,
) -> Result<(SocketAddr, JoinHandle<()>), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    state.set_http_server_port(bound_addr.port());

    let app = router(state);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "companion server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<CompanionState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
