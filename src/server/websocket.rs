use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use uuid::Uuid;

use crate::server::config::ServerConfig;
use crate::server::error::ServiceError;
use crate::server::messages::MessageRouter;
use crate::server::rooms::RoomRegistry;

pub type ClientId = String;
pub type UserId = String;

/// First frame a client must send. The user id is an opaque identifier issued
/// by the identity service upstream of this process; it is trusted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthMessage {
    pub message_type: String, // "auth"
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub message_type: String, // "auth_response"
    pub success: bool,
    pub user_id: Option<String>,
    pub error: Option<String>,
}

/// Everything after auth: join-pod / pod-message / leave-pod.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    pub action: String,
    pub pod_id: Option<String>,
    pub text: Option<String>,
}

pub struct ClientConnection {
    pub client_id: ClientId,
    pub user_id: UserId,
    pub sender: mpsc::UnboundedSender<Message>,
}

/// Connection and per-room subscription state for the live-room surface.
pub struct PodSocketManager {
    connections: Arc<Mutex<HashMap<ClientId, ClientConnection>>>,
    pod_subscribers: Arc<Mutex<HashMap<String, HashSet<ClientId>>>>,
}

impl PodSocketManager {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            pod_subscribers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub(crate) async fn subscribe(&self, pod_id: &str, client_id: &ClientId) {
        let mut subs = self.pod_subscribers.lock().await;
        subs.entry(pod_id.to_string()).or_default().insert(client_id.clone());
    }

    async fn unsubscribe(&self, pod_id: &str, client_id: &ClientId) {
        let mut subs = self.pod_subscribers.lock().await;
        if let Some(set) = subs.get_mut(pod_id) {
            set.remove(client_id);
            if set.is_empty() {
                subs.remove(pod_id);
            }
        }
    }

    pub async fn send_to_client(&self, client_id: &ClientId, payload: &serde_json::Value) {
        let connections = self.connections.lock().await;
        if let Some(conn) = connections.get(client_id) {
            let _ = conn.sender.send(Message::Text(payload.to_string()));
        }
    }

    /// Fan a payload out to every connected subscriber of a room. Sends are
    /// non-blocking pushes into each client's outbound queue, so a caller
    /// holding a room lock stays quick.
    pub async fn broadcast_to_pod(
        &self,
        pod_id: &str,
        payload: &serde_json::Value,
        exclude: Option<&ClientId>,
    ) {
        let subs = self.pod_subscribers.lock().await;
        let Some(client_ids) = subs.get(pod_id) else {
            return;
        };
        let connections = self.connections.lock().await;
        let text = payload.to_string();
        for client_id in client_ids {
            if exclude == Some(client_id) {
                continue;
            }
            if let Some(conn) = connections.get(client_id) {
                let _ = conn.sender.send(Message::Text(text.clone()));
            }
        }
    }

    /// Handshake: wait for the auth frame (30 s), ack it, then run the
    /// connection until the client goes away.
    pub async fn handle_authenticated_connection(
        self: &Arc<Self>,
        ws_stream: WebSocketStream<tokio::net::TcpStream>,
        registry: Arc<RoomRegistry>,
        router: Arc<MessageRouter>,
        config: ServerConfig,
    ) -> anyhow::Result<()> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let auth_timeout = tokio::time::timeout(
            tokio::time::Duration::from_secs(30),
            ws_receiver.next(),
        )
        .await;

        let auth = match auth_timeout {
            Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<AuthMessage>(&text) {
                Ok(auth) if auth.message_type == "auth" && !auth.user_id.trim().is_empty() => auth,
                _ => {
                    let reply = AuthResponse {
                        message_type: "auth_response".to_string(),
                        success: false,
                        user_id: None,
                        error: Some("Expected an 'auth' frame with a user_id".to_string()),
                    };
                    let _ = ws_sender.send(Message::Text(serde_json::to_string(&reply)?)).await;
                    return Err(anyhow::anyhow!("Invalid auth frame"));
                }
            },
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                debug!("[WS:AUTH] Client closed connection during auth");
                return Ok(());
            }
            Ok(Some(Ok(_))) => {
                return Err(anyhow::anyhow!("Expected text frame during auth"));
            }
            Ok(Some(Err(e))) => {
                return Err(anyhow::anyhow!("WebSocket error during auth: {}", e));
            }
            Err(_) => {
                let reply = AuthResponse {
                    message_type: "auth_response".to_string(),
                    success: false,
                    user_id: None,
                    error: Some("Authentication timeout".to_string()),
                };
                let _ = ws_sender.send(Message::Text(serde_json::to_string(&reply)?)).await;
                return Err(anyhow::anyhow!("Authentication timeout"));
            }
        };

        let user_id = auth.user_id;
        let reply = AuthResponse {
            message_type: "auth_response".to_string(),
            success: true,
            user_id: Some(user_id.clone()),
            error: None,
        };
        ws_sender.send(Message::Text(serde_json::to_string(&reply)?)).await?;
        info!("[WS:AUTH] Connection authenticated for user {}", user_id);

        let client_id = Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut connections = self.connections.lock().await;
            connections.insert(
                client_id.clone(),
                ClientConnection {
                    client_id: client_id.clone(),
                    user_id: user_id.clone(),
                    sender: tx,
                },
            );
        }

        // Outbound pump: everything queued for this client goes to the wire.
        let send_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if ws_sender.send(message).await.is_err() {
                    break;
                }
            }
        });

        // Rooms this client joined, for presence cleanup on disconnect.
        let mut joined: HashSet<String> = HashSet::new();

        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let frame = match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            debug!("[WS:RECV] Unparseable frame from {}: {}", user_id, e);
                            continue;
                        }
                    };
                    self.handle_frame(
                        frame,
                        &client_id,
                        &user_id,
                        &mut joined,
                        &registry,
                        &router,
                        &config,
                    )
                    .await;
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("[WS:RECV] Error on connection for {}: {}", user_id, e);
                    break;
                }
            }
        }

        // Disconnect: drop presence promptly and tell each room.
        for pod_id in &joined {
            self.unsubscribe(pod_id, &client_id).await;
            self.broadcast_to_pod(
                pod_id,
                &serde_json::json!({
                    "event": "user-left",
                    "pod_id": pod_id,
                    "user_id": &user_id,
                }),
                None,
            )
            .await;
        }
        self.connections.lock().await.remove(&client_id);
        send_task.abort();
        info!("[WS] Connection closed for user {}", user_id);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_frame(
        &self,
        frame: ClientFrame,
        client_id: &ClientId,
        user_id: &UserId,
        joined: &mut HashSet<String>,
        registry: &Arc<RoomRegistry>,
        router: &Arc<MessageRouter>,
        config: &ServerConfig,
    ) {
        match frame.action.as_str() {
            "join-pod" => {
                let Some(pod_id) = frame.pod_id else {
                    self.send_error(client_id, None, "pod_id is required").await;
                    return;
                };
                match registry.join(&pod_id, user_id).await {
                    Ok(snapshot) => {
                        self.subscribe(&pod_id, client_id).await;
                        joined.insert(pod_id.clone());
                        self.send_to_client(
                            client_id,
                            &serde_json::json!({
                                "event": "pod-joined",
                                "pod": snapshot,
                            }),
                        )
                        .await;
                        self.broadcast_to_pod(
                            &pod_id,
                            &serde_json::json!({
                                "event": "user-joined",
                                "pod_id": &pod_id,
                                "user_id": user_id,
                            }),
                            Some(client_id),
                        )
                        .await;
                    }
                    Err(e) => {
                        let kind = match e {
                            ServiceError::NotFound => "not_found",
                            ServiceError::Unavailable => "unavailable",
                            ServiceError::InvalidInput(_) => "invalid",
                        };
                        self.send_error(client_id, Some(&pod_id), kind).await;
                    }
                }
            }
            "pod-message" => {
                let (Some(pod_id), Some(text)) = (frame.pod_id, frame.text) else {
                    self.send_error(client_id, None, "pod_id and text are required").await;
                    return;
                };
                if text.is_empty() || text.len() > config.max_message_length {
                    self.send_error(client_id, Some(&pod_id), "invalid").await;
                    return;
                }
                // Fire and forget: a room that vanished between join and send
                // drops the message without an error back to the sender.
                router.post_message(&pod_id, Some(user_id.as_str()), &text, false).await;
            }
            "leave-pod" => {
                let Some(pod_id) = frame.pod_id else {
                    return;
                };
                self.unsubscribe(&pod_id, client_id).await;
                joined.remove(&pod_id);
                self.broadcast_to_pod(
                    &pod_id,
                    &serde_json::json!({
                        "event": "user-left",
                        "pod_id": &pod_id,
                        "user_id": user_id,
                    }),
                    None,
                )
                .await;
            }
            other => {
                debug!("[WS:RECV] Unknown action '{}' from {}", other, user_id);
            }
        }
    }

    async fn send_error(&self, client_id: &ClientId, pod_id: Option<&str>, kind: &str) {
        self.send_to_client(
            client_id,
            &serde_json::json!({
                "event": "error",
                "pod_id": pod_id,
                "kind": kind,
            }),
        )
        .await;
    }
}

impl Default for PodSocketManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl PodSocketManager {
    /// Registers a connection backed by a bare channel instead of a socket,
    /// so router tests can observe exactly what a subscriber would receive.
    pub(crate) async fn register_test_client(
        &self,
        user_id: &str,
    ) -> (ClientId, mpsc::UnboundedReceiver<Message>) {
        let client_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.lock().await.insert(
            client_id.clone(),
            ClientConnection {
                client_id: client_id.clone(),
                user_id: user_id.to_string(),
                sender: tx,
            },
        );
        (client_id, rx)
    }
}
