//! WebSocket Client für das Signaling-Relay
//!
//! Verwaltet die WebSocket-Verbindung zum Relay:
//! - Ein Write-Task (Reihenfolge pro Sender bleibt erhalten)
//! - Ein Read-Task, der Envelopes an die Raum-Abonnenten verteilt
//! - Keep-Alive Pings

use super::gateway::{SignalingError, SignalingGateway};
use super::messages::{RoomId, SignalEnvelope, SignalKind, SignalMessage};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;
use uuid::Uuid;

/// Keep-Alive Intervall (Relays trennen inaktive Sockets)
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Puffer für ausgehende Nachrichten
const OUTBOUND_CAPACITY: usize = 256;

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom WsSignalingClient ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    /// Verbunden mit dem Relay
    Connected,

    /// Verbindung getrennt
    Disconnected,
}

type RoomSubscribers = Arc<RwLock<HashMap<RoomId, mpsc::UnboundedSender<SignalMessage>>>>;

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für Signaling-Relay Kommunikation
pub struct WsSignalingClient {
    server_url: Url,
    client_id: String,
    connected: Arc<RwLock<bool>>,
    tx: mpsc::Sender<String>,
    rooms: RoomSubscribers,
    event_tx: broadcast::Sender<SignalingEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsSignalingClient {
    /// Verbindet mit dem Relay
    pub async fn connect(server_url: &str) -> Result<Self, SignalingError> {
        let server_url =
            Url::parse(server_url).map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        tracing::info!("Connecting to signaling relay: {}", server_url);

        let (ws_stream, _) = connect_async(server_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
        let (event_tx, _) = broadcast::channel(16);
        let connected = Arc::new(RwLock::new(true));
        let rooms: RoomSubscribers = Arc::new(RwLock::new(HashMap::new()));
        let client_id = Uuid::new_v4().to_string();

        // Read-Task starten
        let read_task = {
            let connected = Arc::clone(&connected);
            let rooms = Arc::clone(&rooms);
            let event_tx = event_tx.clone();
            let client_id = client_id.clone();

            tokio::spawn(async move {
                while let Some(msg_result) = read.next().await {
                    match msg_result {
                        Ok(Message::Text(text)) => Self::route(&text, &client_id, &rooms),
                        Ok(Message::Close(_)) => {
                            tracing::info!("WebSocket closed by relay");
                            break;
                        }
                        Err(e) => {
                            tracing::error!("WebSocket error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }

                *connected.write() = false;
                // Abonnenten schließen: der Controller sieht das Ende des Kanals
                rooms.write().clear();
                let _ = event_tx.send(SignalingEvent::Disconnected);
            })
        };

        // Write-Task mit Heartbeat starten
        let write_task = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await;

            loop {
                let frame = tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(text) => Message::Text(text),
                        None => break,
                    },
                    _ = heartbeat.tick() => Message::Ping(Vec::new()),
                };

                if let Err(e) = write.send(frame).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }

            let _ = write.close().await;
        });

        let _ = event_tx.send(SignalingEvent::Connected);

        Ok(Self {
            server_url,
            client_id,
            connected,
            tx,
            rooms,
            event_tx,
            tasks: Mutex::new(vec![read_task, write_task]),
        })
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        *self.connected.read()
    }

    /// Verteilt ein eingehendes Envelope an den Raum-Abonnenten
    fn route(text: &str, client_id: &str, rooms: &RoomSubscribers) {
        let envelope = match serde_json::from_str::<SignalEnvelope>(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Ignoring malformed signaling message: {}", e);
                return;
            }
        };

        if envelope.sender_id == client_id {
            return;
        }

        let message = match envelope.message() {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Ignoring {:?} from {}: {}", envelope.kind, envelope.sender_id, e);
                return;
            }
        };

        tracing::debug!("Received {:?} in room {}", envelope.kind, envelope.room_id);
        if let Some(tx) = rooms.read().get(&envelope.room_id) {
            let _ = tx.send(message);
        }
    }

    /// Sendet ein Envelope (non-blocking, verwendet try_send)
    fn send_envelope(&self, envelope: &SignalEnvelope) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let text = serde_json::to_string(envelope)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        self.tx
            .try_send(text)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }
}

#[async_trait]
impl SignalingGateway for WsSignalingClient {
    fn local_id(&self) -> &str {
        &self.client_id
    }

    async fn join(
        &self,
        room: &RoomId,
    ) -> Result<mpsc::UnboundedReceiver<SignalMessage>, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.rooms.write().insert(room.clone(), tx);

        if let Err(e) = self.send_envelope(&SignalEnvelope::control(room, &self.client_id, SignalKind::Join)) {
            self.rooms.write().remove(room);
            return Err(e);
        }

        tracing::info!("Joined room {}", room);
        Ok(rx)
    }

    fn send(&self, room: &RoomId, message: SignalMessage) -> Result<(), SignalingError> {
        let envelope = SignalEnvelope::new(room, &self.client_id, &message)?;
        tracing::debug!("Sending {:?} to room {}", envelope.kind, room);
        self.send_envelope(&envelope)
    }

    fn leave(&self, room: &RoomId) {
        if self.rooms.write().remove(room).is_some() {
            let leave = SignalEnvelope::control(room, &self.client_id, SignalKind::Leave);
            if let Err(e) = self.send_envelope(&leave) {
                tracing::debug!("Leave for room {} not delivered: {}", room, e);
            }
        }
    }
}

impl Drop for WsSignalingClient {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for WsSignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsSignalingClient")
            .field("server_url", &self.server_url.as_str())
            .field("client_id", &self.client_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}
