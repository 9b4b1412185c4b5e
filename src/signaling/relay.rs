//! In-Process Relay
//!
//! Verbindet mehrere `SignalingGateway`-Endpunkte im selben Prozess. Jede
//! Nachricht geht an alle anderen Mitglieder des Raums, in Sende-Reihenfolge.

use super::gateway::{SignalingError, SignalingGateway};
use super::messages::{RoomId, SignalMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

struct Member {
    id: String,
    tx: mpsc::UnboundedSender<SignalMessage>,
}

/// Gemeinsamer Hub aller Endpunkte
#[derive(Clone, Default)]
pub struct InMemoryRelay {
    rooms: Arc<Mutex<HashMap<RoomId, Vec<Member>>>>,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Neuer Teilnehmer mit eigener Kennung
    pub fn endpoint(&self) -> RelayEndpoint {
        RelayEndpoint {
            id: Uuid::new_v4().to_string(),
            relay: self.clone(),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Anzahl der Mitglieder eines Raums
    pub fn members(&self, room: &RoomId) -> usize {
        self.rooms.lock().get(room).map(Vec::len).unwrap_or(0)
    }
}

impl std::fmt::Debug for InMemoryRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryRelay")
            .field("rooms", &self.rooms.lock().len())
            .finish()
    }
}

/// Ein Teilnehmer am `InMemoryRelay`
pub struct RelayEndpoint {
    id: String,
    relay: InMemoryRelay,
    sent: Mutex<Vec<(RoomId, SignalMessage)>>,
}

impl RelayEndpoint {
    /// Alle über diesen Endpunkt gesendeten Nachrichten
    pub fn sent(&self) -> Vec<(RoomId, SignalMessage)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl SignalingGateway for RelayEndpoint {
    fn local_id(&self) -> &str {
        &self.id
    }

    async fn join(
        &self,
        room: &RoomId,
    ) -> Result<mpsc::UnboundedReceiver<SignalMessage>, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut rooms = self.relay.rooms.lock();
        let members = rooms.entry(room.clone()).or_default();
        members.retain(|m| m.id != self.id);
        members.push(Member {
            id: self.id.clone(),
            tx,
        });
        tracing::debug!("{} joined room {} ({} member(s))", self.id, room, members.len());
        Ok(rx)
    }

    fn send(&self, room: &RoomId, message: SignalMessage) -> Result<(), SignalingError> {
        self.sent.lock().push((room.clone(), message.clone()));

        let rooms = self.relay.rooms.lock();
        let Some(members) = rooms.get(room) else {
            tracing::debug!("Dropping {:?} for empty room {}", message.kind(), room);
            return Ok(());
        };

        for member in members.iter().filter(|m| m.id != self.id) {
            // Geschlossener Receiver = Teilnehmer ist weg, nicht unser Problem
            let _ = member.tx.send(message.clone());
        }
        Ok(())
    }

    fn leave(&self, room: &RoomId) {
        let mut rooms = self.relay.rooms.lock();
        if let Some(members) = rooms.get_mut(room) {
            members.retain(|m| m.id != self.id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }
}

impl std::fmt::Debug for RelayEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayEndpoint").field("id", &self.id).finish()
    }
}
