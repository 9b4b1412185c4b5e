//! Message Types für das Signaling-Protokoll
//!
//! Jede Nachricht ist ein JSON-Envelope:
//! `{"roomId", "senderId", "type", "payload", "timestamp"}`.
//! `join`/`leave` sind Steuer-Nachrichten für das Relay ohne Payload.

use super::gateway::SignalingError;
use crate::peer::{IceCandidate, SessionDescription};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximale Länge einer Room-ID
const MAX_ROOM_ID_LEN: usize = 64;

// ============================================================================
// ROOM ID
// ============================================================================

/// Raum-Kennung, wird außerhalb der App (Copy/Paste) weitergegeben
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Erzeugt eine neue, zufällige Room-ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Prüft eine vom Benutzer eingegebene Room-ID
    pub fn parse(raw: &str) -> Result<Self, SignalingError> {
        let trimmed = raw.trim();
        let valid = !trimmed.is_empty()
            && trimmed.len() <= MAX_ROOM_ID_LEN
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

        if valid {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(SignalingError::InvalidRoomId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for RoomId {
    type Err = SignalingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ============================================================================
// MESSAGES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Hangup,
    Join,
    Leave,
}

/// Nachricht zwischen den beiden Teilnehmern eines Raums
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalMessage {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    Hangup,
}

impl SignalMessage {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalMessage::Offer(_) => SignalKind::Offer,
            SignalMessage::Answer(_) => SignalKind::Answer,
            SignalMessage::Candidate(_) => SignalKind::Candidate,
            SignalMessage::Hangup => SignalKind::Hangup,
        }
    }
}

// ============================================================================
// ENVELOPE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    pub room_id: RoomId,
    pub sender_id: String,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: i64,
}

impl SignalEnvelope {
    pub fn new(
        room_id: &RoomId,
        sender_id: &str,
        message: &SignalMessage,
    ) -> Result<Self, SignalingError> {
        let payload = match message {
            SignalMessage::Offer(desc) | SignalMessage::Answer(desc) => serde_json::to_value(desc),
            SignalMessage::Candidate(candidate) => serde_json::to_value(candidate),
            SignalMessage::Hangup => Ok(serde_json::Value::Null),
        }
        .map_err(|e| SignalingError::Decode(e.to_string()))?;

        Ok(Self {
            room_id: room_id.clone(),
            sender_id: sender_id.to_string(),
            kind: message.kind(),
            payload,
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    /// Steuer-Nachricht für das Relay (`join` / `leave`)
    pub fn control(room_id: &RoomId, sender_id: &str, kind: SignalKind) -> Self {
        Self {
            room_id: room_id.clone(),
            sender_id: sender_id.to_string(),
            kind,
            payload: serde_json::Value::Null,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Dekodiert die Payload. `None` für Steuer-Nachrichten.
    pub fn message(&self) -> Result<Option<SignalMessage>, SignalingError> {
        let decode = |e: serde_json::Error| SignalingError::Decode(e.to_string());

        let message = match self.kind {
            SignalKind::Offer => {
                SignalMessage::Offer(serde_json::from_value(self.payload.clone()).map_err(decode)?)
            }
            SignalKind::Answer => {
                SignalMessage::Answer(serde_json::from_value(self.payload.clone()).map_err(decode)?)
            }
            SignalKind::Candidate => SignalMessage::Candidate(
                serde_json::from_value(self.payload.clone()).map_err(decode)?,
            ),
            SignalKind::Hangup => SignalMessage::Hangup,
            SignalKind::Join | SignalKind::Leave => return Ok(None),
        };

        Ok(Some(message))
    }
}
