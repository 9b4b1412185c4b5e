//! Transport-Schnittstelle für die Peer Connection
//!
//! `PeerTransport` kapselt die eigentliche Verbindung (z.B. `webrtc`). Der
//! Orchestrator und die Tests arbeiten nur gegen diese Schnittstelle.

use crate::media::{MediaTrack, TrackKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("At least one ICE server is required")]
    NoIceServers,

    #[error("Peer connection is closed")]
    Closed,

    #[error("No outbound {0} sender")]
    NoSender(TrackKind),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

// ============================================================================
// NEGOTIATION TYPES
// ============================================================================

/// STUN/TURN Server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    /// Relay-Server (TURN) statt reinem STUN
    pub fn is_relay(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// SDP Offer oder Answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate im Browser-kompatiblen JSON-Format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

// ============================================================================
// CONNECTION STATE
// ============================================================================

/// Zustand der Peer Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    /// Vorübergehend, kann sich selbst erholen
    Disconnected,
    /// Endgültig
    Failed,
    /// Endgültig, lokal geschlossen
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }

    /// Erlaubte Übergänge. Aus `Closed` gibt es keinen Weg zurück, aus
    /// `Failed` nur nach `Closed`.
    pub fn accepts(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (Failed, Closed) => true,
            (Failed, _) => false,
            (_, New) => false,
            (current, next) => current != next,
        }
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Eingehender Track der Gegenseite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrackInfo {
    pub track_id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// Events der Peer Connection. Werden an den Call Session Controller
/// weitergereicht, nicht intern behandelt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    StateChanged(ConnectionState),
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrackInfo),
    RemoteTrackEnded { track_id: String },
}

/// Ausgehender Sender-Slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u64);

// ============================================================================
// TRANSPORT TRAITS
// ============================================================================

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Bindet einen lokalen Track an einen neuen Sender-Slot
    async fn add_track(&self, track: &MediaTrack) -> Result<SenderId, PeerError>;

    /// Tauscht den Track eines bestehenden Slots ohne Neuverhandlung
    async fn replace_track(&self, sender: SenderId, track: &MediaTrack) -> Result<(), PeerError>;

    /// Erstellt ein Offer und setzt es als Local Description
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Erstellt ein Answer und setzt es als Local Description
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Öffnet eine neue Verbindung. Events gehen an `events`.
    async fn open(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError>;
}
