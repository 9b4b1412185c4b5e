//! Signaling Gateway - Schnittstelle zum Nachrichtenkanal
//!
//! Der Gateway transportiert Offer, Answer und Candidates zwischen den
//! beiden Teilnehmern eines Raums. Pro Sender bleibt die Reihenfolge
//! erhalten; darauf verlässt sich der Controller (Candidates nie vor dem
//! zugehörigen Offer/Answer).

use super::messages::{RoomId, SignalMessage};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Signaling connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Failed to decode message: {0}")]
    Decode(String),

    #[error("Invalid room id: {0:?}")]
    InvalidRoomId(String),
}

// ============================================================================
// GATEWAY
// ============================================================================

#[async_trait]
pub trait SignalingGateway: Send + Sync {
    /// Kennung dieses Teilnehmers (Absender im Envelope)
    fn local_id(&self) -> &str;

    /// Tritt einem Raum bei. Der Receiver liefert die Nachrichten der
    /// Gegenseite in Sende-Reihenfolge.
    async fn join(
        &self,
        room: &RoomId,
    ) -> Result<mpsc::UnboundedReceiver<SignalMessage>, SignalingError>;

    /// Fire-and-forget, blockiert nie
    fn send(&self, room: &RoomId, message: SignalMessage) -> Result<(), SignalingError>;

    /// Verlässt den Raum; der Receiver aus `join` endet
    fn leave(&self, room: &RoomId);
}
