//! Pulse Meet - P2P Video Call Session Manager
//!
//! Verwaltet einen Zwei-Personen-Videoanruf:
//! - Lokale Kamera/Mikrofon-Aufnahme mit Mute ohne Neuverhandlung
//! - WebRTC Peer Connection mit STUN/TURN
//! - Bildschirmfreigabe per Track Replacement
//! - Signaling über ein WebSocket-Relay (oder In-Process)
//! - Geordneter Teardown auf jedem Weg aus dem Anruf

pub mod call_engine;
pub mod config;
pub mod media;
pub mod peer;
pub mod signaling;

#[cfg(test)]
mod testing;

pub use call_engine::{
    CallEngine, CallEngineError, CallEvent, CallRole, CallSnapshot, CallState, ChatMessage,
    TeardownReport, TeardownStep, VideoSource,
};
pub use config::{CallConfig, ConfigError};
pub use media::{MediaDevices, MediaError, SourceKind, SyntheticDevices};
pub use peer::{ConnectionState, IceServer, TransportFactory, WebRtcTransportFactory};
pub use signaling::{InMemoryRelay, RoomId, SignalingGateway, WsSignalingClient};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

/// Standard-Filter wenn `RUST_LOG` nicht gesetzt ist
pub const DEFAULT_LOG_FILTER: &str = "pulse_meet=debug,webrtc=warn";

static TRACING: OnceCell<()> = OnceCell::new();

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Logging. Mehrfache Aufrufe sind wirkungslos.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

        // Schlägt fehl, wenn die Anwendung bereits einen Subscriber gesetzt hat
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

        tracing::info!("Pulse Meet {} starting", env!("CARGO_PKG_VERSION"));
    });
}
