//! Peer Module - Verbindung zur Gegenseite
//!
//! Dieses Modul verwaltet:
//! - Die Transport-Schnittstelle (Offer/Answer, Candidates, Track-Slots)
//! - Den `PeerLink` mit Zustandsmaschine und Candidate-Puffer
//! - Die `webrtc`-Implementierung des Transports

mod link;
mod transport;
mod webrtc_transport;

pub use link::{ConnectionOrchestrator, PeerLink, RemoteStream};
pub use transport::{
    ConnectionState, IceCandidate, IceServer, PeerError, PeerEvent, PeerTransport,
    RemoteTrackInfo, SdpKind, SenderId, SessionDescription, TransportFactory,
};
pub use webrtc_transport::{WebRtcTransport, WebRtcTransportFactory};
