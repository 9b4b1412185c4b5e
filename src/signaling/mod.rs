//! Signaling Module - Nachrichtenkanal zwischen den Teilnehmern
//!
//! Dieses Modul verwaltet:
//! - Das Envelope-Format (`roomId`, `type`, `payload`)
//! - Die Gateway-Schnittstelle, von der der Controller abhängt
//! - Ein In-Process Relay (Tests, lokale Anrufe)
//! - Den WebSocket Client für ein Socket-Relay

mod client;
mod gateway;
mod messages;
mod relay;

pub use client::{SignalingEvent, WsSignalingClient};
pub use gateway::{SignalingError, SignalingGateway};
pub use messages::*;
pub use relay::{InMemoryRelay, RelayEndpoint};
