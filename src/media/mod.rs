//! Media Module - Lokale Aufnahmen
//!
//! Dieses Modul verwaltet:
//! - Tracks und Streams (Mute ohne Neuverhandlung)
//! - Capture-Constraints für Kamera, Mikrofon und Bildschirm
//! - Die Geräte-Schnittstelle inkl. simulierter Geräte
//! - Den Media Source Manager (höchstens ein Stream pro Quelle)

mod constraints;
mod devices;
mod manager;
mod track;

pub use constraints::{
    AudioConstraints, DisplayConstraints, MediaConstraints, VideoConstraints, CHANNELS,
    SAMPLE_RATE,
};
pub use devices::{CaptureError, DeviceBehavior, MediaDevices, SyntheticDevices};
pub use manager::{MediaError, MediaSourceManager, SourceKind};
pub use track::{MediaSample, MediaStream, MediaTrack, TrackKind, WeakMediaStream};
