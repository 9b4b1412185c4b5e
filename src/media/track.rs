//! Track- und Stream-Modell
//!
//! Ein `MediaTrack` ist eine einzelne Audio- oder Video-Quelle. Er kann
//! aktiviert/deaktiviert (Mute) und genau einmal gestoppt werden. Ein
//! `MediaStream` bündelt die Tracks einer Aufnahme (Kamera oder Bildschirm).

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

/// Puffergröße für Samples pro Track (Lagging-Empfänger verlieren alte Frames)
const SAMPLE_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// TRACK KIND
// ============================================================================

/// Art eines Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Ein kodierter Frame bzw. ein Audio-Paket
#[derive(Debug, Clone)]
pub struct MediaSample {
    pub data: Bytes,
    pub duration: Duration,
}

// ============================================================================
// MEDIA TRACK
// ============================================================================

/// Einzelner lokaler Capture-Track
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    ended_tx: watch::Sender<bool>,
    samples_tx: broadcast::Sender<MediaSample>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Arc<Self> {
        let (ended_tx, _) = watch::channel(false);
        let (samples_tx, _) = broadcast::channel(SAMPLE_CHANNEL_CAPACITY);

        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
            enabled: AtomicBool::new(true),
            ended_tx,
            samples_tx,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Aktiviert/deaktiviert den Track ohne die Aufnahme zu beenden
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        tracing::debug!("Track {} ({}) enabled: {}", self.id, self.kind, enabled);
    }

    /// `true` solange der Track nicht gestoppt wurde
    pub fn is_live(&self) -> bool {
        !*self.ended_tx.borrow()
    }

    /// Stoppt den Track. Mehrfache Aufrufe sind wirkungslos.
    pub fn stop(&self) {
        let stopped = self.ended_tx.send_if_modified(|ended| {
            if *ended {
                false
            } else {
                *ended = true;
                true
            }
        });

        if stopped {
            tracing::debug!("Track {} ({}) stopped", self.id, self.kind);
        }
    }

    /// Wartet bis der Track beendet ist (lokal gestoppt oder vom Backend)
    pub async fn ended(&self) {
        let mut rx = self.ended_tx.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    /// Receiver für das Ende des Tracks, unabhängig von der Track-Lebensdauer
    pub fn ended_signal(&self) -> watch::Receiver<bool> {
        self.ended_tx.subscribe()
    }

    /// Liefert einen Frame an alle Abnehmer.
    ///
    /// Gibt `false` zurück wenn der Frame verworfen wurde (Track beendet
    /// oder deaktiviert).
    pub fn push_sample(&self, sample: MediaSample) -> bool {
        if !self.is_live() || !self.is_enabled() {
            return false;
        }
        // Ohne Empfänger ist der Frame einfach weg
        let _ = self.samples_tx.send(sample);
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaSample> {
        self.samples_tx.subscribe()
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

// ============================================================================
// MEDIA STREAM
// ============================================================================

struct StreamInner {
    id: String,
    tracks: Mutex<Vec<Arc<MediaTrack>>>,
}

/// Handle auf eine Gruppe von Tracks einer Aufnahme
#[derive(Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

impl MediaStream {
    pub fn new(tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: Uuid::new_v4().to_string(),
                tracks: Mutex::new(tracks),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.inner.tracks.lock().clone()
    }

    /// Erster Track der gegebenen Art (auch wenn bereits beendet)
    pub fn track(&self, kind: TrackKind) -> Option<Arc<MediaTrack>> {
        self.inner
            .tracks
            .lock()
            .iter()
            .find(|t| t.kind() == kind)
            .cloned()
    }

    pub fn audio_track(&self) -> Option<Arc<MediaTrack>> {
        self.track(TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<Arc<MediaTrack>> {
        self.track(TrackKind::Video)
    }

    /// `true` wenn ein nicht beendeter Track der Art existiert
    pub fn has_live(&self, kind: TrackKind) -> bool {
        self.inner
            .tracks
            .lock()
            .iter()
            .any(|t| t.kind() == kind && t.is_live())
    }

    /// `true` solange irgendein Track läuft
    pub fn is_live(&self) -> bool {
        self.inner.tracks.lock().iter().any(|t| t.is_live())
    }

    /// Ersetzt alle beendeten Tracks der Art durch `track`
    pub(crate) fn replace_dead(&self, track: Arc<MediaTrack>) {
        let mut tracks = self.inner.tracks.lock();
        tracks.retain(|t| t.kind() != track.kind() || t.is_live());
        tracks.push(track);
    }

    /// Stoppt jeden Track des Streams
    pub fn stop(&self) {
        for track in self.inner.tracks.lock().iter() {
            track.stop();
        }
    }

    /// Gleicher Handle (nicht nur gleicher Inhalt)
    pub fn ptr_eq(&self, other: &MediaStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakMediaStream {
        WeakMediaStream(Arc::downgrade(&self.inner))
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.inner.id)
            .field("tracks", &*self.inner.tracks.lock())
            .finish()
    }
}

/// Nicht-besitzende Referenz auf einen `MediaStream`
#[derive(Clone, Default)]
pub struct WeakMediaStream(Weak<StreamInner>);

impl WeakMediaStream {
    pub fn upgrade(&self) -> Option<MediaStream> {
        self.0.upgrade().map(|inner| MediaStream { inner })
    }
}
