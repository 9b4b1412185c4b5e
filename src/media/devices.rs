//! Capture-Geräte
//!
//! `MediaDevices` ist die Schnittstelle zur Geräte-API (Kamera, Mikrofon,
//! Bildschirmaufnahme). `SyntheticDevices` ist eine In-Process-Implementierung
//! mit generierten Tracks, steuerbaren Fehlerfällen und optionalem Frame-Takt.

use super::constraints::{DisplayConstraints, MediaConstraints};
use super::track::{MediaSample, MediaStream, MediaTrack, TrackKind};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Fehler der Geräte-API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("No capture device found: {0}")]
    NotFound(String),

    #[error("Capture device is in use by another process: {0}")]
    InUse(String),

    #[error("Capture cancelled by user")]
    Cancelled,

    #[error("Capture failed: {0}")]
    Failed(String),
}

// ============================================================================
// DEVICE API
// ============================================================================

/// Geräte-API für lokale Aufnahmen
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Öffnet Kamera und/oder Mikrofon. Kann beliebig lange auf die
    /// Berechtigungsabfrage warten.
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, CaptureError>;

    /// Öffnet eine Bildschirmaufnahme (Auswahl-Dialog)
    async fn get_display_media(
        &self,
        constraints: &DisplayConstraints,
    ) -> Result<MediaStream, CaptureError>;
}

// ============================================================================
// SYNTHETIC DEVICES
// ============================================================================

/// Verhalten eines simulierten Geräts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceBehavior {
    /// Zugriff wird gewährt
    Grant,
    /// Benutzer verweigert die Berechtigung
    Deny,
    /// Kein Gerät vorhanden
    Missing,
    /// Gerät von anderem Prozess belegt
    Busy,
    /// Benutzer schließt den Auswahl-Dialog
    Cancel,
}

/// Simulierte Geräte
pub struct SyntheticDevices {
    camera: Mutex<DeviceBehavior>,
    display: Mutex<DeviceBehavior>,
    hold: Mutex<Option<oneshot::Receiver<()>>>,
    pump_frames: bool,
    created: Mutex<Vec<Arc<MediaTrack>>>,
    user_media_requests: AtomicUsize,
    display_requests: AtomicUsize,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self {
            camera: Mutex::new(DeviceBehavior::Grant),
            display: Mutex::new(DeviceBehavior::Grant),
            hold: Mutex::new(None),
            pump_frames: false,
            created: Mutex::new(Vec::new()),
            user_media_requests: AtomicUsize::new(0),
            display_requests: AtomicUsize::new(0),
        }
    }

    /// Erzeugt Platzhalter-Frames im Takt der Constraints
    pub fn with_frames(mut self) -> Self {
        self.pump_frames = true;
        self
    }

    pub fn set_camera(&self, behavior: DeviceBehavior) {
        *self.camera.lock() = behavior;
    }

    pub fn set_display(&self, behavior: DeviceBehavior) {
        *self.display.lock() = behavior;
    }

    /// Hält die nächste `get_user_media`-Anfrage an, bis der zurückgegebene
    /// Sender auslöst oder gedroppt wird (offene Berechtigungsabfrage).
    pub fn hold_user_media(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.hold.lock() = Some(rx);
        tx
    }

    /// Alle jemals erzeugten Tracks
    pub fn created_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.created.lock().clone()
    }

    /// Anzahl noch laufender Tracks
    pub fn live_tracks(&self) -> usize {
        self.created.lock().iter().filter(|t| t.is_live()).count()
    }

    /// Anzahl laufender Tracks einer Art
    pub fn live_tracks_of(&self, kind: TrackKind) -> usize {
        self.created
            .lock()
            .iter()
            .filter(|t| t.kind() == kind && t.is_live())
            .count()
    }

    pub fn user_media_requests(&self) -> usize {
        self.user_media_requests.load(Ordering::SeqCst)
    }

    pub fn display_requests(&self) -> usize {
        self.display_requests.load(Ordering::SeqCst)
    }

    /// Simuliert "Freigabe beenden" in der Browser-/System-Leiste
    pub fn end_display_capture(&self) {
        for track in self.created.lock().iter() {
            if track.label().starts_with("display") {
                track.stop();
            }
        }
    }

    fn behavior_error(behavior: DeviceBehavior, device: &str) -> Option<CaptureError> {
        match behavior {
            DeviceBehavior::Grant => None,
            DeviceBehavior::Deny => Some(CaptureError::PermissionDenied(device.to_string())),
            DeviceBehavior::Missing => Some(CaptureError::NotFound(device.to_string())),
            DeviceBehavior::Busy => Some(CaptureError::InUse(device.to_string())),
            DeviceBehavior::Cancel => Some(CaptureError::Cancelled),
        }
    }

    fn spawn_track(&self, kind: TrackKind, label: &str, frame_interval: Duration) -> Arc<MediaTrack> {
        let track = MediaTrack::new(kind, label);
        self.created.lock().push(Arc::clone(&track));

        if self.pump_frames {
            Self::pump(Arc::clone(&track), frame_interval);
        }

        track
    }

    /// Platzhalter-Payload, kein dekodierbarer Frame
    fn pump(track: Arc<MediaTrack>, interval: Duration) {
        let payload = match track.kind() {
            TrackKind::Audio => Bytes::from_static(&[0xF8, 0xFF, 0xFE]),
            TrackKind::Video => Bytes::from_static(&[0x10, 0x02, 0x00, 0x9D, 0x01, 0x2A]),
        };

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut ended = track.ended_signal();
            loop {
                tokio::select! {
                    _ = ended.wait_for(|e| *e) => break,
                    _ = ticker.tick() => {
                        track.push_sample(MediaSample {
                            data: payload.clone(),
                            duration: interval,
                        });
                    }
                }
            }
        });
    }
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, CaptureError> {
        self.user_media_requests.fetch_add(1, Ordering::SeqCst);

        let hold = self.hold.lock().take();
        if let Some(hold) = hold {
            tracing::debug!("Synthetic user media request held");
            let _ = hold.await;
        }

        let behavior = *self.camera.lock();
        if let Some(err) = Self::behavior_error(behavior, "camera") {
            return Err(err);
        }

        let mut tracks = Vec::new();
        if constraints.audio.is_some() {
            tracks.push(self.spawn_track(TrackKind::Audio, "synthetic-microphone", Duration::from_millis(20)));
        }
        if let Some(video) = &constraints.video {
            let interval = Duration::from_millis(1000 / u64::from(video.frame_rate.max(1)));
            tracks.push(self.spawn_track(TrackKind::Video, "synthetic-camera", interval));
        }

        Ok(MediaStream::new(tracks))
    }

    async fn get_display_media(
        &self,
        constraints: &DisplayConstraints,
    ) -> Result<MediaStream, CaptureError> {
        self.display_requests.fetch_add(1, Ordering::SeqCst);

        let behavior = *self.display.lock();
        if let Some(err) = Self::behavior_error(behavior, "display") {
            return Err(err);
        }

        let interval = Duration::from_millis(1000 / u64::from(constraints.frame_rate.max(1)));
        let track = self.spawn_track(TrackKind::Video, "display-synthetic", interval);
        Ok(MediaStream::new(vec![track]))
    }
}

impl std::fmt::Debug for SyntheticDevices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyntheticDevices")
            .field("camera", &*self.camera.lock())
            .field("display", &*self.display.lock())
            .field("live_tracks", &self.live_tracks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_user_media_honours_constraints() {
        let devices = SyntheticDevices::new();

        let stream = devices
            .get_user_media(&MediaConstraints::default().video_only())
            .await
            .unwrap();

        assert!(stream.audio_track().is_none());
        assert!(stream.video_track().is_some());
        assert_eq!(devices.user_media_requests(), 1);
    }

    #[tokio::test]
    async fn test_denied_camera_creates_no_tracks() {
        let devices = SyntheticDevices::new();
        devices.set_camera(DeviceBehavior::Deny);

        let err = devices
            .get_user_media(&MediaConstraints::default())
            .await
            .unwrap_err();

        assert!(matches!(err, CaptureError::PermissionDenied(_)));
        assert!(devices.created_tracks().is_empty());
    }

    #[tokio::test]
    async fn test_end_display_capture_stops_only_display_tracks() {
        let devices = SyntheticDevices::new();
        let camera = devices.get_user_media(&MediaConstraints::default()).await.unwrap();
        let display = devices
            .get_display_media(&DisplayConstraints::default())
            .await
            .unwrap();

        devices.end_display_capture();

        assert!(camera.is_live());
        assert!(!display.is_live());
    }
}
