//! Media Source Manager
//!
//! Öffnet und schließt die lokalen Aufnahmen. Pro Quelle (Kamera,
//! Bildschirm) ist höchstens ein Stream offen; der Manager hält nur eine
//! schwache Referenz darauf, Besitzer ist der Anruf.

use super::constraints::{DisplayConstraints, MediaConstraints};
use super::devices::{CaptureError, MediaDevices};
use super::track::{MediaStream, TrackKind, WeakMediaStream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied for {0}")]
    PermissionDenied(SourceKind),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Capture cancelled by user")]
    UserCancelled,

    #[error("Capture error: {0}")]
    CaptureFailed(String),
}

impl MediaError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, MediaError::PermissionDenied(_))
    }

    /// Der Benutzer kann es sofort erneut versuchen
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MediaError::PermissionDenied(_) | MediaError::UserCancelled | MediaError::DeviceBusy(_)
        )
    }

    fn from_capture(source: SourceKind, err: CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied(_) => MediaError::PermissionDenied(source),
            CaptureError::NotFound(device) => MediaError::DeviceUnavailable(device),
            CaptureError::InUse(device) => MediaError::DeviceBusy(device),
            CaptureError::Cancelled => MediaError::UserCancelled,
            CaptureError::Failed(reason) => MediaError::CaptureFailed(reason),
        }
    }
}

// ============================================================================
// SOURCE KIND
// ============================================================================

/// Aufnahmequelle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Kamera + Mikrofon
    Camera,
    /// Bildschirmaufnahme
    Screen,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Camera => write!(f, "camera"),
            SourceKind::Screen => write!(f, "screen"),
        }
    }
}

#[derive(Default)]
struct OpenStreams {
    camera: WeakMediaStream,
    screen: WeakMediaStream,
}

// ============================================================================
// MEDIA SOURCE MANAGER
// ============================================================================

pub struct MediaSourceManager {
    devices: Arc<dyn MediaDevices>,
    constraints: MediaConstraints,
    display_constraints: DisplayConstraints,
    // Über die gesamte Acquisition gehalten: zwei parallele Aufrufe dürfen
    // keine zwei Kameras öffnen
    open: AsyncMutex<OpenStreams>,
}

impl MediaSourceManager {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        constraints: MediaConstraints,
        display_constraints: DisplayConstraints,
    ) -> Self {
        Self {
            devices,
            constraints,
            display_constraints,
            open: AsyncMutex::new(OpenStreams::default()),
        }
    }

    pub fn constraints(&self) -> &MediaConstraints {
        &self.constraints
    }

    /// Öffnet die Quelle oder gibt den bereits offenen Stream zurück.
    ///
    /// Hat ein Kamera-Stream nur seinen Video-Track verloren (Screen-Share),
    /// wird nur Video neu angefordert und in denselben Stream eingesetzt.
    pub async fn acquire(&self, kind: SourceKind) -> Result<MediaStream, MediaError> {
        let mut open = self.open.lock().await;

        match kind {
            SourceKind::Camera => {
                if let Some(existing) = open.camera.upgrade() {
                    if self.is_complete(&existing) {
                        tracing::debug!("Camera already open, reusing stream {}", existing.id());
                        return Ok(existing);
                    }
                    if existing.has_live(TrackKind::Audio) && self.constraints.video.is_some() {
                        self.restore_video(&existing).await?;
                        return Ok(existing);
                    }
                    existing.stop();
                }

                let stream = self
                    .devices
                    .get_user_media(&self.constraints)
                    .await
                    .map_err(|e| MediaError::from_capture(SourceKind::Camera, e))?;

                if !self.is_complete(&stream) {
                    stream.stop();
                    return Err(MediaError::DeviceUnavailable(
                        "capture returned an incomplete camera stream".to_string(),
                    ));
                }

                tracing::info!("Camera stream {} acquired", stream.id());
                open.camera = stream.downgrade();
                Ok(stream)
            }
            SourceKind::Screen => {
                if let Some(existing) = open.screen.upgrade() {
                    if existing.has_live(TrackKind::Video) {
                        return Ok(existing);
                    }
                    existing.stop();
                }

                let stream = self
                    .devices
                    .get_display_media(&self.display_constraints)
                    .await
                    .map_err(|e| MediaError::from_capture(SourceKind::Screen, e))?;

                if !stream.has_live(TrackKind::Video) {
                    stream.stop();
                    return Err(MediaError::CaptureFailed(
                        "display capture returned no video track".to_string(),
                    ));
                }

                tracing::info!("Screen stream {} acquired", stream.id());
                open.screen = stream.downgrade();
                Ok(stream)
            }
        }
    }

    /// Stoppt jeden Track des Streams. Bereits gestoppte Streams sind ok.
    pub fn release(&self, stream: &MediaStream) {
        stream.stop();
        tracing::debug!("Stream {} released", stream.id());
    }

    /// Mute / Kamera aus: nur `enabled` umschalten, Aufnahme bleibt offen
    pub fn set_enabled(&self, stream: &MediaStream, kind: TrackKind, enabled: bool) {
        for track in stream.tracks().iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
        }
    }

    fn is_complete(&self, stream: &MediaStream) -> bool {
        let audio_ok = self.constraints.audio.is_none() || stream.has_live(TrackKind::Audio);
        let video_ok = self.constraints.video.is_none() || stream.has_live(TrackKind::Video);
        audio_ok && video_ok
    }

    async fn restore_video(&self, stream: &MediaStream) -> Result<(), MediaError> {
        let fresh = self
            .devices
            .get_user_media(&self.constraints.video_only())
            .await
            .map_err(|e| MediaError::from_capture(SourceKind::Camera, e))?;

        let Some(video) = fresh.video_track() else {
            fresh.stop();
            return Err(MediaError::DeviceUnavailable(
                "capture returned no camera track".to_string(),
            ));
        };

        // Alles außer dem neuen Video-Track wieder schließen
        for track in fresh.tracks() {
            if track.id() != video.id() {
                track.stop();
            }
        }

        stream.replace_dead(video);
        tracing::info!("Camera video restored on stream {}", stream.id());
        Ok(())
    }
}

impl std::fmt::Debug for MediaSourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSourceManager")
            .field("constraints", &self.constraints)
            .finish()
    }
}
