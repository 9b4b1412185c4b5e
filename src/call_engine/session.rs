//! Call Session - Zustand eines einzelnen Anrufs
//!
//! Eine `CallSession` existiert vom Start/Beitritt bis zum Ende des Teardowns
//! und wird danach verworfen. Ein neuer Anruf beginnt immer mit einer neuen
//! Session.

use super::screen_share::ScreenShare;
use crate::media::{MediaStream, MediaTrack};
use crate::peer::{ConnectionState, PeerLink, RemoteStream};
use crate::signaling::RoomId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Kein aktiver Anruf
    Idle,
    /// Kamera/Mikrofon werden angefordert
    AcquiringMedia,
    /// Verbindung steht, Gegenseite fehlt noch
    AwaitingPeer,
    /// Anruf aktiv (erster Remote-Track empfangen)
    Connected,
    /// Anruf beendet, Teardown läuft
    Ended,
    /// Anruf fehlgeschlagen, Teardown läuft
    Failed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }
}

/// Wer den Raum eröffnet hat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    /// Hat den Raum erzeugt, beantwortet das Offer
    Host,
    /// Ist beigetreten, sendet das Offer
    Guest,
}

/// Quelle des ausgehenden Videos
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoSource {
    Camera,
    ScreenShare,
}

// ============================================================================
// LOCAL MEDIA STATE
// ============================================================================

/// Ausgehende Medien des Benutzers. Einziger Besitzer der Capture-Streams.
#[derive(Debug)]
pub struct LocalMediaState {
    pub source: VideoSource,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    camera: Option<MediaStream>,
    screen: Option<ScreenShare>,
}

impl LocalMediaState {
    pub fn new() -> Self {
        Self {
            source: VideoSource::Camera,
            audio_enabled: true,
            video_enabled: true,
            camera: None,
            screen: None,
        }
    }

    pub fn camera(&self) -> Option<&MediaStream> {
        self.camera.as_ref()
    }

    pub fn screen(&self) -> Option<&MediaStream> {
        self.screen.as_ref().map(ScreenShare::stream)
    }

    pub fn is_sharing(&self) -> bool {
        self.screen.is_some()
    }

    /// Der Video-Track, der gerade gesendet wird
    pub fn outbound_video(&self) -> Option<Arc<MediaTrack>> {
        match &self.screen {
            Some(share) => share.stream().video_track(),
            None => self.camera.as_ref().and_then(MediaStream::video_track),
        }
    }

    /// Setzt `enabled` der Tracks nach den aktuellen Flags
    pub fn apply_enablement(&self) {
        if let Some(audio) = self.camera.as_ref().and_then(MediaStream::audio_track) {
            audio.set_enabled(self.audio_enabled);
        }
        if let Some(video) = self.outbound_video() {
            video.set_enabled(self.video_enabled);
        }
    }

    pub(crate) fn set_camera(&mut self, stream: MediaStream) {
        self.camera = Some(stream);
    }

    pub(crate) fn set_screen(&mut self, share: ScreenShare) {
        self.source = VideoSource::ScreenShare;
        self.screen = Some(share);
    }

    pub(crate) fn take_screen(&mut self) -> Option<ScreenShare> {
        self.source = VideoSource::Camera;
        self.screen.take()
    }

    /// Nimmt alle Streams heraus (für den Teardown)
    pub(crate) fn take_streams(&mut self) -> Vec<MediaStream> {
        let mut streams = Vec::with_capacity(2);
        if let Some(share) = self.take_screen() {
            streams.push(share.stream().clone());
        }
        if let Some(camera) = self.camera.take() {
            streams.push(camera);
        }
        streams
    }
}

impl Default for LocalMediaState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// CHAT
// ============================================================================

/// Lokale Chat-Nachricht
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub author: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(author: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            author: author.into(),
            text: text.into(),
            sent_at: Utc::now(),
        }
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Befehle an die Event-Schleife eines Anrufs
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LoopCommand {
    /// Die Bildschirmaufnahme wurde außerhalb der App beendet
    ShareEnded { stream_id: String },
}

pub struct CallSession {
    pub id: RoomId,
    pub role: CallRole,
    pub state: CallState,
    /// Zeitpunkt des Eintritts in `Connected`
    pub started_at: Option<DateTime<Utc>>,
    pub participant_count: u8,
    pub local: LocalMediaState,
    pub link: Option<Arc<PeerLink>>,
    pub messages: Vec<ChatMessage>,
    pub(crate) generation: u64,
    pub(crate) connected_at: Option<Instant>,
    pub(crate) commands: Option<mpsc::UnboundedSender<LoopCommand>>,
}

impl CallSession {
    pub(crate) fn new(id: RoomId, role: CallRole, generation: u64) -> Self {
        Self {
            id,
            role,
            state: CallState::Idle,
            started_at: None,
            participant_count: 1,
            local: LocalMediaState::new(),
            link: None,
            messages: Vec::new(),
            generation,
            connected_at: None,
            commands: None,
        }
    }

    /// Verbundene Zeit (0 solange nicht verbunden)
    pub fn elapsed(&self) -> Duration {
        self.connected_at
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            room_id: self.id.clone(),
            role: self.role,
            state: self.state,
            started_at: self.started_at,
            elapsed_secs: self.elapsed().as_secs(),
            participant_count: self.participant_count,
            source: self.local.source,
            audio_enabled: self.local.audio_enabled,
            video_enabled: self.local.video_enabled,
            connection_state: self.link.as_ref().map(|l| l.state()),
            remote_stream: self.link.as_ref().and_then(|l| l.remote_stream()),
            message_count: self.messages.len(),
        }
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("participant_count", &self.participant_count)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Serialisierbare Sicht auf die aktive Session (für eine UI)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    pub room_id: RoomId,
    pub role: CallRole,
    pub state: CallState,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_secs: u64,
    pub participant_count: u8,
    pub source: VideoSource,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub connection_state: Option<ConnectionState>,
    pub remote_stream: Option<RemoteStream>,
    pub message_count: usize,
}

// ============================================================================
// TEARDOWN REPORT
// ============================================================================

/// Schritte des Teardowns in fester Reihenfolge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownStep {
    StopMedia,
    ClosePeerLink,
    ClearTimer,
    ResetState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub step: TeardownStep,
    pub error: Option<String>,
}

/// Protokoll eines Teardowns
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownReport {
    pub room_id: RoomId,
    /// `Ended` oder `Failed`
    pub outcome: CallState,
    pub stopped_tracks: usize,
    pub steps: Vec<StepOutcome>,
}

impl TeardownReport {
    pub(crate) fn new(room_id: RoomId, outcome: CallState) -> Self {
        Self {
            room_id,
            outcome,
            stopped_tracks: 0,
            steps: Vec::with_capacity(4),
        }
    }

    pub(crate) fn record(&mut self, step: TeardownStep, result: Result<(), String>) {
        if let Err(e) = &result {
            tracing::warn!("Teardown step {:?} failed: {}", step, e);
        }
        self.steps.push(StepOutcome {
            step,
            error: result.err(),
        });
    }

    /// Reihenfolge, in der die Schritte liefen
    pub fn order(&self) -> Vec<TeardownStep> {
        self.steps.iter().map(|s| s.step).collect()
    }

    pub fn error(&self, step: TeardownStep) -> Option<&str> {
        self.steps
            .iter()
            .find(|s| s.step == step)
            .and_then(|s| s.error.as_deref())
    }

    pub fn is_clean(&self) -> bool {
        self.steps.iter().all(|s| s.error.is_none())
    }
}
