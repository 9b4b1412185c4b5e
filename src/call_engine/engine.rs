//! Call Session Controller
//!
//! Koordiniert Media Source Manager, Screen Capture Swapper, Connection
//! Orchestrator und Signaling Gateway für genau einen Anruf:
//! `Idle → AcquiringMedia → AwaitingPeer → Connected → Ended`, mit `Failed`
//! bei nicht behebbaren Fehlern. Der Teardown läuft immer in derselben
//! Reihenfolge: Medien stoppen, Peer Link schließen, Timer löschen, Idle.

use super::screen_share::{ScreenCaptureSwapper, ShareError};
use super::session::{
    CallRole, CallSession, CallSnapshot, CallState, ChatMessage, LoopCommand, TeardownReport,
    TeardownStep,
};
use super::timer::CallTimer;
use crate::config::{CallConfig, ConfigError};
use crate::media::{
    MediaDevices, MediaError, MediaSourceManager, MediaStream, SourceKind, TrackKind,
};
use crate::peer::{
    ConnectionOrchestrator, ConnectionState, PeerError, PeerEvent, PeerLink, RemoteTrackInfo,
    TransportFactory,
};
use crate::signaling::{RoomId, SignalMessage, SignalingError, SignalingGateway};
use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallEngineError {
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Peer connection error: {0}")]
    Peer(#[from] PeerError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Screen share error: {0}")]
    Share(#[from] ShareError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("No active call")]
    NoActiveCall,

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Call was ended while it was being set up")]
    Cancelled,

    #[error("Chat message is empty")]
    EmptyMessage,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events die vom CallEngine ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    StateChanged(CallState),
    ConnectionChanged(ConnectionState),
    ParticipantsChanged(u8),
    /// Verbundene Zeit, im Takt von `tickMillis`
    Elapsed(Duration),
    ScreenShareChanged(bool),
    /// Hinweis für den Benutzer, kein Fehler
    Notice(String),
    Error(String),
    CallEnded(TeardownReport),
}

enum LoopInput {
    Peer(PeerEvent),
    Signal(SignalMessage),
    SignalingClosed,
    Command(LoopCommand),
}

enum Flow {
    Continue,
    End {
        outcome: CallState,
        notify_remote: bool,
    },
}

// ============================================================================
// CALL ENGINE
// ============================================================================

pub struct CallEngine {
    config: CallConfig,
    media: Arc<MediaSourceManager>,
    swapper: ScreenCaptureSwapper,
    orchestrator: ConnectionOrchestrator,
    signaling: Arc<dyn SignalingGateway>,
    session: Mutex<Option<CallSession>>,
    generations: AtomicU64,
    timer: Mutex<CallTimer>,
    event_loop: Mutex<Option<(u64, JoinHandle<()>)>>,
    // Start und Stop der Freigabe laufen nie parallel
    share_lock: AsyncMutex<()>,
    last_teardown: Mutex<Option<TeardownReport>>,
    event_tx: broadcast::Sender<CallEvent>,
    weak_self: Weak<CallEngine>,
}

impl CallEngine {
    /// Erstellt eine neue CallEngine
    pub fn new(
        config: CallConfig,
        devices: Arc<dyn MediaDevices>,
        transports: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingGateway>,
    ) -> Result<Arc<Self>, CallEngineError> {
        config.validate()?;

        let media = Arc::new(MediaSourceManager::new(
            devices,
            config.media.clone(),
            config.display.clone(),
        ));
        let (event_tx, _) = broadcast::channel(100);

        Ok(Arc::new_cyclic(|weak_self| Self {
            swapper: ScreenCaptureSwapper::new(Arc::clone(&media)),
            media,
            orchestrator: ConnectionOrchestrator::new(transports),
            signaling,
            config,
            session: Mutex::new(None),
            generations: AtomicU64::new(0),
            timer: Mutex::new(CallTimer::new()),
            event_loop: Mutex::new(None),
            share_lock: AsyncMutex::new(()),
            last_teardown: Mutex::new(None),
            event_tx,
            weak_self: weak_self.clone(),
        }))
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    /// Gibt den aktuellen Call-Status zurück
    pub fn state(&self) -> CallState {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(CallState::Idle)
    }

    pub fn room_id(&self) -> Option<RoomId> {
        self.session.lock().as_ref().map(|s| s.id.clone())
    }

    pub fn snapshot(&self) -> Option<CallSnapshot> {
        self.session.lock().as_ref().map(CallSession::snapshot)
    }

    /// Protokoll des letzten Teardowns
    pub fn last_teardown(&self) -> Option<TeardownReport> {
        self.last_teardown.lock().clone()
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    // ========================================================================
    // CALL LIFECYCLE
    // ========================================================================

    /// Startet einen Anruf in einem neuen Raum. Die Room-ID muss der
    /// Gegenseite außerhalb der App mitgeteilt werden.
    pub async fn start_call(&self) -> Result<RoomId, CallEngineError> {
        let room = RoomId::generate();
        tracing::info!("Starting call in room {}", room);
        self.begin(room.clone(), CallRole::Host).await?;
        Ok(room)
    }

    /// Tritt einem bestehenden Raum bei und sendet das Offer
    pub async fn join_call(&self, room: RoomId) -> Result<(), CallEngineError> {
        tracing::info!("Joining call in room {}", room);
        self.begin(room, CallRole::Guest).await
    }

    /// Beendet den aktuellen Anruf
    pub async fn end_call(&self) -> Result<TeardownReport, CallEngineError> {
        self.teardown(CallState::Ended, None, true)
            .await
            .ok_or(CallEngineError::NoActiveCall)
    }

    async fn begin(&self, room: RoomId, role: CallRole) -> Result<(), CallEngineError> {
        let generation = {
            let mut session = self.session.lock();
            if session.is_some() {
                return Err(CallEngineError::AlreadyInCall);
            }
            let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
            *session = Some(CallSession::new(room.clone(), role, generation));
            generation
        };
        self.transition(generation, CallState::AcquiringMedia);

        let camera = match self.media.acquire(SourceKind::Camera).await {
            Ok(stream) => stream,
            Err(e) => {
                if !self.discard_session(generation) {
                    return Err(CallEngineError::Cancelled);
                }
                tracing::warn!("Could not acquire local media: {}", e);
                self.emit(CallEvent::Error(e.to_string()));
                return Err(e.into());
            }
        };

        let adopted = self.with_current(generation, |s| {
            s.local.set_camera(camera.clone());
            s.local.apply_enablement();
        });
        if adopted.is_none() {
            tracing::info!("Call in room {} ended during media acquisition, releasing stream", room);
            self.media.release(&camera);
            return Err(CallEngineError::Cancelled);
        }

        match self.connect(generation, &room, role, &camera).await {
            Ok(()) => Ok(()),
            Err(_) if !self.is_current(generation) => Err(CallEngineError::Cancelled),
            Err(e) => {
                tracing::error!("Call setup failed: {}", e);
                self.emit(CallEvent::Error(e.to_string()));
                self.teardown(CallState::Failed, Some(generation), false).await;
                Err(e)
            }
        }
    }

    async fn connect(
        &self,
        generation: u64,
        room: &RoomId,
        role: CallRole,
        camera: &MediaStream,
    ) -> Result<(), CallEngineError> {
        let (link, peer_events) = self.orchestrator.create(&self.config.ice_servers).await?;
        let link = Arc::new(link);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let stored = self.with_current(generation, |s| {
            s.link = Some(Arc::clone(&link));
            s.commands = Some(commands_tx);
        });
        if stored.is_none() {
            let _ = link.close().await;
            return Err(CallEngineError::Cancelled);
        }

        // Tracks vor dem ersten Offer binden, sonst fehlen die m-Lines
        link.attach_local_tracks(camera).await?;
        let signals = self.signaling.join(room).await?;

        if !self.transition(generation, CallState::AwaitingPeer) {
            return Err(CallEngineError::Cancelled);
        }
        self.spawn_event_loop(generation, room.clone(), Arc::clone(&link), peer_events, signals, commands_rx);

        if role == CallRole::Guest {
            let offer = link.create_offer().await?;
            self.signaling.send(room, SignalMessage::Offer(offer))?;
            tracing::info!("Offer sent to room {}", room);
        }

        Ok(())
    }

    // ========================================================================
    // USER ACTIONS
    // ========================================================================

    /// Mikrofon aus/an. Gibt zurück, ob Audio jetzt gesendet wird.
    pub fn toggle_mute(&self) -> Result<bool, CallEngineError> {
        let mut guard = self.session.lock();
        let session = active(&mut guard)?;

        let enabled = !session.local.audio_enabled;
        session.local.audio_enabled = enabled;
        if let Some(camera) = session.local.camera() {
            self.media.set_enabled(camera, TrackKind::Audio, enabled);
        }

        tracing::info!("Microphone {}", if enabled { "unmuted" } else { "muted" });
        Ok(enabled)
    }

    /// Video aus/an, gilt für den gerade gesendeten Video-Track. Gibt zurück,
    /// ob Video jetzt gesendet wird.
    pub fn toggle_camera(&self) -> Result<bool, CallEngineError> {
        let mut guard = self.session.lock();
        let session = active(&mut guard)?;

        let enabled = !session.local.video_enabled;
        session.local.video_enabled = enabled;
        let outbound = session.local.screen().or(session.local.camera());
        if let Some(stream) = outbound {
            self.media.set_enabled(stream, TrackKind::Video, enabled);
        }

        tracing::info!("Video {}", if enabled { "enabled" } else { "disabled" });
        Ok(enabled)
    }

    /// Bildschirmfreigabe an/aus. Ohne Peer Link passiert nichts außer einem
    /// Hinweis. Gibt zurück, ob jetzt geteilt wird.
    pub async fn toggle_screen_share(&self) -> Result<bool, CallEngineError> {
        let _share = self.share_lock.lock().await;

        let active = {
            let guard = self.session.lock();
            guard
                .as_ref()
                .filter(|s| !s.state.is_terminal())
                .and_then(|s| {
                    s.link
                        .clone()
                        .map(|link| (s.generation, link, s.local.is_sharing()))
                })
        };

        let Some((generation, link, sharing)) = active else {
            tracing::debug!("Screen share requested without an active call");
            self.emit(CallEvent::Notice("Screen sharing needs an active call".to_string()));
            return Err(CallEngineError::NoActiveCall);
        };

        if sharing {
            self.stop_sharing(generation, &link).await?;
            Ok(false)
        } else {
            self.start_sharing(generation, &link).await?;
            Ok(true)
        }
    }

    /// Hängt eine Chat-Nachricht lokal an
    pub fn send_chat_message(&self, text: &str) -> Result<ChatMessage, CallEngineError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CallEngineError::EmptyMessage);
        }

        let mut guard = self.session.lock();
        let session = active(&mut guard)?;
        let message = ChatMessage::new(self.signaling.local_id(), text);
        session.messages.push(message.clone());
        Ok(message)
    }

    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    async fn start_sharing(&self, generation: u64, link: &PeerLink) -> Result<(), CallEngineError> {
        let (camera, commands) = self
            .with_current(generation, |s| (s.local.camera().cloned(), s.commands.clone()))
            .ok_or(CallEngineError::NoActiveCall)?;

        let on_ended = move |stream_id: String| {
            if let Some(commands) = commands {
                let _ = commands.send(LoopCommand::ShareEnded { stream_id });
            }
        };

        let share = match self.swapper.start_share(link, camera.as_ref(), on_ended).await {
            Ok(share) => share,
            Err(e) => {
                if self.is_current(generation) {
                    tracing::warn!("Screen share not started: {}", e);
                    self.emit(CallEvent::Error(e.to_string()));
                }
                return Err(e.into());
            }
        };
        drop(camera);

        let screen = share.stream().clone();
        let adopted = self.with_current(generation, move |s| {
            s.local.set_screen(share);
            s.local.apply_enablement();
        });
        if adopted.is_none() {
            self.media.release(&screen);
            return Err(CallEngineError::Cancelled);
        }

        self.emit(CallEvent::ScreenShareChanged(true));
        Ok(())
    }

    async fn stop_sharing(&self, generation: u64, link: &PeerLink) -> Result<(), CallEngineError> {
        let (share, camera) = self
            .with_current(generation, |s| (s.local.take_screen(), s.local.camera().cloned()))
            .and_then(|(share, camera)| share.map(|share| (share, camera)))
            .ok_or(CallEngineError::NoActiveCall)?;

        match self.swapper.stop_share(link, camera.as_ref(), share).await {
            Ok(camera) => {
                let adopted = self.with_current(generation, |s| {
                    s.local.set_camera(camera.clone());
                    s.local.apply_enablement();
                });
                if adopted.is_none() {
                    self.media.release(&camera);
                    return Err(CallEngineError::Cancelled);
                }
                self.emit(CallEvent::ScreenShareChanged(false));
                Ok(())
            }
            Err(e) => {
                if self.is_current(generation) {
                    self.emit(CallEvent::ScreenShareChanged(false));
                    self.emit(CallEvent::Error(e.to_string()));
                }
                Err(e.into())
            }
        }
    }

    // ========================================================================
    // EVENT LOOP
    // ========================================================================

    fn spawn_event_loop(
        &self,
        generation: u64,
        room: RoomId,
        link: Arc<PeerLink>,
        peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        signals: mpsc::UnboundedReceiver<SignalMessage>,
        commands: mpsc::UnboundedReceiver<LoopCommand>,
    ) {
        let handle = tokio::spawn(run_event_loop(
            self.weak_self.clone(),
            generation,
            room,
            link,
            peer_events,
            signals,
            commands,
        ));

        if let Some((_, previous)) = self.event_loop.lock().replace((generation, handle)) {
            previous.abort();
        }
    }

    async fn on_peer_event(
        &self,
        generation: u64,
        room: &RoomId,
        link: &PeerLink,
        event: PeerEvent,
    ) -> Flow {
        match event {
            PeerEvent::StateChanged(state) => {
                tracing::info!("Peer connection state: {:?}", state);
                self.emit(CallEvent::ConnectionChanged(state));

                match state {
                    ConnectionState::Disconnected => {
                        self.emit(CallEvent::Notice(
                            "Connection interrupted, trying to recover".to_string(),
                        ));
                        Flow::Continue
                    }
                    ConnectionState::Failed => {
                        tracing::error!("Peer connection failed in room {}", room);
                        self.emit(CallEvent::Error("Connection failed".to_string()));
                        Flow::End {
                            outcome: CallState::Failed,
                            notify_remote: true,
                        }
                    }
                    ConnectionState::Closed => Flow::End {
                        outcome: CallState::Ended,
                        notify_remote: false,
                    },
                    _ => Flow::Continue,
                }
            }
            PeerEvent::LocalCandidate(candidate) => {
                if let Err(e) = self.signaling.send(room, SignalMessage::Candidate(candidate)) {
                    tracing::warn!("Failed to send ICE candidate: {}", e);
                }
                Flow::Continue
            }
            PeerEvent::RemoteTrack(info) => {
                self.on_remote_track(generation, info);
                Flow::Continue
            }
            PeerEvent::RemoteTrackEnded { track_id } => {
                tracing::info!("Remote track {} ended", track_id);
                if link.remote_track_count() == 0 {
                    let left = self.with_current(generation, |s| {
                        let was_present = s.participant_count > 1;
                        s.participant_count = 1;
                        was_present
                    });
                    if left == Some(true) {
                        self.emit(CallEvent::ParticipantsChanged(1));
                        self.emit(CallEvent::Notice("The other participant left".to_string()));
                    }
                }
                Flow::Continue
            }
        }
    }

    fn on_remote_track(&self, generation: u64, info: RemoteTrackInfo) {
        tracing::info!("Received remote {} track {}", info.kind, info.track_id);

        // Timer unter dem Session-Lock starten: der Teardown markiert die
        // Session unter demselben Lock als beendet, bevor er den Timer löscht
        let changes = self.with_current(generation, |s| {
            let joined = s.participant_count < 2;
            s.participant_count = 2;

            let connected = s.state == CallState::AwaitingPeer;
            if connected {
                let now = Instant::now();
                s.state = CallState::Connected;
                s.started_at = Some(Utc::now());
                s.connected_at = Some(now);

                let events = self.event_tx.clone();
                self.timer
                    .lock()
                    .start(self.config.tick_interval(), now, move |elapsed| {
                        let _ = events.send(CallEvent::Elapsed(elapsed));
                    });
            }
            (joined, connected)
        });

        let Some((joined, connected)) = changes else {
            return;
        };
        if joined {
            self.emit(CallEvent::ParticipantsChanged(2));
        }
        if connected {
            tracing::info!("Call state: {:?}", CallState::Connected);
            self.emit(CallEvent::StateChanged(CallState::Connected));
        }
    }

    async fn on_signal(
        &self,
        generation: u64,
        room: &RoomId,
        link: &PeerLink,
        message: SignalMessage,
    ) -> Flow {
        tracing::debug!("Signal {:?} in room {}", message.kind(), room);

        match message {
            SignalMessage::Offer(offer) => {
                if self.with_current(generation, |s| s.role) != Some(CallRole::Host) {
                    tracing::warn!("Ignoring offer, this side sends the offer");
                    return Flow::Continue;
                }
                match link.accept_offer(offer).await {
                    Ok(answer) => {
                        if let Err(e) = self.signaling.send(room, SignalMessage::Answer(answer)) {
                            tracing::warn!("Failed to send answer: {}", e);
                        }
                        Flow::Continue
                    }
                    Err(e) => self.negotiation_failed(e),
                }
            }
            SignalMessage::Answer(answer) => match link.apply_answer(answer).await {
                Ok(()) => Flow::Continue,
                Err(e) => self.negotiation_failed(e),
            },
            SignalMessage::Candidate(candidate) => {
                if let Err(e) = link.add_remote_candidate(candidate).await {
                    tracing::warn!("Ignoring remote candidate: {}", e);
                }
                Flow::Continue
            }
            SignalMessage::Hangup => {
                tracing::info!("Remote side hung up in room {}", room);
                self.emit(CallEvent::Notice("The other participant ended the call".to_string()));
                Flow::End {
                    outcome: CallState::Ended,
                    notify_remote: false,
                }
            }
        }
    }

    async fn on_command(&self, generation: u64, link: &PeerLink, command: LoopCommand) {
        match command {
            LoopCommand::ShareEnded { stream_id } => {
                let _share = self.share_lock.lock().await;

                let current = self
                    .with_current(generation, |s| {
                        s.local.screen().is_some_and(|screen| screen.id() == stream_id)
                    })
                    .unwrap_or(false);
                if !current {
                    return;
                }

                self.emit(CallEvent::Notice("Screen sharing ended".to_string()));
                if let Err(e) = self.stop_sharing(generation, link).await {
                    tracing::warn!("Could not switch back to camera: {}", e);
                }
            }
        }
    }

    fn negotiation_failed(&self, err: PeerError) -> Flow {
        tracing::error!("Negotiation failed: {}", err);
        self.emit(CallEvent::Error(format!("Negotiation failed: {err}")));
        Flow::End {
            outcome: CallState::Failed,
            notify_remote: true,
        }
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Einziger Weg aus einem Anruf. Jeder Schritt läuft, auch wenn ein
    /// vorheriger fehlschlägt. `None` wenn es nichts (mehr) zu beenden gibt.
    async fn teardown(
        &self,
        outcome: CallState,
        only_generation: Option<u64>,
        notify_remote: bool,
    ) -> Option<TeardownReport> {
        let (room, generation, streams, link) = {
            let mut guard = self.session.lock();
            let session = guard.as_mut()?;
            if session.state.is_terminal()
                || only_generation.is_some_and(|g| g != session.generation)
            {
                return None;
            }
            session.state = outcome;
            session.commands = None;
            (
                session.id.clone(),
                session.generation,
                session.local.take_streams(),
                session.link.take(),
            )
        };

        tracing::info!("Ending call in room {} ({:?})", room, outcome);
        self.emit(CallEvent::StateChanged(outcome));

        if notify_remote && link.is_some() {
            if let Err(e) = self.signaling.send(&room, SignalMessage::Hangup) {
                tracing::debug!("Hangup not delivered: {}", e);
            }
        }

        let mut report = TeardownReport::new(room.clone(), outcome);

        // 1. Lokale Medien
        report.stopped_tracks = streams
            .iter()
            .flat_map(|s| s.tracks())
            .filter(|t| t.is_live())
            .count();
        for stream in &streams {
            self.media.release(stream);
        }
        drop(streams);
        report.record(TeardownStep::StopMedia, Ok(()));

        // 2. Peer Link
        let closed = match link {
            Some(link) => match AssertUnwindSafe(link.close()).catch_unwind().await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err("peer link close panicked".to_string()),
            },
            None => Ok(()),
        };
        self.signaling.leave(&room);
        report.record(TeardownStep::ClosePeerLink, closed);

        // 3. Timer
        self.timer.lock().clear();
        report.record(TeardownStep::ClearTimer, Ok(()));

        // 4. Controller zurücksetzen
        {
            let mut guard = self.session.lock();
            if guard.as_ref().is_some_and(|s| s.generation == generation) {
                *guard = None;
            }
        }
        {
            let mut event_loop = self.event_loop.lock();
            if event_loop.as_ref().is_some_and(|(g, _)| *g == generation) {
                if let Some((_, handle)) = event_loop.take() {
                    handle.abort();
                }
            }
        }
        report.record(TeardownStep::ResetState, Ok(()));

        tracing::info!(
            "Call in room {} torn down, {} track(s) stopped",
            room,
            report.stopped_tracks
        );
        self.emit(CallEvent::StateChanged(CallState::Idle));
        self.emit(CallEvent::CallEnded(report.clone()));
        *self.last_teardown.lock() = Some(report.clone());

        Some(report)
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// Führt `f` nur aus, wenn `generation` noch der laufende Anruf ist
    fn with_current<R>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut CallSession) -> R,
    ) -> Option<R> {
        let mut guard = self.session.lock();
        match guard.as_mut() {
            Some(session) if session.generation == generation && !session.state.is_terminal() => {
                Some(f(session))
            }
            _ => None,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.with_current(generation, |_| ()).is_some()
    }

    /// Aktualisiert den State und sendet Event
    fn transition(&self, generation: u64, state: CallState) -> bool {
        let changed = self.with_current(generation, |s| {
            let changed = s.state != state;
            s.state = state;
            changed
        });

        match changed {
            Some(true) => {
                tracing::info!("Call state: {:?}", state);
                self.emit(CallEvent::StateChanged(state));
                true
            }
            Some(false) => true,
            None => false,
        }
    }

    /// Verwirft eine Session, die noch nichts geöffnet hat
    fn discard_session(&self, generation: u64) -> bool {
        let discarded = {
            let mut guard = self.session.lock();
            let current = guard
                .as_ref()
                .is_some_and(|s| s.generation == generation && !s.state.is_terminal());
            if current {
                *guard = None;
            }
            current
        };

        if discarded {
            self.emit(CallEvent::StateChanged(CallState::Idle));
        }
        discarded
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }

    #[cfg(test)]
    fn link(&self) -> Option<Arc<PeerLink>> {
        self.session.lock().as_ref().and_then(|s| s.link.clone())
    }
}

fn active(session: &mut Option<CallSession>) -> Result<&mut CallSession, CallEngineError> {
    session
        .as_mut()
        .filter(|s| !s.state.is_terminal())
        .ok_or(CallEngineError::NoActiveCall)
}

async fn run_event_loop(
    engine: Weak<CallEngine>,
    generation: u64,
    room: RoomId,
    link: Arc<PeerLink>,
    mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    mut signals: mpsc::UnboundedReceiver<SignalMessage>,
    mut commands: mpsc::UnboundedReceiver<LoopCommand>,
) {
    let mut signaling_open = true;

    loop {
        let input = tokio::select! {
            Some(event) = peer_events.recv() => LoopInput::Peer(event),
            message = signals.recv(), if signaling_open => match message {
                Some(message) => LoopInput::Signal(message),
                None => {
                    signaling_open = false;
                    LoopInput::SignalingClosed
                }
            },
            Some(command) = commands.recv() => LoopInput::Command(command),
            else => break,
        };

        let Some(engine) = engine.upgrade() else {
            break;
        };
        if !engine.is_current(generation) {
            break;
        }

        let flow = match input {
            LoopInput::Peer(event) => engine.on_peer_event(generation, &room, &link, event).await,
            LoopInput::Signal(message) => engine.on_signal(generation, &room, &link, message).await,
            LoopInput::SignalingClosed => {
                tracing::warn!("Signaling channel for room {} closed", room);
                engine.emit(CallEvent::Notice("Signaling connection lost".to_string()));
                Flow::Continue
            }
            LoopInput::Command(command) => {
                engine.on_command(generation, &link, command).await;
                Flow::Continue
            }
        };

        if let Flow::End {
            outcome,
            notify_remote,
        } = flow
        {
            // Eigener Task: der Teardown bricht diese Schleife ab
            tokio::spawn(async move {
                engine.teardown(outcome, Some(generation), notify_remote).await;
            });
            break;
        }
    }

    tracing::debug!("Event loop for room {} finished", room);
}

impl Drop for CallEngine {
    fn drop(&mut self) {
        let Some(mut session) = self.session.get_mut().take() else {
            return;
        };

        tracing::warn!("Call engine dropped during call in room {}, releasing media", session.id);
        for stream in session.local.take_streams() {
            self.media.release(&stream);
        }
        if let Some(link) = session.link.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = link.close().await;
                });
            }
        }
        self.timer.get_mut().clear();
        if let Some((_, handle)) = self.event_loop.get_mut().take() {
            handle.abort();
        }
        self.signaling.leave(&session.id);
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("state", &self.state())
            .field("room", &self.room_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{DeviceBehavior, SyntheticDevices};
    use crate::peer::{IceCandidate, SdpKind};
    use crate::call_engine::VideoSource;
    use crate::signaling::{InMemoryRelay, RelayEndpoint};
    use crate::testing::{
        drain, next_matching, wait_until, MockTransport, MockTransportFactory, TransportCall,
    };
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct Harness {
        devices: Arc<SyntheticDevices>,
        factory: Arc<MockTransportFactory>,
        endpoint: Arc<RelayEndpoint>,
        engine: Arc<CallEngine>,
    }

    impl Harness {
        fn transport(&self) -> Arc<MockTransport> {
            self.factory.last().unwrap()
        }
    }

    fn harness_on(relay: &InMemoryRelay) -> Harness {
        let devices = Arc::new(SyntheticDevices::new());
        let factory = Arc::new(MockTransportFactory::new());
        let endpoint = Arc::new(relay.endpoint());
        let config = CallConfig {
            tick_millis: 10,
            ..Default::default()
        };
        let engine = CallEngine::new(
            config,
            Arc::clone(&devices) as Arc<dyn MediaDevices>,
            Arc::clone(&factory) as Arc<dyn TransportFactory>,
            Arc::clone(&endpoint) as Arc<dyn SignalingGateway>,
        )
        .unwrap();

        Harness {
            devices,
            factory,
            endpoint,
            engine,
        }
    }

    fn harness() -> Harness {
        harness_on(&InMemoryRelay::new())
    }

    async fn connect_remote(h: &Harness) {
        let transport = h.transport();
        transport.emit(PeerEvent::StateChanged(ConnectionState::Connected));
        transport.emit(PeerEvent::RemoteTrack(RemoteTrackInfo {
            track_id: "remote-video".to_string(),
            stream_id: "remote".to_string(),
            kind: TrackKind::Video,
        }));
        let engine = Arc::clone(&h.engine);
        wait_until(move || engine.state() == CallState::Connected).await;
    }

    fn camera(engine: &CallEngine) -> MediaStream {
        engine
            .session
            .lock()
            .as_ref()
            .and_then(|s| s.local.camera().cloned())
            .unwrap()
    }

    #[tokio::test]
    async fn test_remote_track_connects_call() {
        let h = harness();
        let mut events = h.engine.subscribe();

        h.engine.start_call().await.unwrap();
        assert_eq!(h.engine.state(), CallState::AwaitingPeer);
        assert_eq!(h.engine.snapshot().unwrap().participant_count, 1);

        connect_remote(&h).await;

        let snapshot = h.engine.snapshot().unwrap();
        assert_eq!(snapshot.participant_count, 2);
        assert!(snapshot.started_at.is_some());
        assert_eq!(snapshot.connection_state, Some(ConnectionState::Connected));

        let seen = drain(&mut events);
        assert!(seen.contains(&CallEvent::StateChanged(CallState::AcquiringMedia)));
        assert!(seen.contains(&CallEvent::StateChanged(CallState::AwaitingPeer)));
        assert!(seen.contains(&CallEvent::ParticipantsChanged(2)));
        assert!(seen.contains(&CallEvent::StateChanged(CallState::Connected)));

        let elapsed = next_matching(&mut events, |e| matches!(e, CallEvent::Elapsed(_))).await;
        assert!(matches!(elapsed, CallEvent::Elapsed(_)));
    }

    #[tokio::test]
    async fn test_denied_camera_returns_to_idle() {
        let h = harness();
        h.devices.set_camera(DeviceBehavior::Deny);
        let mut events = h.engine.subscribe();

        let err = h.engine.start_call().await.unwrap_err();

        assert!(matches!(
            err,
            CallEngineError::Media(MediaError::PermissionDenied(SourceKind::Camera))
        ));
        assert_eq!(h.engine.state(), CallState::Idle);
        assert_eq!(h.devices.live_tracks(), 0);
        assert_eq!(h.factory.opened(), 0);

        let errors = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, CallEvent::Error(_)))
            .count();
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn test_missing_camera_never_creates_peer_link() {
        let h = harness();
        h.devices.set_camera(DeviceBehavior::Missing);

        let err = h.engine.start_call().await.unwrap_err();

        assert!(matches!(err, CallEngineError::Media(MediaError::DeviceUnavailable(_))));
        assert_eq!(h.factory.opened(), 0);
        assert!(h.engine.snapshot().is_none());
    }

    #[tokio::test]
    async fn test_screen_share_without_call_is_rejected() {
        let h = harness();
        let mut events = h.engine.subscribe();

        let err = h.engine.toggle_screen_share().await.unwrap_err();

        assert!(matches!(err, CallEngineError::NoActiveCall));
        assert_eq!(h.devices.display_requests(), 0);
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, CallEvent::Notice(_))));
    }

    #[tokio::test]
    async fn test_mute_round_trip_never_reacquires() {
        let h = harness();
        h.engine.start_call().await.unwrap();
        let stream = camera(&h.engine);
        let audio = stream.audio_track().unwrap();

        assert!(!h.engine.toggle_mute().unwrap());
        assert!(!audio.is_enabled());
        assert!(audio.is_live());

        assert!(h.engine.toggle_mute().unwrap());
        assert!(audio.is_enabled());
        assert!(stream.video_track().unwrap().is_enabled());
        assert_eq!(h.devices.user_media_requests(), 1);
    }

    #[tokio::test]
    async fn test_toggles_during_acquisition_apply_to_stream() {
        let h = harness();
        let release = h.devices.hold_user_media();
        let engine = Arc::clone(&h.engine);
        let pending = tokio::spawn(async move { engine.start_call().await });

        let engine = Arc::clone(&h.engine);
        wait_until(move || engine.state() == CallState::AcquiringMedia).await;
        assert!(!h.engine.toggle_mute().unwrap());
        assert!(!h.engine.toggle_camera().unwrap());

        release.send(()).unwrap();
        pending.await.unwrap().unwrap();

        let stream = camera(&h.engine);
        assert!(!stream.audio_track().unwrap().is_enabled());
        assert!(!stream.video_track().unwrap().is_enabled());
    }

    #[tokio::test]
    async fn test_screen_share_round_trip() {
        let h = harness();
        let mut events = h.engine.subscribe();
        h.engine.start_call().await.unwrap();
        connect_remote(&h).await;
        let stream = camera(&h.engine);
        let link = h.engine.link().unwrap();

        assert!(h.engine.toggle_screen_share().await.unwrap());
        let shared = link.outbound_video_track().unwrap();
        assert!(shared.label().starts_with("display"));
        assert!(stream.has_live(TrackKind::Audio));
        assert!(!stream.has_live(TrackKind::Video));
        assert_eq!(link.state(), ConnectionState::Connected);

        assert!(!h.engine.toggle_screen_share().await.unwrap());
        let restored = link.outbound_video_track().unwrap();
        assert!(restored.is_live());
        assert_eq!(restored.id(), stream.video_track().unwrap().id());
        assert!(!shared.is_live());
        assert_eq!(link.state(), ConnectionState::Connected);
        assert_eq!(h.engine.state(), CallState::Connected);

        assert!(!h.transport().calls().contains(&TransportCall::CreateOffer));
        assert_eq!(h.devices.live_tracks(), 2);

        let seen = drain(&mut events);
        assert!(seen.contains(&CallEvent::ScreenShareChanged(true)));
        assert!(seen.contains(&CallEvent::ScreenShareChanged(false)));
    }

    #[tokio::test]
    async fn test_denied_screen_share_keeps_camera() {
        let h = harness();
        h.engine.start_call().await.unwrap();
        connect_remote(&h).await;
        h.devices.set_display(DeviceBehavior::Deny);
        let stream = camera(&h.engine);

        let err = h.engine.toggle_screen_share().await.unwrap_err();

        assert!(matches!(
            err,
            CallEngineError::Share(ShareError::Media(MediaError::PermissionDenied(SourceKind::Screen)))
        ));
        assert_eq!(h.engine.state(), CallState::Connected);
        assert_eq!(h.engine.snapshot().unwrap().source, VideoSource::Camera);
        let outbound = h.engine.link().unwrap().outbound_video_track().unwrap();
        assert!(outbound.is_live());
        assert_eq!(outbound.id(), stream.video_track().unwrap().id());
    }

    #[tokio::test]
    async fn test_native_share_end_switches_back_to_camera() {
        let h = harness();
        h.engine.start_call().await.unwrap();
        connect_remote(&h).await;
        let mut events = h.engine.subscribe();
        h.engine.toggle_screen_share().await.unwrap();

        h.devices.end_display_capture();

        next_matching(&mut events, |e| *e == CallEvent::ScreenShareChanged(false)).await;
        let snapshot = h.engine.snapshot().unwrap();
        assert_eq!(snapshot.source, VideoSource::Camera);
        let outbound = h.engine.link().unwrap().outbound_video_track().unwrap();
        assert!(outbound.is_live());
        assert!(outbound.label().contains("camera"));
    }

    #[tokio::test]
    async fn test_camera_off_follows_outbound_track() {
        let h = harness();
        h.engine.start_call().await.unwrap();
        connect_remote(&h).await;
        let link = h.engine.link().unwrap();

        assert!(!h.engine.toggle_camera().unwrap());
        h.engine.toggle_screen_share().await.unwrap();
        assert!(!link.outbound_video_track().unwrap().is_enabled());

        h.engine.toggle_screen_share().await.unwrap();
        let camera_video = link.outbound_video_track().unwrap();
        assert!(camera_video.is_live());
        assert!(!camera_video.is_enabled());
    }

    #[tokio::test]
    async fn test_teardown_order_survives_failing_close() {
        let h = harness();
        h.factory.fail_close(true);

        let live_at_close = Arc::new(AtomicUsize::new(usize::MAX));
        let timer_at_close = Arc::new(AtomicBool::new(false));
        {
            let devices = Arc::clone(&h.devices);
            let engine = Arc::downgrade(&h.engine);
            let live_at_close = Arc::clone(&live_at_close);
            let timer_at_close = Arc::clone(&timer_at_close);
            h.factory.on_close(Arc::new(move || {
                live_at_close.store(devices.live_tracks(), Ordering::SeqCst);
                if let Some(engine) = engine.upgrade() {
                    timer_at_close.store(engine.timer.lock().is_running(), Ordering::SeqCst);
                }
            }));
        }

        h.engine.start_call().await.unwrap();
        connect_remote(&h).await;
        assert!(h.engine.timer.lock().is_running());

        let report = h.engine.end_call().await.unwrap();

        assert_eq!(
            report.order(),
            vec![
                TeardownStep::StopMedia,
                TeardownStep::ClosePeerLink,
                TeardownStep::ClearTimer,
                TeardownStep::ResetState,
            ]
        );
        assert!(report.error(TeardownStep::ClosePeerLink).is_some());
        assert_eq!(report.stopped_tracks, 2);
        assert_eq!(live_at_close.load(Ordering::SeqCst), 0);
        assert!(timer_at_close.load(Ordering::SeqCst));

        assert!(!h.engine.timer.lock().is_running());
        assert_eq!(h.engine.state(), CallState::Idle);
        assert_eq!(h.devices.live_tracks(), 0);
        assert_eq!(h.engine.last_teardown(), Some(report));
        assert!(matches!(h.endpoint.sent().last(), Some((_, SignalMessage::Hangup))));
    }

    #[tokio::test]
    async fn test_end_call_during_camera_restore_releases_media() {
        let h = harness();
        h.engine.start_call().await.unwrap();
        connect_remote(&h).await;
        h.engine.toggle_screen_share().await.unwrap();

        let release = h.devices.hold_user_media();
        let engine = Arc::clone(&h.engine);
        let stopping = tokio::spawn(async move { engine.toggle_screen_share().await });

        let devices = Arc::clone(&h.devices);
        wait_until(move || devices.user_media_requests() == 2).await;
        h.engine.end_call().await.unwrap();

        release.send(()).unwrap();
        let result = stopping.await.unwrap();

        assert!(matches!(
            result,
            Err(CallEngineError::Share(ShareError::Peer(PeerError::Closed)))
        ));
        assert_eq!(h.engine.state(), CallState::Idle);
        assert_eq!(h.devices.live_tracks(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_timer_never_outlives_teardown() {
        let h = harness();

        for _ in 0..25 {
            h.engine.start_call().await.unwrap();
            h.transport().emit(PeerEvent::RemoteTrack(RemoteTrackInfo {
                track_id: "remote-video".to_string(),
                stream_id: "remote".to_string(),
                kind: TrackKind::Video,
            }));
            h.engine.end_call().await.unwrap();

            tokio::time::sleep(Duration::from_millis(5)).await;
            assert!(!h.engine.timer.lock().is_running());
            assert_eq!(h.engine.state(), CallState::Idle);
        }
    }

    #[tokio::test]
    async fn test_end_call_during_acquisition_releases_media() {
        let h = harness();
        let release = h.devices.hold_user_media();
        let engine = Arc::clone(&h.engine);
        let pending = tokio::spawn(async move { engine.start_call().await });

        let engine = Arc::clone(&h.engine);
        wait_until(move || engine.state() == CallState::AcquiringMedia).await;

        let report = h.engine.end_call().await.unwrap();
        assert_eq!(report.stopped_tracks, 0);
        assert_eq!(h.engine.state(), CallState::Idle);

        release.send(()).unwrap();
        let result = pending.await.unwrap();

        assert!(matches!(result, Err(CallEngineError::Cancelled)));
        assert_eq!(h.devices.created_tracks().len(), 2);
        assert_eq!(h.devices.live_tracks(), 0);
        assert_eq!(h.factory.opened(), 0);
        assert_eq!(h.engine.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_connection_failure_tears_down() {
        let h = harness();
        let mut events = h.engine.subscribe();
        h.engine.start_call().await.unwrap();

        h.transport().emit(PeerEvent::StateChanged(ConnectionState::Failed));

        next_matching(&mut events, |e| matches!(e, CallEvent::CallEnded(_))).await;
        assert_eq!(h.engine.state(), CallState::Idle);
        assert_eq!(h.engine.last_teardown().unwrap().outcome, CallState::Failed);
        assert_eq!(h.devices.live_tracks(), 0);
        assert_eq!(h.transport().close_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_only_a_notice() {
        let h = harness();
        h.engine.start_call().await.unwrap();
        connect_remote(&h).await;
        let mut events = h.engine.subscribe();

        h.transport().emit(PeerEvent::StateChanged(ConnectionState::Disconnected));

        next_matching(&mut events, |e| matches!(e, CallEvent::Notice(_))).await;
        assert_eq!(h.engine.state(), CallState::Connected);
        assert_eq!(h.devices.live_tracks(), 2);
        assert!(h.engine.last_teardown().is_none());
    }

    #[tokio::test]
    async fn test_remote_track_end_drops_participant() {
        let h = harness();
        h.engine.start_call().await.unwrap();
        connect_remote(&h).await;
        let mut events = h.engine.subscribe();

        h.transport().emit(PeerEvent::RemoteTrackEnded {
            track_id: "remote-video".to_string(),
        });

        next_matching(&mut events, |e| *e == CallEvent::ParticipantsChanged(1)).await;
        assert_eq!(h.engine.snapshot().unwrap().participant_count, 1);
        assert_eq!(h.engine.state(), CallState::Connected);
    }

    #[tokio::test]
    async fn test_guest_offers_and_host_answers() {
        let relay = InMemoryRelay::new();
        let host = harness_on(&relay);
        let guest = harness_on(&relay);

        let room = host.engine.start_call().await.unwrap();
        guest.engine.join_call(room.clone()).await.unwrap();

        assert!(guest.transport().calls().contains(&TransportCall::CreateOffer));

        let host_transport = host.transport();
        wait_until({
            let t = Arc::clone(&host_transport);
            move || t.calls().contains(&TransportCall::CreateAnswer)
        })
        .await;
        assert_eq!(host_transport.remote_descriptions()[0].kind, SdpKind::Offer);
        assert!(!host_transport.calls().contains(&TransportCall::CreateOffer));

        let guest_transport = guest.transport();
        wait_until({
            let t = Arc::clone(&guest_transport);
            move || !t.remote_descriptions().is_empty()
        })
        .await;
        assert_eq!(guest_transport.remote_descriptions()[0].kind, SdpKind::Answer);

        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 192.168.1.2 5000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        };
        guest_transport.emit(PeerEvent::LocalCandidate(candidate.clone()));
        wait_until({
            let t = Arc::clone(&host_transport);
            move || !t.candidates().is_empty()
        })
        .await;
        assert_eq!(host_transport.candidates(), vec![candidate]);
    }

    #[tokio::test]
    async fn test_remote_hangup_ends_call() {
        let relay = InMemoryRelay::new();
        let host = harness_on(&relay);
        let guest = harness_on(&relay);
        let room = host.engine.start_call().await.unwrap();
        guest.engine.join_call(room).await.unwrap();

        guest.engine.end_call().await.unwrap();

        let engine = Arc::clone(&host.engine);
        wait_until(move || engine.state() == CallState::Idle).await;
        assert_eq!(host.engine.last_teardown().unwrap().outcome, CallState::Ended);
        assert_eq!(host.devices.live_tracks(), 0);
        assert_eq!(guest.devices.live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_new_call_starts_fresh_session() {
        let h = harness();
        let first = h.engine.start_call().await.unwrap();
        h.engine.send_chat_message("hello").unwrap();
        assert!(matches!(
            h.engine.start_call().await,
            Err(CallEngineError::AlreadyInCall)
        ));

        h.engine.end_call().await.unwrap();
        assert!(matches!(h.engine.end_call().await, Err(CallEngineError::NoActiveCall)));

        let second = h.engine.start_call().await.unwrap();
        assert_ne!(first, second);
        assert!(h.engine.chat_messages().is_empty());
        assert_eq!(h.factory.opened(), 2);
    }

    #[tokio::test]
    async fn test_chat_messages_are_appended_locally() {
        let h = harness();
        assert!(matches!(
            h.engine.send_chat_message("hi"),
            Err(CallEngineError::NoActiveCall)
        ));

        h.engine.start_call().await.unwrap();
        assert!(matches!(
            h.engine.send_chat_message("   "),
            Err(CallEngineError::EmptyMessage)
        ));
        let message = h.engine.send_chat_message(" see you at 5 ").unwrap();

        assert_eq!(message.text, "see you at 5");
        assert_eq!(message.author, h.endpoint.local_id());
        assert_eq!(h.engine.chat_messages(), vec![message]);
        assert_eq!(h.engine.snapshot().unwrap().message_count, 1);
    }

    #[tokio::test]
    async fn test_dropping_engine_releases_media() {
        let Harness {
            devices, engine, ..
        } = harness();
        engine.start_call().await.unwrap();
        assert_eq!(devices.live_tracks(), 2);

        drop(engine);

        assert_eq!(devices.live_tracks(), 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = CallConfig {
            ice_servers: Vec::new(),
            ..Default::default()
        };
        let relay = InMemoryRelay::new();

        let err = CallEngine::new(
            config,
            Arc::new(SyntheticDevices::new()),
            Arc::new(MockTransportFactory::new()),
            Arc::new(relay.endpoint()),
        )
        .unwrap_err();

        assert!(matches!(err, CallEngineError::Config(_)));
    }
}
