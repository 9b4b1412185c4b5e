//! Connection Orchestrator
//!
//! Besitzt die eine Peer Connection eines Anrufs (`PeerLink`), bindet die
//! lokalen Tracks, puffert ICE Candidates bis zur Remote Description und
//! führt die Zustandsmaschine der Verbindung.

use super::transport::{
    ConnectionState, IceCandidate, IceServer, PeerError, PeerEvent, PeerTransport,
    RemoteTrackInfo, SdpKind, SenderId, SessionDescription, TransportFactory,
};
use crate::media::{MediaStream, MediaTrack, TrackKind};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

// ============================================================================
// REMOTE STREAM
// ============================================================================

/// Stream der Gegenseite, entsteht mit dem ersten eingehenden Track
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrackInfo>,
}

#[derive(Debug)]
struct LinkShared {
    state: Mutex<ConnectionState>,
    remote_stream: Mutex<Option<RemoteStream>>,
}

impl LinkShared {
    /// Aktualisiert den Link-Zustand. `None` = Event wird verworfen.
    fn observe(&self, event: PeerEvent) -> Option<PeerEvent> {
        match &event {
            PeerEvent::StateChanged(next) => {
                let mut state = self.state.lock();
                if !state.accepts(*next) {
                    tracing::debug!("Ignoring connection state {:?} after {:?}", next, *state);
                    return None;
                }
                *state = *next;
            }
            PeerEvent::RemoteTrack(info) => {
                let mut remote = self.remote_stream.lock();
                let stream = remote.get_or_insert_with(|| RemoteStream {
                    id: info.stream_id.clone(),
                    tracks: Vec::new(),
                });
                if stream.tracks.iter().any(|t| t.track_id == info.track_id) {
                    return None;
                }
                stream.tracks.push(info.clone());
            }
            PeerEvent::RemoteTrackEnded { track_id } => {
                let mut remote = self.remote_stream.lock();
                let stream = remote.as_mut()?;
                let before = stream.tracks.len();
                stream.tracks.retain(|t| &t.track_id != track_id);
                if stream.tracks.len() == before {
                    return None;
                }
            }
            PeerEvent::LocalCandidate(_) => {}
        }
        Some(event)
    }
}

#[derive(Default)]
struct PendingCandidates {
    remote_description_set: bool,
    queue: Vec<IceCandidate>,
}

// ============================================================================
// PEER LINK
// ============================================================================

/// Die eine Verbindung zur Gegenseite
pub struct PeerLink {
    id: String,
    transport: Arc<dyn PeerTransport>,
    shared: Arc<LinkShared>,
    senders: Mutex<HashMap<TrackKind, SenderId>>,
    outbound_video: Mutex<Weak<MediaTrack>>,
    pending: Mutex<PendingCandidates>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PeerLink {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.shared.remote_stream.lock().clone()
    }

    /// Anzahl laufender Remote-Tracks
    pub fn remote_track_count(&self) -> usize {
        self.shared
            .remote_stream
            .lock()
            .as_ref()
            .map(|s| s.tracks.len())
            .unwrap_or(0)
    }

    /// Aktuell gesendeter Video-Track (Referenz, kein Besitz)
    pub fn outbound_video_track(&self) -> Option<Arc<MediaTrack>> {
        self.outbound_video.lock().upgrade()
    }

    /// Bindet jeden laufenden Track des Streams an einen Sender-Slot.
    /// Muss vor dem ersten Offer abgeschlossen sein.
    pub async fn attach_local_tracks(&self, stream: &MediaStream) -> Result<(), PeerError> {
        self.ensure_open()?;

        for track in stream.tracks().into_iter().filter(|t| t.is_live()) {
            let sender = self.transport.add_track(&track).await?;
            self.senders.lock().insert(track.kind(), sender);
            if track.kind() == TrackKind::Video {
                *self.outbound_video.lock() = Arc::downgrade(&track);
            }
            tracing::debug!("Attached {} track {} to {:?}", track.kind(), track.id(), sender);
        }

        Ok(())
    }

    /// Erstellt das Offer (ausgehende Seite)
    pub async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        self.begin_negotiation();
        self.transport.create_offer().await
    }

    /// Setzt das Offer der Gegenseite und erstellt das Answer
    pub async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        if offer.kind != SdpKind::Offer {
            return Err(PeerError::InvalidSdp("expected an offer".to_string()));
        }

        self.begin_negotiation();
        self.transport.set_remote_description(offer).await?;
        self.flush_candidates().await?;
        self.transport.create_answer().await
    }

    /// Setzt das Answer der Gegenseite
    pub async fn apply_answer(&self, answer: SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;
        if answer.kind != SdpKind::Answer {
            return Err(PeerError::InvalidSdp("expected an answer".to_string()));
        }

        self.transport.set_remote_description(answer).await?;
        self.flush_candidates().await
    }

    /// Nimmt einen Candidate der Gegenseite an. Vor der Remote Description
    /// wird er gepuffert.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.ensure_open()?;
        {
            let mut pending = self.pending.lock();
            if !pending.remote_description_set {
                tracing::debug!("Queueing remote candidate until remote description is set");
                pending.queue.push(candidate);
                return Ok(());
            }
        }
        self.transport.add_ice_candidate(candidate).await
    }

    /// Gepufferte Candidates (nur für Diagnose)
    pub fn pending_candidates(&self) -> usize {
        self.pending.lock().queue.len()
    }

    /// Ersetzt den ausgehenden Video-Track (Track Replacement, keine
    /// Neuverhandlung)
    pub async fn replace_video_track(&self, track: &Arc<MediaTrack>) -> Result<(), PeerError> {
        self.ensure_open()?;

        let sender = self
            .senders
            .lock()
            .get(&TrackKind::Video)
            .copied()
            .ok_or(PeerError::NoSender(TrackKind::Video))?;

        self.transport.replace_track(sender, track).await?;
        *self.outbound_video.lock() = Arc::downgrade(track);
        tracing::info!("Outbound video switched to {} ({})", track.id(), track.label());
        Ok(())
    }

    /// Schließt die Verbindung. Mehrfache Aufrufe sind wirkungslos.
    pub async fn close(&self) -> Result<(), PeerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        *self.shared.state.lock() = ConnectionState::Closed;
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }

        tracing::info!("Closing peer link {}", self.id);
        self.transport.close().await
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.is_closed() {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }

    fn begin_negotiation(&self) {
        let mut state = self.shared.state.lock();
        if *state == ConnectionState::New {
            *state = ConnectionState::Connecting;
        }
    }

    async fn flush_candidates(&self) -> Result<(), PeerError> {
        let queued = {
            let mut pending = self.pending.lock();
            pending.remote_description_set = true;
            std::mem::take(&mut pending.queue)
        };

        if !queued.is_empty() {
            tracing::debug!("Applying {} queued remote candidates", queued.len());
        }
        for candidate in queued {
            self.transport.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct ConnectionOrchestrator {
    factory: Arc<dyn TransportFactory>,
}

impl ConnectionOrchestrator {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self { factory }
    }

    /// Erstellt einen neuen `PeerLink` samt Event-Receiver
    pub async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(PeerLink, mpsc::UnboundedReceiver<PeerEvent>), PeerError> {
        if ice_servers.is_empty() {
            return Err(PeerError::NoIceServers);
        }

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
        let transport = self.factory.open(ice_servers, raw_tx).await?;

        let shared = Arc::new(LinkShared {
            state: Mutex::new(ConnectionState::New),
            remote_stream: Mutex::new(None),
        });

        // Link-Zustand zuerst aktualisieren, dann an den Controller
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let forward_shared = Arc::clone(&shared);
        let forwarder = tokio::spawn(async move {
            while let Some(event) = raw_rx.recv().await {
                if let Some(event) = forward_shared.observe(event) {
                    if event_tx.send(event).is_err() {
                        break;
                    }
                }
            }
        });

        let link = PeerLink {
            id: Uuid::new_v4().to_string(),
            transport,
            shared,
            senders: Mutex::new(HashMap::new()),
            outbound_video: Mutex::new(Weak::new()),
            pending: Mutex::new(PendingCandidates::default()),
            forwarder: Mutex::new(Some(forwarder)),
            closed: AtomicBool::new(false),
        };

        tracing::info!("Peer link {} created with {} ICE server(s)", link.id, ice_servers.len());
        Ok((link, event_rx))
    }
}

impl std::fmt::Debug for ConnectionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionOrchestrator").finish()
    }
}
