//! WebRTC Transport
//!
//! `PeerTransport` auf Basis von `webrtc`. Lokale Tracks werden über
//! `TrackLocalStaticSample` gesendet; ein Pump-Task pro Sender-Slot liest
//! die Samples des `MediaTrack` und schreibt sie in die Verbindung.

use super::transport::{
    ConnectionState, IceCandidate, IceServer, PeerError, PeerEvent, PeerTransport,
    RemoteTrackInfo, SdpKind, SenderId, SessionDescription, TransportFactory,
};
use crate::media::{MediaTrack, TrackKind, SAMPLE_RATE};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Stream-ID der lokalen Tracks im SDP
const LOCAL_STREAM_ID: &str = "pulse-meet";

// ============================================================================
// CONVERSIONS
// ============================================================================

impl From<IceServer> for RTCIceServer {
    fn from(server: IceServer) -> Self {
        RTCIceServer {
            urls: server.urls,
            username: server.username.unwrap_or_default(),
            credential: server.credential.unwrap_or_default(),
            ..Default::default()
        }
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                ConnectionState::New
            }
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_m_line_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(|e| PeerError::InvalidSdp(e.to_string()))
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: SAMPLE_RATE,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

fn webrtc_err(e: webrtc::Error) -> PeerError {
    PeerError::Transport(e.to_string())
}

// ============================================================================
// OUTBOUND SLOTS
// ============================================================================

struct OutboundSlot {
    sender: Arc<RTCRtpSender>,
    pump: JoinHandle<()>,
    rtcp: JoinHandle<()>,
}

/// Liest die Samples eines lokalen Tracks und schreibt sie in die Verbindung
fn spawn_pump(track: &MediaTrack, local: Arc<TrackLocalStaticSample>) -> JoinHandle<()> {
    let mut samples = track.subscribe();
    let mut ended_rx = track.ended_signal();
    let track_id = track.id().to_string();

    tokio::spawn(async move {
        // Der `watch::Ref` aus `wait_for` ist nicht `Send` und darf nicht
        // über `write_sample` hinweg leben
        let ended = async move {
            let _ = ended_rx.wait_for(|e| *e).await;
        };
        tokio::pin!(ended);

        loop {
            tokio::select! {
                _ = &mut ended => break,
                received = samples.recv() => match received {
                    Ok(sample) => {
                        let sample = Sample {
                            data: sample.data,
                            duration: sample.duration,
                            ..Default::default()
                        };
                        if let Err(e) = local.write_sample(&sample).await {
                            tracing::warn!("Failed to write sample for {}: {}", track_id, e);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("Pump for {} skipped {} samples", track_id, skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!("Pump for {} finished", track_id);
    })
}

/// RTCP muss gelesen werden, sonst laufen die Interceptors nicht
fn spawn_rtcp_drain(sender: Arc<RTCRtpSender>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    })
}

// ============================================================================
// WEBRTC TRANSPORT
// ============================================================================

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    slots: Mutex<HashMap<SenderId, OutboundSlot>>,
    next_sender: AtomicU64,
    closed: AtomicBool,
}

impl WebRtcTransport {
    fn local_track_for(track: &MediaTrack) -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_string(),
            LOCAL_STREAM_ID.to_string(),
        ))
    }

    /// Registriert Event Handler für die Peer Connection
    fn setup_handlers(pc: &RTCPeerConnection, events: mpsc::UnboundedSender<PeerEvent>) {
        // Connection State Handler
        let state_tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", s);
            let _ = state_tx.send(PeerEvent::StateChanged(s.into()));
            Box::pin(async {})
        }));

        // ICE Candidate Handler
        let candidate_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = candidate_tx.send(PeerEvent::LocalCandidate(init.into()));
                    }
                    Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        // Track Handler (eingehende Medien)
        let track_tx = events;
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            let info = RemoteTrackInfo {
                track_id: track.id(),
                stream_id: track.stream_id(),
                kind,
            };
            tracing::info!("Received remote {} track {}", kind, info.track_id);
            let _ = track_tx.send(PeerEvent::RemoteTrack(info.clone()));

            // Track lesen bis er endet; die Wiedergabe ist Sache der UI
            let ended_tx = track_tx.clone();
            tokio::spawn(async move {
                while track.read_rtp().await.is_ok() {}
                tracing::info!("Remote track {} ended", info.track_id);
                let _ = ended_tx.send(PeerEvent::RemoteTrackEnded {
                    track_id: info.track_id,
                });
            });

            Box::pin(async {})
        }));
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.closed.load(Ordering::Acquire) {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<SenderId, PeerError> {
        self.ensure_open()?;

        let local = Self::local_track_for(track);
        let sender = self
            .pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(webrtc_err)?;

        let id = SenderId(self.next_sender.fetch_add(1, Ordering::SeqCst));
        let slot = OutboundSlot {
            rtcp: spawn_rtcp_drain(Arc::clone(&sender)),
            pump: spawn_pump(track, local),
            sender,
        };
        self.slots.lock().insert(id, slot);
        Ok(id)
    }

    async fn replace_track(&self, sender: SenderId, track: &MediaTrack) -> Result<(), PeerError> {
        self.ensure_open()?;

        let rtp_sender = self
            .slots
            .lock()
            .get(&sender)
            .map(|slot| Arc::clone(&slot.sender))
            .ok_or(PeerError::NoSender(track.kind()))?;

        let local = Self::local_track_for(track);
        rtp_sender
            .replace_track(Some(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(webrtc_err)?;

        let pump = spawn_pump(track, local);
        if let Some(slot) = self.slots.lock().get_mut(&sender) {
            let old = std::mem::replace(&mut slot.pump, pump);
            old.abort();
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;

        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;

        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;

        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;

        let desc = to_rtc_description(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.ensure_open()?;

        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(webrtc_err)
    }

    async fn close(&self) -> Result<(), PeerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        for (_, slot) in self.slots.lock().drain() {
            slot.pump.abort();
            slot.rtcp.abort();
        }

        self.pc.close().await.map_err(webrtc_err)
    }
}

impl std::fmt::Debug for WebRtcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcTransport")
            .field("senders", &self.slots.lock().len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt `WebRtcTransport`s mit Default-Codecs und Interceptors
#[derive(Debug, Default)]
pub struct WebRtcTransportFactory;

impl WebRtcTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn open(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        // Media Engine mit Opus/VP8 konfigurieren
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().cloned().map(RTCIceServer::from).collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_err)?);
        WebRtcTransport::setup_handlers(&pc, events);

        Ok(Arc::new(WebRtcTransport {
            pc,
            slots: Mutex::new(HashMap::new()),
            next_sender: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaSample;

    #[test]
    fn test_state_mapping() {
        assert_eq!(ConnectionState::from(RTCPeerConnectionState::Unspecified), ConnectionState::New);
        assert_eq!(ConnectionState::from(RTCPeerConnectionState::Failed), ConnectionState::Failed);
        assert_eq!(ConnectionState::from(RTCPeerConnectionState::Disconnected), ConnectionState::Disconnected);
    }

    #[test]
    fn test_candidate_conversion_keeps_fields() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: Some("abcd".to_string()),
        };

        let init: RTCIceCandidateInit = candidate.clone().into();
        assert_eq!(IceCandidate::from(init), candidate);
    }

    #[test]
    fn test_turn_credentials_are_forwarded() {
        let server: RTCIceServer = IceServer::turn("turn:relay.example.org:3478", "alice", "secret").into();
        assert_eq!(server.username, "alice");
        assert_eq!(server.credential, "secret");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pump_forwards_samples_until_track_stops() {
        let track = MediaTrack::new(TrackKind::Video, "cam");
        let local = WebRtcTransport::local_track_for(&track);
        let pump = spawn_pump(&track, local);

        for _ in 0..3 {
            assert!(track.push_sample(MediaSample {
                data: bytes::Bytes::from_static(&[0x10, 0x02, 0x00]),
                duration: std::time::Duration::from_millis(33),
            }));
            tokio::task::yield_now().await;
        }
        track.stop();

        tokio::time::timeout(std::time::Duration::from_secs(1), pump)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_offer_advertises_attached_tracks() {
        let (events, _rx) = mpsc::unbounded_channel();
        let transport = WebRtcTransportFactory::new()
            .open(&[IceServer::stun("stun:stun.l.google.com:19302")], events)
            .await
            .unwrap();

        transport.add_track(&MediaTrack::new(TrackKind::Audio, "mic")).await.unwrap();
        transport.add_track(&MediaTrack::new(TrackKind::Video, "cam")).await.unwrap();
        let offer = transport.create_offer().await.unwrap();

        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));

        transport.close().await.unwrap();
        transport.close().await.unwrap();
    }
}
