//! Test-Doubles für die Transport-Schicht
//!
//! `MockTransport` zeichnet jeden Aufruf auf und lässt Tests Events der
//! Verbindung (Remote-Track, Zustandswechsel, Candidates) auslösen. Dazu ein
//! paar Warte-Helfer für asynchrone Abläufe.

use crate::media::MediaTrack;
use crate::peer::{
    IceCandidate, IceServer, PeerError, PeerEvent, PeerTransport, SenderId, SessionDescription,
    TransportFactory,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

const WAIT_LIMIT: Duration = Duration::from_secs(2);

pub type CloseHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCall {
    AddTrack,
    ReplaceTrack,
    CreateOffer,
    CreateAnswer,
    SetRemote,
    AddCandidate,
    Close,
}

pub struct MockTransport {
    events: mpsc::UnboundedSender<PeerEvent>,
    calls: Mutex<Vec<TransportCall>>,
    added: Mutex<Vec<String>>,
    replaced: Mutex<Vec<String>>,
    candidates: Mutex<Vec<IceCandidate>>,
    remote: Mutex<Vec<SessionDescription>>,
    next_sender: AtomicU64,
    close_count: AtomicUsize,
    fail_close: bool,
    on_close: Option<CloseHook>,
}

impl MockTransport {
    /// Simuliert ein Event der Verbindung
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    pub fn added_tracks(&self) -> Vec<String> {
        self.added.lock().clone()
    }

    pub fn replaced_tracks(&self) -> Vec<String> {
        self.replaced.lock().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<SenderId, PeerError> {
        self.record(TransportCall::AddTrack);
        self.added.lock().push(track.id().to_string());
        Ok(SenderId(self.next_sender.fetch_add(1, Ordering::SeqCst)))
    }

    async fn replace_track(&self, _sender: SenderId, track: &MediaTrack) -> Result<(), PeerError> {
        self.record(TransportCall::ReplaceTrack);
        self.replaced.lock().push(track.id().to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.record(TransportCall::CreateOffer);
        Ok(SessionDescription::offer("v=0\r\no=mock-offer\r\n"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.record(TransportCall::CreateAnswer);
        Ok(SessionDescription::answer("v=0\r\no=mock-answer\r\n"))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.record(TransportCall::SetRemote);
        self.remote.lock().push(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.record(TransportCall::AddCandidate);
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.record(TransportCall::Close);
        self.close_count.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = &self.on_close {
            hook();
        }
        if self.fail_close {
            return Err(PeerError::Transport("close failed".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MockTransportFactory {
    transports: Mutex<Vec<Arc<MockTransport>>>,
    fail_open: AtomicBool,
    fail_close: AtomicBool,
    on_close: Mutex<Option<CloseHook>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// `close()` der folgenden Transports schlägt fehl
    pub fn fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Wird in `close()` der folgenden Transports aufgerufen
    pub fn on_close(&self, hook: CloseHook) {
        *self.on_close.lock() = Some(hook);
    }

    pub fn last(&self) -> Option<Arc<MockTransport>> {
        self.transports.lock().last().cloned()
    }

    pub fn opened(&self) -> usize {
        self.transports.lock().len()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn open(
        &self,
        _ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(PeerError::Transport("open failed".to_string()));
        }

        let transport = Arc::new(MockTransport {
            events,
            calls: Mutex::new(Vec::new()),
            added: Mutex::new(Vec::new()),
            replaced: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            remote: Mutex::new(Vec::new()),
            next_sender: AtomicU64::new(1),
            close_count: AtomicUsize::new(0),
            fail_close: self.fail_close.load(Ordering::SeqCst),
            on_close: self.on_close.lock().clone(),
        });
        self.transports.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

// ============================================================================
// WAIT HELPERS
// ============================================================================

/// Wartet, bis `condition` erfüllt ist
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(WAIT_LIMIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "condition not reached within {WAIT_LIMIT:?}");
}

/// Alle bereits anstehenden Events
pub fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }
    items
}

/// Wartet auf das erste Event, das `matches` erfüllt
pub async fn next_matching<T: Clone>(
    rx: &mut broadcast::Receiver<T>,
    mut matches: impl FnMut(&T) -> bool,
) -> T {
    let found = tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            match rx.recv().await {
                Ok(item) if matches(&item) => return Some(item),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await;

    match found {
        Ok(Some(item)) => item,
        _ => panic!("no matching event within {WAIT_LIMIT:?}"),
    }
}
