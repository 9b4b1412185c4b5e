//! Screen Capture Swapper
//!
//! Tauscht den ausgehenden Video-Track zwischen Kamera und
//! Bildschirmaufnahme. Es wird nur der Track des Senders ersetzt, die
//! Verbindung wird nicht neu verhandelt und Audio läuft weiter.

use crate::media::{MediaError, MediaSourceManager, MediaStream, MediaTrack, SourceKind};
use crate::peer::{PeerError, PeerLink};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShareError {
    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Peer(#[from] PeerError),
}

/// Laufende Bildschirmfreigabe. Beobachtet das Ende der Aufnahme, bis sie
/// gedroppt wird.
pub struct ScreenShare {
    stream: MediaStream,
    watcher: JoinHandle<()>,
}

impl ScreenShare {
    pub fn stream(&self) -> &MediaStream {
        &self.stream
    }
}

impl Drop for ScreenShare {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

impl std::fmt::Debug for ScreenShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScreenShare")
            .field("stream", &self.stream.id())
            .finish()
    }
}

pub struct ScreenCaptureSwapper {
    media: Arc<MediaSourceManager>,
}

impl ScreenCaptureSwapper {
    pub fn new(media: Arc<MediaSourceManager>) -> Self {
        Self { media }
    }

    /// Startet die Freigabe.
    ///
    /// Erst nach erfolgreichem Tausch wird das Kamera-Video gestoppt; schlägt
    /// etwas fehl, bleibt die Kamera unverändert. `on_ended` wird mit der
    /// Stream-ID aufgerufen, wenn die Aufnahme von außen beendet wird
    /// ("Freigabe beenden" im System).
    pub async fn start_share<F>(
        &self,
        link: &PeerLink,
        camera: Option<&MediaStream>,
        on_ended: F,
    ) -> Result<ScreenShare, ShareError>
    where
        F: FnOnce(String) + Send + 'static,
    {
        let screen = self.media.acquire(SourceKind::Screen).await?;

        let Some(video) = screen.video_track() else {
            self.media.release(&screen);
            return Err(MediaError::CaptureFailed("display stream has no video".to_string()).into());
        };

        if let Err(e) = link.replace_video_track(&video).await {
            self.media.release(&screen);
            return Err(e.into());
        }

        if let Some(camera_video) = camera.and_then(MediaStream::video_track) {
            camera_video.stop();
        }

        let stream_id = screen.id().to_string();
        let watcher = tokio::spawn(async move {
            video.ended().await;
            tracing::info!("Screen capture {} ended outside the app", stream_id);
            on_ended(stream_id);
        });

        tracing::info!("Screen share started with stream {}", screen.id());
        Ok(ScreenShare {
            stream: screen,
            watcher,
        })
    }

    /// Beendet die Freigabe und schaltet zurück auf die Kamera. Die
    /// Bildschirmaufnahme wird in jedem Fall geschlossen.
    ///
    /// `camera` ist der Kamera-Stream des Anrufs. Scheitert der Tausch, wird
    /// nur das neu geöffnete Video gestoppt; das Mikrofon gehört weiter dem
    /// Anruf.
    pub async fn stop_share(
        &self,
        link: &PeerLink,
        camera: Option<&MediaStream>,
        share: ScreenShare,
    ) -> Result<MediaStream, ShareError> {
        let screen = share.stream.clone();
        drop(share);

        let restored = self.restore_camera(link, camera).await;
        self.media.release(&screen);

        match &restored {
            Ok(camera) => tracing::info!("Screen share stopped, camera stream {} restored", camera.id()),
            Err(e) => tracing::warn!("Screen share stopped but camera restore failed: {}", e),
        }
        restored
    }

    async fn restore_camera(
        &self,
        link: &PeerLink,
        current: Option<&MediaStream>,
    ) -> Result<MediaStream, ShareError> {
        let camera = self.media.acquire(SourceKind::Camera).await?;
        let Some(video) = camera.video_track().filter(|t| t.is_live()) else {
            self.discard(&camera, current, None);
            return Err(MediaError::DeviceUnavailable("camera has no video track".to_string()).into());
        };

        if let Err(e) = link.replace_video_track(&video).await {
            self.discard(&camera, current, Some(&video));
            return Err(e.into());
        }
        Ok(camera)
    }

    /// Schließt, was `restore_camera` geöffnet hat
    fn discard(
        &self,
        camera: &MediaStream,
        current: Option<&MediaStream>,
        video: Option<&Arc<MediaTrack>>,
    ) {
        if current.is_some_and(|c| c.ptr_eq(camera)) {
            if let Some(video) = video {
                video.stop();
            }
        } else {
            self.media.release(camera);
        }
    }
}

impl std::fmt::Debug for ScreenCaptureSwapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScreenCaptureSwapper").finish()
    }
}
