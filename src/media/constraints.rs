//! Capture-Constraints für Kamera, Mikrofon und Bildschirm

use serde::{Deserialize, Serialize};

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

// ============================================================================
// AUDIO / VIDEO
// ============================================================================

/// Mikrofon-Einstellungen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate: u32,
    pub channel_count: u16,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            sample_rate: SAMPLE_RATE,
            channel_count: CHANNELS,
        }
    }
}

/// Kamera-Einstellungen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
        }
    }
}

/// Anfrage an `get_user_media`. `None` = diese Art nicht anfordern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MediaConstraints {
    pub audio: Option<AudioConstraints>,
    pub video: Option<VideoConstraints>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: Some(VideoConstraints::default()),
        }
    }
}

impl MediaConstraints {
    /// Nur den Video-Teil anfordern (Kamera nach Screen-Share wiederherstellen)
    pub fn video_only(&self) -> Self {
        Self {
            audio: None,
            video: Some(self.video.clone().unwrap_or_default()),
        }
    }
}

// ============================================================================
// DISPLAY
// ============================================================================

/// Anfrage an `get_display_media`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DisplayConstraints {
    pub max_width: u32,
    pub max_height: u32,
    pub frame_rate: u32,
    pub capture_audio: bool,
}

impl Default for DisplayConstraints {
    fn default() -> Self {
        Self {
            max_width: 1920,
            max_height: 1080,
            frame_rate: 15,
            capture_audio: false,
        }
    }
}
