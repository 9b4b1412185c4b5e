//! Konfiguration
//!
//! Wird als JSON aus dem App-Konfigurationsverzeichnis geladen:
//! - Windows: `%APPDATA%/pulse/pulse-meet/config/config.json`
//! - macOS: `~/Library/Application Support/com.pulse.pulse-meet/config.json`
//! - Linux: `~/.config/pulse-meet/config.json`
//!
//! Fehlt die Datei, gelten die Defaults.

use crate::media::{DisplayConstraints, MediaConstraints};
use crate::peer::IceServer;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Überschreibt `signalingUrl` aus der Datei
pub const SIGNALING_URL_ENV: &str = "PULSE_SIGNALING_URL";

const CONFIG_FILE: &str = "config.json";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// ICE SERVER DEFAULTS
// ============================================================================

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServer> {
    vec![
        // Google STUN Server (kostenlos, für ~90% der Verbindungen)
        IceServer {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            username: None,
            credential: None,
        },
    ]
}

// ============================================================================
// CALL CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CallConfig {
    pub ice_servers: Vec<IceServer>,
    pub signaling_url: Option<String>,
    pub media: MediaConstraints,
    pub display: DisplayConstraints,
    /// Takt des Gesprächsdauer-Timers
    pub tick_millis: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            signaling_url: None,
            media: MediaConstraints::default(),
            display: DisplayConstraints::default(),
            tick_millis: 1000,
        }
    }
}

impl CallConfig {
    /// Lädt eine Konfigurationsdatei
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        tracing::info!("Loading config from {:?}", path);
        let raw = fs::read_to_string(path)?;
        let mut config: CallConfig = serde_json::from_str(&raw)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Lädt `config.json` aus dem App-Verzeichnis oder nimmt die Defaults
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                tracing::debug!("No config file found, using defaults");
                let mut config = Self::default();
                config.apply_env();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Pfad der Konfigurationsdatei (falls ein Home-Verzeichnis existiert)
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "pulse", "pulse-meet")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Fügt einen TURN-Server hinzu (nötig hinter symmetrischem NAT)
    pub fn with_turn_server(
        mut self,
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        self.ice_servers.push(IceServer::turn(url, username, credential));
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_millis.max(1))
    }

    /// `true` wenn ein TURN-Relay konfiguriert ist
    pub fn has_relay(&self) -> bool {
        self.ice_servers.iter().any(IceServer::is_relay)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ice_servers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one ICE server is required".to_string(),
            ));
        }

        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(ConfigError::Invalid("ICE server without urls".to_string()));
            }
            for url in &server.urls {
                let scheme_ok = ["stun:", "stuns:", "turn:", "turns:"]
                    .iter()
                    .any(|scheme| url.starts_with(scheme));
                if !scheme_ok {
                    return Err(ConfigError::Invalid(format!("unsupported ICE url {url:?}")));
                }
            }
            if server.is_relay() && (server.username.is_none() || server.credential.is_none()) {
                return Err(ConfigError::Invalid(format!(
                    "TURN server {:?} needs username and credential",
                    server.urls
                )));
            }
        }

        if let Some(url) = &self.signaling_url {
            url::Url::parse(url)
                .map_err(|e| ConfigError::Invalid(format!("signaling url {url:?}: {e}")))?;
        }

        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(SIGNALING_URL_ENV) {
            if !url.trim().is_empty() {
                self.signaling_url = Some(url.trim().to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = CallConfig::default();

        assert!(config.validate().is_ok());
        assert!(!config.has_relay());
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_turn_without_credentials_is_rejected() {
        let mut config = CallConfig::default();
        config.ice_servers.push(IceServer::stun("turn:relay.example.org:3478"));

        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_with_turn_server() {
        let config = CallConfig::default().with_turn_server("turn:relay.example.org:3478", "alice", "secret");

        assert!(config.validate().is_ok());
        assert!(config.has_relay());
    }

    #[test]
    fn test_empty_ice_servers_are_rejected() {
        let config = CallConfig {
            ice_servers: Vec::new(),
            ..Default::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"tickMillis": 250, "media": {{"video": {{"width": 640, "height": 480}}}}}}"#
        )
        .unwrap();

        let config = CallConfig::load(file.path()).unwrap();

        assert_eq!(config.tick_millis, 250);
        let video = config.media.video.unwrap();
        assert_eq!((video.width, video.height, video.frame_rate), (640, 480, 30));
        assert!(config.media.audio.is_some());
        assert_eq!(config.ice_servers, default_ice_servers());
    }

    #[test]
    fn test_load_rejects_bad_scheme() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"iceServers": [{{"urls": ["http://example.org"]}}]}}"#).unwrap();

        assert!(matches!(
            CallConfig::load(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }
}
