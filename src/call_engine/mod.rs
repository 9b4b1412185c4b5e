//! Call Engine Module - Anrufsteuerung
//!
//! Dieses Modul verwaltet:
//! - Die Zustandsmaschine eines Anrufs (Call Session Controller)
//! - Die Session mit lokalen Medien, Peer Link und Chat
//! - Die Bildschirmfreigabe per Track Replacement
//! - Den Gesprächsdauer-Timer

mod engine;
mod screen_share;
mod session;
mod timer;

pub use engine::{CallEngine, CallEngineError, CallEvent};
pub use screen_share::{ScreenCaptureSwapper, ScreenShare, ShareError};
pub use session::{
    CallRole, CallSession, CallSnapshot, CallState, ChatMessage, LocalMediaState, StepOutcome,
    TeardownReport, TeardownStep, VideoSource,
};
pub use timer::CallTimer;
