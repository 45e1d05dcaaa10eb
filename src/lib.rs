//! `parlance` — a real-time streaming speech-recognition gateway.
//!
//! Clients open a bidirectional session, push raw PCM audio as it is captured, and
//! receive a rolling sequence of transcript segments that are refined as utterance
//! boundaries are discovered. Recognition itself is delegated to an external
//! transcription endpoint (plus an optional language-model corrector); this crate owns
//! the hard parts around it:
//! - deciding *when* to cut audio into segments (VAD edges, timeout chunks, lookback)
//! - deciding *which* past segments to retire when a better transcription arrives
//! - sequencing and labelling results so a client can render a monotonically
//!   improving transcript
//!
//! The library is designed to be used by the bundled server binary and by tests; the
//! streaming core has no HTTP server dependencies of its own.

// Audio storage, WAV codec, and upload decoding.
pub mod audio;

// Voice activity detection.
pub mod vad;

// Remote transcription and correction clients.
pub mod providers;

// Sessions, segmentation, manager, and the wire protocol.
pub mod streaming;

// Advisory per-segment capture.
pub mod capture;

// Service configuration.
pub mod config;

// Crate-wide error taxonomy.
pub mod error;

// Logging configuration and control.
pub mod logging;

pub use config::Settings;
pub use error::{Error, Result};
pub use logging::init as init_logging;
pub use streaming::SessionManager;
