//! Voice Activity Detection (VAD).
//!
//! The engine wraps a pluggable per-frame classifier and turns arbitrary-length audio
//! pushes into speech/silence state with edge-change notification. All VAD state is
//! per-session: the frame residue and speaking flag belong to exactly one audio stream,
//! and sharing them across sessions corrupts both.

mod classifier;
mod engine;

pub use classifier::{EnergyClassifier, FrameClassifier, FrameScore};
pub use engine::{VadEngine, VadReport};
