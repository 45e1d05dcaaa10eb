//! Remote provider clients.
//!
//! The gateway performs no recognition itself: decided audio ranges go to a transcription
//! HTTP endpoint, and optionally through a chat-completion corrector afterwards. Both are
//! behind traits so sessions can be driven by scripted providers in tests.

pub mod corrector;
pub mod transcription;

use async_trait::async_trait;

use crate::error::Result;

pub use corrector::HttpCorrector;
pub use transcription::HttpTranscriber;

/// One transcription request: a decided audio range plus context.
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Context prompt (recent accepted transcripts), empty when none.
    pub prompt: String,
    /// ISO 639-1 language hint.
    pub language: Option<String>,
}

/// A completed transcription.
#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    pub processing_ms: u64,
    pub provider_meta: serde_json::Value,
}

/// Speech-to-text over a decided audio range.
///
/// Implementations must not retry: whether and when to re-transcribe is the segmentation
/// layer's decision.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, request: TranscriptionRequest) -> Result<Transcription>;

    /// Short silent-audio round-trip used at session configuration to fail fast.
    async fn self_test(&self) -> Result<()> {
        let sample_rate = 16_000;
        let mut samples = vec![0.0f32; sample_rate as usize];
        // A single tick keeps strict providers from rejecting digital silence.
        samples[sample_rate as usize / 2] = 0.001;

        self.transcribe(TranscriptionRequest {
            samples,
            sample_rate,
            prompt: String::new(),
            language: None,
        })
        .await
        .map(|_| ())
    }
}

/// Text-to-text refinement. Total by contract: failures return the input unchanged, so
/// correction can never break the result pipeline.
#[async_trait]
pub trait Corrector: Send + Sync {
    async fn correct(&self, text: &str) -> String;
}
