//! Advisory capture of per-segment audio and request records.
//!
//! When a capture directory is configured, every transcribed segment leaves behind a WAV
//! of the exact audio sent to the provider plus a JSON record of the outcome. Capture is
//! diagnostics only: failures are logged and swallowed, and nothing downstream depends
//! on these files.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::warn;

use crate::audio::wav;

#[derive(Debug, Serialize)]
pub struct CaptureRecord<'a> {
    pub segment_id: u64,
    pub kind: &'a str,
    pub start_index: u64,
    pub end_index: u64,
    pub text: &'a str,
    pub corrected_text: Option<&'a str>,
    pub processing_time_ms: u64,
    pub replaces_segments: &'a [u64],
}

pub struct CaptureSink {
    dir: PathBuf,
}

impl CaptureSink {
    /// Create a sink rooted at `dir`, creating the directory if needed. Returns `None`
    /// (after logging) when the directory can't be prepared — capture is never fatal.
    pub fn create(dir: PathBuf) -> Option<Self> {
        if let Err(err) = fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %err, "capture disabled: cannot create directory");
            return None;
        }
        Some(Self { dir })
    }

    pub fn record(&self, samples: &[f32], sample_rate: u32, record: &CaptureRecord<'_>) {
        if let Err(err) = self.try_record(samples, sample_rate, record) {
            warn!(
                segment_id = record.segment_id,
                error = %format!("{err:#}"),
                "failed to capture segment"
            );
        }
    }

    fn try_record(
        &self,
        samples: &[f32],
        sample_rate: u32,
        record: &CaptureRecord<'_>,
    ) -> Result<()> {
        let wav_path = self.dir.join(format!("{}.wav", record.segment_id));
        let bytes = wav::encode_pcm16_mono(samples, sample_rate)
            .map_err(|err| anyhow::anyhow!("{err}"))?;
        fs::write(&wav_path, bytes)
            .with_context(|| format!("writing {}", wav_path.display()))?;

        let json_path = self.dir.join(format!("{}.json", record.segment_id));
        let payload = serde_json::to_vec_pretty(record).context("serializing capture record")?;
        fs::write(&json_path, payload)
            .with_context(|| format!("writing {}", json_path.display()))?;

        Ok(())
    }
}
