//! HTTP transcription client.
//!
//! Encodes a PCM range as 16-bit mono WAV and POSTs it as a multipart form to a
//! Whisper-compatible endpoint (OpenAI or Fireworks shaped). Failures are typed, never
//! retried here, and never unwind the caller's state: the segmentation layer treats
//! transcription as a total function that may yield empty text.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::audio::wav;
use crate::error::{AsrFailure, Error, Result};
use crate::providers::{Transcriber, Transcription, TranscriptionRequest};

#[derive(Debug)]
pub struct HttpTranscriber {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
    /// Caps concurrent provider calls across all sessions sharing this client.
    permits: Arc<Semaphore>,
}

impl HttpTranscriber {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
        max_concurrency: usize,
    ) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(Error::configuration("transcription API key is required"));
        }

        Ok(Self {
            http: reqwest::Client::new(),
            api_url: api_url.into(),
            api_key,
            model: model.into(),
            timeout,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        })
    }

    fn build_form(&self, request: &TranscriptionRequest, wav_bytes: Vec<u8>) -> Result<Form> {
        let file = Part::bytes(wav_bytes)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| Error::Internal(e.into()))?;

        let mut form = Form::new()
            .part("file", file)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .text("timestamp_granularities", "segment");

        if !request.prompt.is_empty() {
            form = form.text("prompt", request.prompt.clone());
        }
        if let Some(language) = &request.language {
            form = form.text("language", language.clone());
        }

        // Fireworks runs its own upstream VAD and defaults to a nonzero temperature;
        // pin both for deterministic streaming output.
        if self.api_url.to_ascii_lowercase().contains("fireworks") {
            form = form.text("vad_model", "silero").text("temperature", "0.0");
        }

        Ok(form)
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, request: TranscriptionRequest) -> Result<Transcription> {
        let started = Instant::now();
        let audio_duration = request.samples.len() as f64 / request.sample_rate as f64;

        let wav_bytes = wav::encode_pcm16_mono(&request.samples, request.sample_rate)?;
        let form = self.build_form(&request, wav_bytes)?;

        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::asr(AsrFailure::Transport, "client shut down", None))?;

        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    Error::asr(AsrFailure::Timeout, "transcription request timed out", None)
                } else {
                    Error::asr(
                        AsrFailure::Transport,
                        format!("transcription request failed: {err}"),
                        None,
                    )
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.ok();
            let kind = match status.as_u16() {
                401 | 403 => AsrFailure::Auth(status.as_u16()),
                code => AsrFailure::Http(code),
            };
            return Err(Error::asr(
                kind,
                format!("transcription request failed with status {status}"),
                body,
            ));
        }

        let payload: serde_json::Value = response.json().await.map_err(|err| {
            Error::asr(
                AsrFailure::Parse,
                format!("unparseable transcription response: {err}"),
                None,
            )
        })?;

        let text = extract_text(&payload);
        let processing_ms = started.elapsed().as_millis() as u64;

        info!(
            text_length = text.len(),
            processing_ms,
            audio_duration,
            model = %self.model,
            "transcription completed"
        );

        Ok(Transcription {
            text,
            processing_ms,
            provider_meta: serde_json::json!({
                "model": self.model,
                "sample_rate": request.sample_rate,
                "audio_duration": audio_duration,
            }),
        })
    }
}

/// Pull text out of a verbose_json response; when the top-level field is missing,
/// concatenate per-segment text instead.
fn extract_text(payload: &serde_json::Value) -> String {
    let direct = payload
        .get("text")
        .and_then(|t| t.as_str())
        .unwrap_or_default();
    if !direct.trim().is_empty() {
        return direct.trim().to_owned();
    }

    let Some(segments) = payload.get("segments").and_then(|s| s.as_array()) else {
        debug!("transcription response carried neither text nor segments");
        return String::new();
    };

    segments
        .iter()
        .filter_map(|segment| segment.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_api_key_is_a_configuration_error() {
        let err = HttpTranscriber::new(
            "https://example.com/v1/audio/transcriptions",
            "",
            "whisper-1",
            Duration::from_secs(30),
            4,
        )
        .unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn extract_text_prefers_the_top_level_field() {
        let payload = serde_json::json!({
            "text": "  hello world  ",
            "segments": [{"text": "ignored"}],
        });
        assert_eq!(extract_text(&payload), "hello world");
    }

    #[test]
    fn extract_text_joins_segments_when_text_is_absent() {
        let payload = serde_json::json!({
            "segments": [{"text": "hello"}, {"text": "world"}],
        });
        assert_eq!(extract_text(&payload), "hello world");
    }

    #[test]
    fn extract_text_handles_an_empty_response() {
        assert_eq!(extract_text(&serde_json::json!({})), "");
    }
}
