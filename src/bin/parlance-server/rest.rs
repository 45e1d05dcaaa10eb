//! One-shot REST surfaces for non-streaming clients.
//!
//! These are thin adapters over the same building blocks the streaming path uses: the
//! decode layer produces float samples at a known rate, the VAD engine and transcription
//! client do the rest.

use std::time::{Duration, Instant};

use axum::Json;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::info;

use parlance::audio::decode;
use parlance::providers::{
    Corrector, HttpCorrector, HttpTranscriber, Transcriber, TranscriptionRequest,
};
use parlance::vad::VadEngine;

use crate::AppState;

pub struct AppError {
    status: StatusCode,
    body: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    error_code: String,
}

impl AppError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                error: message.into(),
                error_code: "VALIDATION_ERROR".to_owned(),
            },
        }
    }
}

impl From<parlance::Error> for AppError {
    fn from(err: parlance::Error) -> Self {
        let status = match &err {
            parlance::Error::Validation(_) | parlance::Error::AudioProcessing(_) => {
                StatusCode::BAD_REQUEST
            }
            parlance::Error::AtCapacity(_) => StatusCode::SERVICE_UNAVAILABLE,
            parlance::Error::AsrProvider { .. } | parlance::Error::LlmProvider { .. } => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            body: ErrorBody {
                error: err.to_string(),
                error_code: err.code().to_owned(),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub async fn root() -> &'static str {
    "parlance-server: WS /v1/stream | POST /v1/transcribe | POST /v1/vad/detect"
}

pub async fn healthz() -> &'static str {
    "ok"
}

// ---------------------------------------------------------------------------
// GET /v1/streaming-stats
// ---------------------------------------------------------------------------

pub async fn streaming_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.manager.stats();
    Json(serde_json::json!({
        "streaming": stats,
        "vad_settings": {
            "threshold": state.settings.vad_threshold,
            "silence_duration": state.settings.vad_silence_duration,
            "hop_size": state.settings.vad_hop_size,
        },
        "audio_settings": {
            "sample_rate": state.settings.sample_rate,
            "chunk_duration": state.settings.chunk_duration,
            "lookback_duration": state.settings.lookback_duration,
        },
    }))
}

// ---------------------------------------------------------------------------
// POST /v1/vad/detect
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct VadDetectRequest {
    audio_data: Vec<f32>,
    #[serde(default)]
    sample_rate: Option<u32>,
    #[serde(default)]
    threshold: Option<f32>,
}

#[derive(Debug, Serialize)]
pub struct VadDetectResponse {
    is_speaking: bool,
    state: &'static str,
    probability: f32,
    rms: f32,
    max_amplitude: f32,
    processing_time_ms: u64,
    metadata: serde_json::Value,
}

pub async fn vad_detect(
    State(state): State<AppState>,
    Json(request): Json<VadDetectRequest>,
) -> Result<Json<VadDetectResponse>, AppError> {
    let started = Instant::now();

    if request.audio_data.is_empty() {
        return Err(AppError::bad_request("audio_data cannot be empty"));
    }
    if request.audio_data.len() < state.settings.vad_hop_size {
        return Err(AppError::bad_request(format!(
            "audio too short: at least {} samples are required",
            state.settings.vad_hop_size
        )));
    }

    let sample_rate = request.sample_rate.unwrap_or(state.settings.sample_rate);
    let threshold = request.threshold.unwrap_or(state.settings.vad_threshold);

    // One-shot analysis gets a fresh engine; VAD state is never shared across callers.
    let mut vad = VadEngine::with_energy_classifier(
        threshold,
        state.settings.vad_hop_size,
        Duration::from_secs_f64(state.settings.vad_silence_duration),
    );
    let report = vad.process(&request.audio_data).map_err(AppError::from)?;

    Ok(Json(VadDetectResponse {
        is_speaking: report.is_speaking,
        state: if report.is_speaking {
            "speech"
        } else {
            "silence"
        },
        probability: report.probability,
        rms: report.rms,
        max_amplitude: report.peak,
        processing_time_ms: started.elapsed().as_millis() as u64,
        metadata: serde_json::json!({
            "sample_rate": sample_rate,
            "audio_length": request.audio_data.len(),
            "duration_seconds": request.audio_data.len() as f64 / sample_rate as f64,
            "threshold": threshold,
        }),
    }))
}

// ---------------------------------------------------------------------------
// POST /v1/transcribe
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TranscribeJsonRequest {
    audio_base64: String,
    format: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    enable_llm: bool,
}

#[derive(Debug, Serialize)]
pub struct TranscribeResponse {
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    corrected_text: Option<String>,
    processing_time_ms: u64,
    duration_seconds: f64,
    sample_rate: u32,
    model: String,
}

struct UploadedAudio {
    bytes: Vec<u8>,
    format: Option<String>,
    language: Option<String>,
    prompt: Option<String>,
    enable_llm: bool,
}

/// Accepts audio either as a multipart upload (`file` field) or as JSON
/// `{audio_base64, format}`.
pub async fn transcribe_file(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<TranscribeResponse>, AppError> {
    let started = Instant::now();

    let UploadedAudio {
        bytes,
        format,
        language,
        prompt,
        enable_llm,
    } = extract_upload(&state, request).await?;

    // Container decoding and resampling are CPU work; keep them off the runtime.
    let target_rate = state.settings.sample_rate;
    let (samples, duration_seconds) = tokio::task::spawn_blocking(move || {
        let (decoded, source_rate) = decode::decode_audio(&bytes, format.as_deref())?;
        let samples = decode::resample(&decoded, source_rate, target_rate)?;
        let duration = samples.len() as f64 / target_rate as f64;
        Ok::<_, parlance::Error>((samples, duration))
    })
    .await
    .map_err(|err| AppError::from(parlance::Error::Internal(err.into())))?
    .map_err(AppError::from)?;

    if duration_seconds < state.settings.min_duration {
        return Err(AppError::bad_request(format!(
            "audio too short: {duration_seconds:.2}s (minimum {:.2}s)",
            state.settings.min_duration
        )));
    }
    if duration_seconds > state.settings.max_duration {
        return Err(AppError::bad_request(format!(
            "audio too long: {duration_seconds:.0}s (maximum {:.0}s)",
            state.settings.max_duration
        )));
    }

    let api_key = state
        .settings
        .asr_api_key
        .clone()
        .ok_or_else(|| parlance::Error::Configuration("ASR API key not configured".into()))
        .map_err(AppError::from)?;

    let transcriber = HttpTranscriber::new(
        state.settings.asr_api_url.clone(),
        api_key.clone(),
        state.settings.asr_model.clone(),
        state.settings.asr_timeout(),
        state.settings.asr_max_concurrency,
    )
    .map_err(AppError::from)?;

    let transcription = transcriber
        .transcribe(TranscriptionRequest {
            samples,
            sample_rate: target_rate,
            prompt: prompt.unwrap_or_default(),
            language,
        })
        .await
        .map_err(AppError::from)?;

    let corrected_text = if enable_llm && !transcription.text.is_empty() {
        let llm_key = state.settings.llm_api_key.clone().unwrap_or(api_key);
        let corrector = HttpCorrector::new(
            state.settings.llm_api_url.clone(),
            llm_key,
            state.settings.llm_model.clone(),
            state.settings.llm_timeout(),
        );
        Some(corrector.correct(&transcription.text).await)
    } else {
        None
    };

    info!(
        duration_seconds,
        text_length = transcription.text.len(),
        "one-shot transcription served"
    );

    Ok(Json(TranscribeResponse {
        text: transcription.text,
        corrected_text,
        processing_time_ms: started.elapsed().as_millis() as u64,
        duration_seconds,
        sample_rate: target_rate,
        model: state.settings.asr_model.clone(),
    }))
}

async fn extract_upload(state: &AppState, request: Request) -> Result<UploadedAudio, AppError> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();

    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, state)
            .await
            .map_err(|err| AppError::bad_request(format!("invalid multipart body: {err}")))?;
        return extract_multipart(multipart).await;
    }

    let Json(body): Json<TranscribeJsonRequest> = Json::from_request(request, state)
        .await
        .map_err(|err| AppError::bad_request(format!("invalid JSON body: {err}")))?;

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(body.audio_base64.as_bytes())
        .map_err(|err| AppError::bad_request(format!("invalid base64 audio: {err}")))?;

    Ok(UploadedAudio {
        bytes,
        format: Some(body.format),
        language: body.language,
        prompt: body.prompt,
        enable_llm: body.enable_llm,
    })
}

async fn extract_multipart(mut multipart: Multipart) -> Result<UploadedAudio, AppError> {
    let mut upload = UploadedAudio {
        bytes: Vec::new(),
        format: None,
        language: None,
        prompt: None,
        enable_llm: false,
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("invalid multipart field: {err}")))?
    {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "file" => {
                upload.format = field
                    .file_name()
                    .and_then(|name| name.rsplit('.').next())
                    .map(|ext| ext.to_ascii_lowercase());
                upload.bytes = field
                    .bytes()
                    .await
                    .map_err(|err| AppError::bad_request(format!("failed to read upload: {err}")))?
                    .to_vec();
            }
            "language" => {
                upload.language = field.text().await.ok().filter(|s| !s.is_empty());
            }
            "prompt" => {
                upload.prompt = field.text().await.ok().filter(|s| !s.is_empty());
            }
            "enable_llm" => {
                upload.enable_llm = field
                    .text()
                    .await
                    .map(|v| v == "true" || v == "1")
                    .unwrap_or(false);
            }
            _ => {}
        }
    }

    if upload.bytes.is_empty() {
        return Err(AppError::bad_request(
            "multipart upload must include a non-empty 'file' field",
        ));
    }

    Ok(upload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_error_maps_the_taxonomy_to_statuses() {
        let err = AppError::from(parlance::Error::Validation("bad".into()));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err = AppError::from(parlance::Error::AtCapacity(100));
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);

        let err = AppError::from(parlance::Error::AsrProvider {
            kind: parlance::error::AsrFailure::Http(503),
            message: "down".into(),
            body: None,
        });
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);

        let err = AppError::from(parlance::Error::Configuration("no key".into()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
