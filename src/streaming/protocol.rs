//! Wire protocol for the streaming transport.
//!
//! Frames are JSON envelopes `{ "type": T, "data": D, "timestamp": ms_since_epoch }`.
//! Inbound payloads are validated up front: an unknown `type` or malformed `data` is a
//! validation error and mutates no session state.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::vad::VadReport;

/// Wire protocol version, reported in the `ready` status metadata.
pub const PROTOCOL_VERSION: u32 = 1;

pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

/// Longest single audio push accepted, in seconds.
const MAX_PUSH_SECONDS: usize = 30;

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Session configuration sent by the client before any audio.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub api_key: String,
    #[serde(default)]
    pub enable_llm: bool,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub vad_threshold: Option<f32>,
    #[serde(default)]
    pub chunk_duration: Option<f64>,
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(Error::configuration("api_key is required"));
        }
        if let Some(language) = &self.language {
            let ok = language.len() == 2 && language.chars().all(|c| c.is_ascii_lowercase());
            if !ok {
                return Err(Error::validation(format!(
                    "language must be an ISO 639-1 code, got '{language}'"
                )));
            }
        }
        if let Some(threshold) = self.vad_threshold
            && !(0.0..=1.0).contains(&threshold)
        {
            return Err(Error::validation(format!(
                "vad_threshold must be within [0.0, 1.0], got {threshold}"
            )));
        }
        if let Some(duration) = self.chunk_duration
            && !(0.5..=10.0).contains(&duration)
        {
            return Err(Error::validation(format!(
                "chunk_duration must be within [0.5, 10.0] seconds, got {duration}"
            )));
        }
        Ok(())
    }
}

/// One push of raw samples.
#[derive(Debug, Clone, Deserialize)]
pub struct AudioFrame {
    pub audio_data: Vec<f32>,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

impl AudioFrame {
    pub fn validate(&self) -> Result<()> {
        if self.audio_data.is_empty() {
            return Err(Error::validation("audio_data cannot be empty"));
        }
        if self.sample_rate == 0 {
            return Err(Error::validation("sample_rate must be non-zero"));
        }
        if self.audio_data.len() > self.sample_rate as usize * MAX_PUSH_SECONDS {
            return Err(Error::validation(format!(
                "audio push too long (max {MAX_PUSH_SECONDS} seconds)"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlCommand {
    Start,
    Stop,
    Reset,
    Pause,
    Resume,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlRequest {
    pub command: ControlCommand,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub enum ClientMessage {
    Config(SessionConfig),
    Audio(AudioFrame),
    Control(ControlRequest),
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    #[allow(dead_code)]
    timestamp: Option<i64>,
}

/// Parse one inbound text frame into a typed message.
pub fn parse_client_frame(text: &str) -> Result<ClientMessage> {
    let envelope: RawEnvelope = serde_json::from_str(text)
        .map_err(|err| Error::validation(format!("invalid message envelope: {err}")))?;

    let message = match envelope.kind.as_str() {
        "config" => ClientMessage::Config(decode_data(envelope.data, "config")?),
        "audio" => ClientMessage::Audio(decode_data(envelope.data, "audio")?),
        "control" => ClientMessage::Control(decode_data(envelope.data, "control")?),
        other => {
            return Err(Error::validation(format!("unknown message type: '{other}'")));
        }
    };

    Ok(message)
}

fn decode_data<T: serde::de::DeserializeOwned>(data: serde_json::Value, kind: &str) -> Result<T> {
    serde_json::from_value(data)
        .map_err(|err| Error::validation(format!("invalid {kind} payload: {err}")))
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Connecting,
    Ready,
    Processing,
    Error,
    Disconnected,
}

/// VAD snapshot attached to `processing` status messages.
#[derive(Debug, Clone, Serialize)]
pub struct VadState {
    pub is_speaking: bool,
    pub current_state: &'static str,
    pub state_changed: bool,
    pub probability: f32,
    pub rms: f32,
    pub max_amplitude: f32,
    pub silence_timeout: bool,
}

impl From<&VadReport> for VadState {
    fn from(report: &VadReport) -> Self {
        Self {
            is_speaking: report.is_speaking,
            current_state: if report.is_speaking {
                "speech"
            } else {
                "silence"
            },
            state_changed: report.state_changed,
            probability: report.probability,
            rms: report.rms,
            max_amplitude: report.peak,
            silence_timeout: report.silence_timeout,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusBody {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vad_state: Option<VadState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultBody {
    pub segment_id: u64,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrected_text: Option<String>,
    pub is_final: bool,
    pub is_timeout_chunk: bool,
    pub is_reprocessed: bool,
    pub replaces_segments: Vec<u64>,
    pub processing_time_ms: u64,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub error_code: String,
    pub recoverable: bool,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

#[derive(Debug, Clone)]
pub enum ServerMessage {
    Status(StatusBody),
    Result(ResultBody),
    Error(ErrorBody),
}

impl ServerMessage {
    pub fn status(status: Status) -> Self {
        Self::Status(StatusBody {
            status,
            vad_state: None,
            session_id: None,
            metadata: serde_json::Value::Null,
        })
    }

    pub fn from_error(err: &Error) -> Self {
        Self::Error(ErrorBody {
            error: err.to_string(),
            error_code: err.code().to_owned(),
            recoverable: err.recoverable(),
            details: err.details(),
        })
    }

    /// Serialize into the wire envelope.
    pub fn to_frame(&self) -> String {
        let (kind, data) = match self {
            Self::Status(body) => ("status", serde_json::to_value(body)),
            Self::Result(body) => ("result", serde_json::to_value(body)),
            Self::Error(body) => ("error", serde_json::to_value(body)),
        };
        // These bodies are plain data; serialization cannot fail on them.
        let data = data.unwrap_or(serde_json::Value::Null);
        serde_json::json!({
            "type": kind,
            "data": data,
            "timestamp": now_ms(),
        })
        .to_string()
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
