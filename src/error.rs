use thiserror::Error;

/// Parlance's crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure class for a transcription provider call.
///
/// The client itself never retries; these exist so the segmentation layer (and operators
/// reading logs) can tell a dead provider from a slow one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsrFailure {
    /// The per-request deadline elapsed.
    Timeout,
    /// The provider answered with a non-success HTTP status.
    Http(u16),
    /// The provider rejected the credential (401/403).
    Auth(u16),
    /// The response body could not be interpreted.
    Parse,
    /// The request never completed (DNS, connect, TLS, broken pipe).
    Transport,
}

/// Parlance's crate-wide error type.
///
/// The variants are the wire-level error taxonomy: `code()` and `recoverable()` feed the
/// outbound `error` envelope directly. This is intentionally decoupled from `anyhow` so
/// downstream libraries aren't forced to adopt `anyhow` in their own public APIs;
/// uncategorized internal errors are folded into `Internal`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("audio processing error: {0}")]
    AudioProcessing(String),

    #[error("vad error: {0}")]
    Vad(String),

    #[error("transcription provider error: {message}")]
    AsrProvider {
        kind: AsrFailure,
        message: String,
        /// Captured response body, when the provider sent one.
        body: Option<String>,
    },

    #[error("corrector provider error: {message}")]
    LlmProvider {
        message: String,
        status: Option<u16>,
    },

    #[error("streaming error: {0}")]
    Streaming(String),

    #[error("session limit reached ({0} active)")]
    AtCapacity(usize),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub(crate) fn audio(message: impl Into<String>) -> Self {
        Self::AudioProcessing(message.into())
    }

    pub(crate) fn asr(kind: AsrFailure, message: impl Into<String>, body: Option<String>) -> Self {
        Self::AsrProvider {
            kind,
            message: message.into(),
            body,
        }
    }

    /// Stable error code for the wire protocol.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::AudioProcessing(_) => "AUDIO_PROCESSING_ERROR",
            Self::Vad(_) => "VAD_ERROR",
            Self::AsrProvider { .. } => "ASR_PROVIDER_ERROR",
            Self::LlmProvider { .. } => "LLM_PROVIDER_ERROR",
            Self::Streaming(_) => "STREAMING_ERROR",
            Self::AtCapacity(_) => "AT_CAPACITY",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the session can keep going after reporting this error.
    ///
    /// A misconfigured session can never make progress, and a broken transport has no way
    /// to carry further messages; everything else is scoped to a single push or call.
    pub fn recoverable(&self) -> bool {
        !matches!(
            self,
            Self::Configuration(_) | Self::Streaming(_) | Self::AtCapacity(_)
        )
    }

    /// Structured detail payload for the wire error envelope.
    pub fn details(&self) -> serde_json::Value {
        match self {
            Self::AsrProvider { kind, body, .. } => {
                let status = match kind {
                    AsrFailure::Http(code) | AsrFailure::Auth(code) => Some(*code),
                    _ => None,
                };
                serde_json::json!({
                    "failure": format!("{kind:?}"),
                    "status": status,
                    "response": body,
                })
            }
            Self::LlmProvider { status, .. } => serde_json::json!({ "status": status }),
            Self::AtCapacity(active) => serde_json::json!({ "active_sessions": active }),
            _ => serde_json::Value::Null,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(err.to_string())
    }
}
