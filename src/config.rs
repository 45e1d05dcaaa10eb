//! Service configuration.
//!
//! All knobs are read from `PARLANCE_*` environment variables with sensible defaults, then
//! validated once at startup. The struct is serde-serializable so the `config` CLI
//! subcommand can print the effective configuration.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::error::{Error, Result};

/// Output format for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

/// Effective service settings.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    // API surface.
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub max_sessions: usize,

    // Transcription provider.
    pub asr_api_url: String,
    pub asr_model: String,
    pub asr_api_key: Option<String>,
    pub asr_timeout_secs: u64,
    pub asr_max_concurrency: usize,

    // Corrector provider.
    pub llm_api_url: String,
    pub llm_model: String,
    pub llm_api_key: Option<String>,
    pub llm_timeout_secs: u64,

    // VAD.
    pub vad_threshold: f32,
    pub vad_silence_duration: f64,
    pub vad_hop_size: usize,

    // Audio / segmentation.
    pub sample_rate: u32,
    pub chunk_duration: f64,
    pub lookback_duration: f64,
    pub pre_roll: f64,
    pub min_duration: f64,
    pub max_duration: f64,

    // Session lifecycle.
    pub idle_timeout_secs: u64,

    // Advisory capture of per-utterance audio and request records.
    pub capture_dir: Option<PathBuf>,

    // Logging.
    pub log_format: LogFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8000,
            workers: 1,
            max_sessions: 100,
            asr_api_url: "https://api.openai.com/v1/audio/transcriptions".to_owned(),
            asr_model: "whisper-1".to_owned(),
            asr_api_key: None,
            asr_timeout_secs: 30,
            asr_max_concurrency: 8,
            llm_api_url: "https://api.fireworks.ai/inference/v1/chat/completions".to_owned(),
            llm_model: "accounts/fireworks/models/kimi-k2-instruct".to_owned(),
            llm_api_key: None,
            llm_timeout_secs: 30,
            vad_threshold: 0.5,
            vad_silence_duration: 0.8,
            vad_hop_size: 256,
            sample_rate: 16_000,
            chunk_duration: 3.0,
            lookback_duration: 9.0,
            pre_roll: 0.5,
            min_duration: 0.1,
            max_duration: 300.0,
            idle_timeout_secs: 300,
            capture_dir: None,
            log_format: LogFormat::Json,
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults, then validate.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let settings = Self {
            host: var_string("PARLANCE_HOST").unwrap_or(defaults.host),
            port: var_parsed("PARLANCE_PORT")?.unwrap_or(defaults.port),
            workers: var_parsed("PARLANCE_WORKERS")?.unwrap_or(defaults.workers),
            max_sessions: var_parsed("PARLANCE_MAX_SESSIONS")?.unwrap_or(defaults.max_sessions),
            asr_api_url: var_string("PARLANCE_ASR_URL").unwrap_or(defaults.asr_api_url),
            asr_model: var_string("PARLANCE_ASR_MODEL").unwrap_or(defaults.asr_model),
            asr_api_key: var_string("PARLANCE_ASR_API_KEY"),
            asr_timeout_secs: var_parsed("PARLANCE_ASR_TIMEOUT_SECS")?
                .unwrap_or(defaults.asr_timeout_secs),
            asr_max_concurrency: var_parsed("PARLANCE_ASR_MAX_CONCURRENCY")?
                .unwrap_or(defaults.asr_max_concurrency),
            llm_api_url: var_string("PARLANCE_LLM_URL").unwrap_or(defaults.llm_api_url),
            llm_model: var_string("PARLANCE_LLM_MODEL").unwrap_or(defaults.llm_model),
            llm_api_key: var_string("PARLANCE_LLM_API_KEY"),
            llm_timeout_secs: var_parsed("PARLANCE_LLM_TIMEOUT_SECS")?
                .unwrap_or(defaults.llm_timeout_secs),
            vad_threshold: var_parsed("PARLANCE_VAD_THRESHOLD")?.unwrap_or(defaults.vad_threshold),
            vad_silence_duration: var_parsed("PARLANCE_VAD_SILENCE_DURATION")?
                .unwrap_or(defaults.vad_silence_duration),
            vad_hop_size: var_parsed("PARLANCE_VAD_HOP_SIZE")?.unwrap_or(defaults.vad_hop_size),
            sample_rate: var_parsed("PARLANCE_SAMPLE_RATE")?.unwrap_or(defaults.sample_rate),
            chunk_duration: var_parsed("PARLANCE_CHUNK_DURATION")?
                .unwrap_or(defaults.chunk_duration),
            lookback_duration: var_parsed("PARLANCE_LOOKBACK_DURATION")?
                .unwrap_or(defaults.lookback_duration),
            pre_roll: var_parsed("PARLANCE_PRE_ROLL")?.unwrap_or(defaults.pre_roll),
            min_duration: var_parsed("PARLANCE_MIN_DURATION")?.unwrap_or(defaults.min_duration),
            max_duration: var_parsed("PARLANCE_MAX_DURATION")?.unwrap_or(defaults.max_duration),
            idle_timeout_secs: var_parsed("PARLANCE_IDLE_TIMEOUT_SECS")?
                .unwrap_or(defaults.idle_timeout_secs),
            capture_dir: var_string("PARLANCE_CAPTURE_DIR").map(PathBuf::from),
            log_format: match var_string("PARLANCE_LOG_FORMAT").as_deref() {
                Some("text") => LogFormat::Text,
                Some("json") | None => LogFormat::Json,
                Some(other) => {
                    return Err(Error::configuration(format!(
                        "PARLANCE_LOG_FORMAT must be 'json' or 'text', got '{other}'"
                    )));
                }
            },
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Check parameter bounds that would otherwise surface as confusing runtime behavior.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::configuration("port must be non-zero"));
        }
        if self.max_sessions == 0 {
            return Err(Error::configuration("max_sessions must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.vad_threshold) {
            return Err(Error::configuration(format!(
                "vad_threshold must be within [0.0, 1.0], got {}",
                self.vad_threshold
            )));
        }
        if self.vad_hop_size == 0 {
            return Err(Error::configuration("vad_hop_size must be non-zero"));
        }
        if self.sample_rate == 0 {
            return Err(Error::configuration("sample_rate must be non-zero"));
        }
        for (name, value) in [
            ("chunk_duration", self.chunk_duration),
            ("lookback_duration", self.lookback_duration),
            ("max_duration", self.max_duration),
        ] {
            if value <= 0.0 {
                return Err(Error::configuration(format!("{name} must be positive")));
            }
        }
        if self.pre_roll < 0.0 {
            return Err(Error::configuration("pre_roll must not be negative"));
        }
        Ok(())
    }

    pub fn asr_timeout(&self) -> Duration {
        Duration::from_secs(self.asr_timeout_secs)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// A copy safe to print: credentials are masked, not echoed.
    pub fn redacted(&self) -> Self {
        let mask = |key: &Option<String>| key.as_ref().map(|_| "********".to_owned());
        Self {
            asr_api_key: mask(&self.asr_api_key),
            llm_api_key: mask(&self.llm_api_key),
            ..self.clone()
        }
    }
}

fn var_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn var_parsed<T: FromStr>(key: &str) -> Result<Option<T>> {
    match var_string(key) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            Error::configuration(format!("{key} has an unparseable value: '{raw}'"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() -> anyhow::Result<()> {
        Settings::default().validate()?;
        Ok(())
    }

    #[test]
    fn out_of_range_vad_threshold_is_rejected() {
        let settings = Settings {
            vad_threshold: 1.5,
            ..Settings::default()
        };
        let err = settings.validate().unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
        assert!(err.to_string().contains("vad_threshold"));
    }

    #[test]
    fn non_positive_durations_are_rejected() {
        let settings = Settings {
            chunk_duration: 0.0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());

        let settings = Settings {
            lookback_duration: -1.0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn redacted_masks_credentials() {
        let settings = Settings {
            asr_api_key: Some("sk-secret".to_owned()),
            ..Settings::default()
        };
        let shown = settings.redacted();
        assert_eq!(shown.asr_api_key.as_deref(), Some("********"));
        assert!(shown.llm_api_key.is_none());
    }
}
