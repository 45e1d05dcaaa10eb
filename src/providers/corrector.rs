//! Chat-completion text corrector.
//!
//! Asks the model for three candidate corrections plus a "best" pick, as JSON, and keeps
//! only the pick. Everything here degrades to returning the input: a broken corrector
//! must never cost a transcript.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::providers::Corrector;

const TERMINAL_PUNCTUATION: &[char] = &['.', '!', '?', '。', '！', '？'];

/// Keys the "best" pick may come back under, in preference order.
const BEST_KEYS: &[&str] = &["best", "Best", "best_choice", "choice"];

pub struct HttpCorrector {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl HttpCorrector {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            timeout,
        }
    }

    async fn request_correction(&self, text: &str) -> anyhow::Result<String> {
        let payload = serde_json::json!({
            "model": self.model,
            "max_tokens": 4096,
            "temperature": 0.6,
            "messages": [{ "role": "user", "content": correction_prompt(text) }],
        });

        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("corrector endpoint returned status {status}");
        }

        let body: serde_json::Value = response.json().await?;
        let content = body
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow::anyhow!("corrector response had no message content"))?;

        extract_best(content)
            .ok_or_else(|| anyhow::anyhow!("corrector response had no usable candidate"))
    }
}

#[async_trait]
impl Corrector for HttpCorrector {
    async fn correct(&self, text: &str) -> String {
        if text.trim().is_empty() {
            return text.to_owned();
        }

        match self.request_correction(text).await {
            Ok(best) => best,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "text correction failed, keeping raw transcript");
                ensure_terminal_punctuation(text)
            }
        }
    }
}

fn correction_prompt(text: &str) -> String {
    format!(
        "You are a post-processing expert for automatic speech recognition output.\n\
         \n\
         Rules:\n\
         1. Fix only recognition errors (homophones, accent slips, run-together words). \
         Leave every fluent, grammatical part of the input untouched: no paraphrasing, no \
         reordering, no synonym swaps.\n\
         2. When a word is out of place for the context, prefer reading it as a \
         similar-sounding recognition error.\n\
         3. Add sentence punctuation and fix casing, numbers, and dates where obviously \
         wrong. Preserve the original sentence structure.\n\
         \n\
         Input text: {text}\n\
         \n\
         Produce three candidate corrections that differ only where you suspect errors, \
         then pick the one that best matches the speaker's intent. Reply with strictly \
         this JSON object and nothing else:\n\
         {{\n\
           \"candidate_1\": \"...\",\n\
           \"candidate_2\": \"...\",\n\
           \"candidate_3\": \"...\",\n\
           \"best\": \"...\"\n\
         }}"
    )
}

/// Pull the "best" candidate out of a model reply that should contain a JSON object,
/// possibly wrapped in prose or a code fence.
fn extract_best(content: &str) -> Option<String> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }

    let parsed: serde_json::Value = serde_json::from_str(&content[start..=end]).ok()?;
    let object = parsed.as_object()?;

    for key in BEST_KEYS {
        if let Some(best) = object.get(*key).and_then(|v| v.as_str()) {
            return Some(best.to_owned());
        }
    }

    // No explicit pick; settle for the first candidate.
    object
        .get("candidate_1")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
}

fn ensure_terminal_punctuation(text: &str) -> String {
    let trimmed = text.trim_end();
    if trimmed.is_empty() || trimmed.ends_with(TERMINAL_PUNCTUATION) {
        text.to_owned()
    } else {
        format!("{trimmed}.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_best_reads_the_best_key() {
        let content = r#"{"candidate_1": "a", "candidate_2": "b", "candidate_3": "c", "best": "b"}"#;
        assert_eq!(extract_best(content).as_deref(), Some("b"));
    }

    #[test]
    fn extract_best_accepts_alias_keys() {
        assert_eq!(
            extract_best(r#"{"best_choice": "picked"}"#).as_deref(),
            Some("picked")
        );
        assert_eq!(
            extract_best(r#"{"Best": "picked"}"#).as_deref(),
            Some("picked")
        );
    }

    #[test]
    fn extract_best_tolerates_surrounding_prose() {
        let content = "Here you go:\n```json\n{\"best\": \"fixed text.\"}\n```\nHope that helps!";
        assert_eq!(extract_best(content).as_deref(), Some("fixed text."));
    }

    #[test]
    fn extract_best_falls_back_to_the_first_candidate() {
        let content = r#"{"candidate_1": "first", "candidate_2": "second"}"#;
        assert_eq!(extract_best(content).as_deref(), Some("first"));
    }

    #[test]
    fn extract_best_rejects_non_json_replies() {
        assert!(extract_best("I cannot help with that.").is_none());
        assert!(extract_best("{broken json").is_none());
    }

    #[test]
    fn punctuation_fallback_appends_a_full_stop_once() {
        assert_eq!(ensure_terminal_punctuation("hello there"), "hello there.");
        assert_eq!(ensure_terminal_punctuation("hello there."), "hello there.");
        assert_eq!(ensure_terminal_punctuation("really?"), "really?");
        assert_eq!(ensure_terminal_punctuation("好的。"), "好的。");
    }
}
