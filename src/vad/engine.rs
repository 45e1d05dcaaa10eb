use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{Error, Result};
use crate::vad::classifier::{EnergyClassifier, FrameClassifier};

/// Result of one audio push through the VAD engine.
#[derive(Debug, Clone, Copy)]
pub struct VadReport {
    pub is_speaking: bool,
    /// Whether this push flipped the speech/silence state.
    pub state_changed: bool,
    /// Probability from the last completed frame (carried over when a push was shorter
    /// than one hop).
    pub probability: f32,
    /// RMS of this push's samples.
    pub rms: f32,
    /// Peak amplitude of this push's samples.
    pub peak: f32,
    /// True when silence has lasted at least the configured duration. A hint only; the
    /// segmentation layer is free to ignore it.
    pub silence_timeout: bool,
}

/// Per-session VAD engine.
///
/// Consumes arbitrary-length pushes, slices them into fixed-hop frames for the
/// classifier, and tracks speech/silence state across pushes. The last completed frame's
/// verdict decides the push; leftover sub-frame samples wait in `frame_buffer` for the
/// next push.
pub struct VadEngine {
    classifier: Box<dyn FrameClassifier>,
    fallback: EnergyClassifier,
    hop_size: usize,
    silence_duration: Duration,

    frame_buffer: Vec<i16>,
    is_speaking: bool,
    silence_since: Option<Instant>,
    last_probability: f32,
}

impl VadEngine {
    pub fn new(
        classifier: Box<dyn FrameClassifier>,
        hop_size: usize,
        silence_duration: Duration,
    ) -> Self {
        Self {
            classifier,
            fallback: EnergyClassifier::default(),
            hop_size: hop_size.max(1),
            silence_duration,
            frame_buffer: Vec::new(),
            is_speaking: false,
            silence_since: None,
            last_probability: 0.0,
        }
    }

    /// Engine with the default energy classifier at the given threshold.
    pub fn with_energy_classifier(
        threshold: f32,
        hop_size: usize,
        silence_duration: Duration,
    ) -> Self {
        Self::new(
            Box::new(EnergyClassifier::new(threshold)),
            hop_size,
            silence_duration,
        )
    }

    pub fn is_speaking(&self) -> bool {
        self.is_speaking
    }

    /// Process one audio push and report the resulting state.
    pub fn process(&mut self, samples: &[f32]) -> Result<VadReport> {
        if samples.is_empty() {
            return Err(Error::Vad("empty audio input".into()));
        }

        let rms = push_rms(samples);
        let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));

        self.frame_buffer.extend(
            samples
                .iter()
                .map(|s| (s.clamp(-1.0, 1.0) * 32_767.0) as i16),
        );

        // Classify every complete hop; the last verdict wins for this push.
        let mut verdict = None;
        while self.frame_buffer.len() >= self.hop_size {
            let frame: Vec<i16> = self.frame_buffer.drain(..self.hop_size).collect();
            let score = match self.classifier.classify(&frame) {
                Ok(score) => score,
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "frame classifier failed, using energy fallback");
                    self.fallback.score(&frame)
                }
            };
            verdict = Some(score);
        }

        // A push shorter than one hop completes no frame; carry the previous state rather
        // than inventing a silence verdict out of nothing.
        let (speaking_now, probability) = match verdict {
            Some(score) => (score.is_speech, score.probability),
            None => (self.is_speaking, self.last_probability),
        };
        self.last_probability = probability;

        let state_changed = speaking_now != self.is_speaking;
        if state_changed {
            if speaking_now {
                self.silence_since = None;
            } else {
                self.silence_since = Some(Instant::now());
            }
            self.is_speaking = speaking_now;
        }

        let silence_timeout = !self.is_speaking
            && self
                .silence_since
                .is_some_and(|since| since.elapsed() >= self.silence_duration);

        Ok(VadReport {
            is_speaking: self.is_speaking,
            state_changed,
            probability,
            rms,
            peak,
            silence_timeout,
        })
    }

    /// Clear all state: frame residue, speaking flag, and the silence clock.
    pub fn reset(&mut self) {
        self.frame_buffer.clear();
        self.is_speaking = false;
        self.silence_since = None;
        self.last_probability = 0.0;
    }
}

fn push_rms(samples: &[f32]) -> f32 {
    let mean_square: f64 = samples
        .iter()
        .map(|s| (*s as f64) * (*s as f64))
        .sum::<f64>()
        / samples.len() as f64;
    mean_square.sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vad::classifier::FrameScore;

    fn engine(threshold: f32) -> VadEngine {
        VadEngine::with_energy_classifier(threshold, 256, Duration::from_millis(0))
    }

    fn speech(len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect()
    }

    #[test]
    fn empty_input_is_an_error() {
        let mut vad = engine(0.1);
        let err = vad.process(&[]).unwrap_err();
        assert_eq!(err.code(), "VAD_ERROR");
    }

    #[test]
    fn edges_fire_on_transitions_only() -> anyhow::Result<()> {
        let mut vad = engine(0.1);

        let report = vad.process(&vec![0.0; 512])?;
        assert!(!report.is_speaking);
        assert!(!report.state_changed);

        let report = vad.process(&speech(512))?;
        assert!(report.is_speaking);
        assert!(report.state_changed);

        let report = vad.process(&speech(512))?;
        assert!(report.is_speaking);
        assert!(!report.state_changed);

        let report = vad.process(&vec![0.0; 512])?;
        assert!(!report.is_speaking);
        assert!(report.state_changed);
        Ok(())
    }

    #[test]
    fn sub_hop_pushes_carry_the_previous_state() -> anyhow::Result<()> {
        let mut vad = engine(0.1);
        vad.process(&speech(512))?;
        assert!(vad.is_speaking());

        // 100 samples < one hop: no frame completes, state must not flap to silence.
        let report = vad.process(&vec![0.0; 100])?;
        assert!(report.is_speaking);
        assert!(!report.state_changed);
        Ok(())
    }

    #[test]
    fn residue_accumulates_across_pushes() -> anyhow::Result<()> {
        let mut vad = engine(0.1);
        // Two 200-sample speech pushes: the second completes a frame and flips state.
        let report = vad.process(&speech(200))?;
        assert!(!report.is_speaking);
        let report = vad.process(&speech(200))?;
        assert!(report.is_speaking);
        assert!(report.state_changed);
        Ok(())
    }

    #[test]
    fn silence_timeout_fires_after_the_configured_duration() -> anyhow::Result<()> {
        let mut vad = engine(0.1);
        vad.process(&speech(512))?;
        // Zero silence duration: the hint fires as soon as the edge lands.
        let report = vad.process(&vec![0.0; 512])?;
        assert!(report.state_changed);
        let report = vad.process(&vec![0.0; 512])?;
        assert!(report.silence_timeout);
        Ok(())
    }

    #[test]
    fn reset_clears_state_and_residue() -> anyhow::Result<()> {
        let mut vad = engine(0.1);
        vad.process(&speech(600))?;
        assert!(vad.is_speaking());

        vad.reset();
        assert!(!vad.is_speaking());

        // After reset, silence does not register as an edge.
        let report = vad.process(&vec![0.0; 512])?;
        assert!(!report.state_changed);
        Ok(())
    }

    struct FailingClassifier;

    impl FrameClassifier for FailingClassifier {
        fn classify(&mut self, _frame: &[i16]) -> anyhow::Result<FrameScore> {
            anyhow::bail!("model unavailable")
        }
    }

    #[test]
    fn classifier_failure_falls_back_to_energy() -> anyhow::Result<()> {
        let mut vad = VadEngine::new(
            Box::new(FailingClassifier),
            256,
            Duration::from_millis(800),
        );
        let report = vad.process(&speech(512))?;
        // Energy fallback still detects the loud frames as speech.
        assert!(report.is_speaking);
        Ok(())
    }
}
