use anyhow::Result;

/// Verdict for a single fixed-hop frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameScore {
    /// Speech probability in [0.0, 1.0].
    pub probability: f32,
    pub is_speech: bool,
}

/// A per-frame speech classifier.
///
/// Implementations receive fixed-hop frames of 16-bit PCM and return a speech verdict.
/// They may keep internal state; one classifier instance belongs to one session.
pub trait FrameClassifier: Send + Sync {
    fn classify(&mut self, frame: &[i16]) -> Result<FrameScore>;
}

/// Energy-thresholding classifier.
///
/// The default classifier and the fallback when a model-backed one fails: a frame is
/// speech when its normalized RMS exceeds the threshold. Crude, but dependable.
pub struct EnergyClassifier {
    threshold: f32,
}

impl EnergyClassifier {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub(crate) fn score(&self, frame: &[i16]) -> FrameScore {
        let rms = frame_rms(frame);
        FrameScore {
            probability: rms.min(1.0),
            is_speech: rms > self.threshold,
        }
    }
}

impl Default for EnergyClassifier {
    fn default() -> Self {
        // Normalized RMS of quiet room noise sits well below this.
        Self::new(0.01)
    }
}

impl FrameClassifier for EnergyClassifier {
    fn classify(&mut self, frame: &[i16]) -> Result<FrameScore> {
        Ok(self.score(frame))
    }
}

pub(crate) fn frame_rms(frame: &[i16]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let mean_square: f64 = frame
        .iter()
        .map(|s| {
            let v = *s as f64 / 32_768.0;
            v * v
        })
        .sum::<f64>()
        / frame.len() as f64;
    mean_square.sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loud_frames_are_speech() -> anyhow::Result<()> {
        let mut classifier = EnergyClassifier::new(0.1);
        let loud = vec![16_384i16; 256];
        let score = classifier.classify(&loud)?;
        assert!(score.is_speech);
        assert!(score.probability > 0.4);
        Ok(())
    }

    #[test]
    fn silent_frames_are_not_speech() -> anyhow::Result<()> {
        let mut classifier = EnergyClassifier::new(0.1);
        let quiet = vec![0i16; 256];
        let score = classifier.classify(&quiet)?;
        assert!(!score.is_speech);
        assert_eq!(score.probability, 0.0);
        Ok(())
    }

    #[test]
    fn rms_of_empty_frame_is_zero() {
        assert_eq!(frame_rms(&[]), 0.0);
    }
}
