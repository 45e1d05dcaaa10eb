//! Append-only sample store with absolute indexing.
//!
//! The segmentation layer only ever holds absolute sample indices, never raw samples.
//! Absolute indexing decouples lifetime management (trimming old silence off the front)
//! from segmentation bookkeeping: trimming moves `base_offset` forward and never
//! re-indexes what remains.

use crate::error::{Error, Result};

pub struct AudioBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
    base_offset: u64,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            samples: Vec::new(),
            sample_rate,
            base_offset: 0,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Absolute index of the first retained sample.
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Absolute index one past the last retained sample.
    pub fn end_index(&self) -> u64 {
        self.base_offset + self.samples.len() as u64
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration of the retained audio in seconds.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Append samples, clipping each to [-1.0, 1.0]. Empty input is a no-op.
    ///
    /// Non-finite samples are the one rejected input: NaN poisons every downstream metric
    /// (RMS, peak, WAV encoding), so it is refused at the door.
    pub fn append(&mut self, samples: &[f32]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        if samples.iter().any(|s| !s.is_finite()) {
            return Err(Error::audio("audio samples must be finite numbers"));
        }
        self.samples
            .extend(samples.iter().map(|s| s.clamp(-1.0, 1.0)));
        Ok(())
    }

    /// Copy out the half-open absolute range `[start_abs, end_abs)`.
    ///
    /// `end_abs = None` means "to the current end". The end is capped at the buffer end;
    /// a start before `base_offset` or past the end is a range error.
    pub fn extract(&self, start_abs: u64, end_abs: Option<u64>) -> Result<Vec<f32>> {
        if start_abs < self.base_offset || start_abs > self.end_index() {
            return Err(Error::audio(format!(
                "range start {start_abs} outside buffer [{}, {}]",
                self.base_offset,
                self.end_index()
            )));
        }

        let end_abs = end_abs.unwrap_or(self.end_index()).min(self.end_index());
        if end_abs <= start_abs {
            return Ok(Vec::new());
        }

        let lo = (start_abs - self.base_offset) as usize;
        let hi = (end_abs - self.base_offset) as usize;
        Ok(self.samples[lo..hi].to_vec())
    }

    /// Drop all samples with absolute index below `abs_index`.
    ///
    /// Idempotent when `abs_index` is at or before the current base; trimming past the end
    /// empties the buffer and parks the base at `abs_index`.
    pub fn trim_before(&mut self, abs_index: u64) {
        if abs_index <= self.base_offset {
            return;
        }
        if abs_index >= self.end_index() {
            self.samples.clear();
            self.base_offset = abs_index;
            return;
        }
        let drop = (abs_index - self.base_offset) as usize;
        self.samples.drain(..drop);
        self.base_offset = abs_index;
    }

    /// RMS level of the given absolute range (`None` end = to the current end).
    pub fn rms(&self, start_abs: u64, end_abs: Option<u64>) -> f64 {
        let Some(range) = self.clamped_range(start_abs, end_abs) else {
            return 0.0;
        };
        if range.is_empty() {
            return 0.0;
        }
        let mean_square: f64 =
            range.iter().map(|s| (*s as f64) * (*s as f64)).sum::<f64>() / range.len() as f64;
        mean_square.sqrt()
    }

    /// Peak amplitude of the given absolute range.
    pub fn peak(&self, start_abs: u64, end_abs: Option<u64>) -> f32 {
        let Some(range) = self.clamped_range(start_abs, end_abs) else {
            return 0.0;
        };
        range.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
    }

    fn clamped_range(&self, start_abs: u64, end_abs: Option<u64>) -> Option<&[f32]> {
        let start = start_abs.max(self.base_offset);
        let end = end_abs.unwrap_or(self.end_index()).min(self.end_index());
        if start >= end {
            return None;
        }
        let lo = (start - self.base_offset) as usize;
        let hi = (end - self.base_offset) as usize;
        Some(&self.samples[lo..hi])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_clips_to_unit_range() -> anyhow::Result<()> {
        let mut buf = AudioBuffer::new(16_000);
        buf.append(&[-2.0, -1.0, -0.25, 0.0, 0.25, 1.0, 3.5])?;
        assert_eq!(
            buf.extract(0, None)?,
            vec![-1.0, -1.0, -0.25, 0.0, 0.25, 1.0, 1.0]
        );
        Ok(())
    }

    #[test]
    fn append_rejects_non_finite_samples() {
        let mut buf = AudioBuffer::new(16_000);
        let err = buf.append(&[0.1, f32::NAN]).unwrap_err();
        assert_eq!(err.code(), "AUDIO_PROCESSING_ERROR");
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_append_is_a_noop() -> anyhow::Result<()> {
        let mut buf = AudioBuffer::new(16_000);
        buf.append(&[])?;
        assert_eq!(buf.len(), 0);
        Ok(())
    }

    #[test]
    fn absolute_indices_survive_trimming() -> anyhow::Result<()> {
        let mut buf = AudioBuffer::new(4);
        let samples: Vec<f32> = (0..16).map(|i| i as f32 / 16.0).collect();
        buf.append(&samples)?;

        buf.trim_before(5);
        assert_eq!(buf.base_offset(), 5);
        assert_eq!(buf.end_index(), 16);

        // The sample at absolute index 7 is bitwise what was appended there.
        assert_eq!(buf.extract(7, Some(8))?, vec![7.0 / 16.0]);

        // Trimming to an earlier index is idempotent.
        buf.trim_before(3);
        assert_eq!(buf.base_offset(), 5);
        Ok(())
    }

    #[test]
    fn trim_past_the_end_empties_and_parks_the_base() -> anyhow::Result<()> {
        let mut buf = AudioBuffer::new(4);
        buf.append(&[0.0; 8])?;
        buf.trim_before(20);
        assert!(buf.is_empty());
        assert_eq!(buf.base_offset(), 20);
        assert_eq!(buf.end_index(), 20);
        Ok(())
    }

    #[test]
    fn extract_rejects_out_of_range_starts() -> anyhow::Result<()> {
        let mut buf = AudioBuffer::new(4);
        buf.append(&[0.5; 8])?;
        buf.trim_before(4);

        assert!(buf.extract(3, None).is_err());
        assert!(buf.extract(9, None).is_err());
        // Start exactly at the end is legal and yields nothing.
        assert_eq!(buf.extract(8, None)?, Vec::<f32>::new());
        Ok(())
    }

    #[test]
    fn extract_caps_end_at_the_buffer_end() -> anyhow::Result<()> {
        let mut buf = AudioBuffer::new(4);
        buf.append(&[0.5; 8])?;
        assert_eq!(buf.extract(6, Some(100))?.len(), 2);
        Ok(())
    }

    #[test]
    fn duration_follows_sample_rate() -> anyhow::Result<()> {
        let mut buf = AudioBuffer::new(16_000);
        buf.append(&vec![0.0; 8_000])?;
        assert!((buf.duration() - 0.5).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn rms_and_peak_summaries() -> anyhow::Result<()> {
        let mut buf = AudioBuffer::new(4);
        buf.append(&[0.5, -0.5, 0.5, -0.5])?;
        assert!((buf.rms(0, None) - 0.5).abs() < 1e-6);
        assert!((buf.peak(0, None) - 0.5).abs() < 1e-6);
        assert_eq!(buf.rms(4, None), 0.0);
        Ok(())
    }
}
