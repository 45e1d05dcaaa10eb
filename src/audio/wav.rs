//! In-memory WAV encoding and decoding via `hound`.

use std::io::Cursor;

use anyhow::Context;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::error::{Error, Result};

/// Encode float samples as little-endian 16-bit PCM mono WAV, in memory.
///
/// This is the payload shape the transcription provider expects; samples are clamped
/// before scaling so out-of-range input can't wrap around.
pub fn encode_pcm16_mono(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer =
            WavWriter::new(&mut cursor, spec).context("failed to start WAV writer")?;
        for sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer
                .write_sample(value)
                .context("failed to write WAV sample")?;
        }
        writer.finalize().context("failed to finalize WAV")?;
    }

    Ok(cursor.into_inner())
}

/// Decode a WAV payload into normalized mono f32 samples plus its sample rate.
///
/// Multi-channel input is downmixed by averaging. Integer widths of 16/24/32 bits and
/// 32-bit float payloads are accepted.
pub fn decode(bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut reader = WavReader::new(Cursor::new(bytes))
        .map_err(|err| Error::validation(format!("not a readable WAV payload: {err}")))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|err| Error::validation(format!("corrupt WAV float data: {err}")))?,
        (SampleFormat::Int, bits @ (16 | 24 | 32)) => {
            let scale = (1i64 << (bits - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|err| Error::validation(format!("corrupt WAV PCM data: {err}")))?
        }
        (format, bits) => {
            return Err(Error::validation(format!(
                "unsupported WAV encoding: {format:?} at {bits} bits"
            )));
        }
    };

    Ok((downmix(&interleaved, channels), spec.sample_rate))
}

fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_round_trips_mono_pcm() -> anyhow::Result<()> {
        let samples = vec![0.0, 0.5, -0.5, 1.0, -1.0];
        let bytes = encode_pcm16_mono(&samples, 16_000)?;

        // RIFF header plus 2 bytes per sample.
        assert_eq!(&bytes[..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");

        let (decoded, rate) = decode(&bytes)?;
        assert_eq!(rate, 16_000);
        assert_eq!(decoded.len(), samples.len());
        for (got, want) in decoded.iter().zip(&samples) {
            assert!((got - want).abs() < 1e-3, "got {got}, want {want}");
        }
        Ok(())
    }

    #[test]
    fn encode_clamps_out_of_range_samples() -> anyhow::Result<()> {
        let bytes = encode_pcm16_mono(&[4.0, -4.0], 8_000)?;
        let (decoded, _) = decode(&bytes)?;
        assert!((decoded[0] - 1.0).abs() < 1e-3);
        assert!((decoded[1] + 1.0).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn decode_downmixes_stereo() -> anyhow::Result<()> {
        let spec = WavSpec {
            channels: 2,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec)?;
            // One frame: L = 0.5, R = -0.5 -> mono 0.0; one frame: L = R = 0.5 -> 0.5.
            for value in [16_383i16, -16_383, 16_383, 16_383] {
                writer.write_sample(value)?;
            }
            writer.finalize()?;
        }

        let (decoded, _) = decode(&cursor.into_inner())?;
        assert_eq!(decoded.len(), 2);
        assert!(decoded[0].abs() < 1e-3);
        assert!((decoded[1] - 0.5).abs() < 1e-2);
        Ok(())
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode(b"definitely not audio").unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
