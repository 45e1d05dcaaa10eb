//! Thin decode adapter for the one-shot REST surfaces.
//!
//! The streaming core only ever sees decoded float samples at a known sample rate; this
//! module is the boundary where uploaded files become that. WAV goes through `hound`,
//! FLAC/OGG (and WAV as a second chance) through Symphonia, and compressed formats
//! (MP3/M4A/WEBM/AAC) through an `ffmpeg` subprocess when one is on PATH.

use std::io::{Cursor, Read, Write};
use std::process::{Command, Stdio};

use anyhow::{Context, anyhow};
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, WindowFunction};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSourceStream, MediaSourceStreamOptions, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::audio::wav;
use crate::error::{Error, Result};

/// Formats Symphonia handles natively here; everything else goes through ffmpeg.
const NATIVE_FORMATS: &[&str] = &["wav", "flac", "ogg"];

/// Decode an uploaded audio payload into normalized mono f32 samples plus sample rate.
///
/// `format` is the client-declared tag (file extension, lowercase); when absent, the
/// payload is sniffed. Compressed formats require ffmpeg; without one the error tells the
/// operator what to install.
pub fn decode_audio(bytes: &[u8], format: Option<&str>) -> Result<(Vec<f32>, u32)> {
    if bytes.is_empty() {
        return Err(Error::validation("audio payload was empty"));
    }

    let format = format.map(|f| f.trim_start_matches('.').to_ascii_lowercase());
    let format = format.as_deref().or_else(|| sniff_format(bytes));

    match format {
        Some("wav") => {
            // hound first; some WAV variants (e.g. odd chunk layouts) still probe fine
            // through Symphonia.
            wav::decode(bytes).or_else(|_| decode_with_symphonia(bytes, Some("wav")))
        }
        Some(tag) if NATIVE_FORMATS.contains(&tag) => decode_with_symphonia(bytes, Some(tag)),
        Some(tag) => decode_with_ffmpeg(bytes, tag),
        None => decode_with_symphonia(bytes, None),
    }
}

/// Resample mono samples from `from_rate` to `to_rate`.
///
/// One-shot wrapper around rubato's sinc resampler: feeds fixed input blocks and
/// zero-pads the final partial block.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    const BLOCK_FRAMES: usize = 2048;

    let mut resampler = SincFixedIn::<f32>::new(
        to_rate as f64 / from_rate as f64,
        2.0,
        SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: rubato::SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        },
        BLOCK_FRAMES,
        1,
    )
    .map_err(|e| anyhow!(e))
    .context("failed to init resampler")?;

    let mut padded = samples.to_vec();
    let rem = padded.len() % BLOCK_FRAMES;
    if rem != 0 {
        padded.resize(padded.len() + (BLOCK_FRAMES - rem), 0.0);
    }

    let mut out = Vec::with_capacity(
        (samples.len() as f64 * to_rate as f64 / from_rate as f64) as usize + BLOCK_FRAMES,
    );
    for block in padded.chunks(BLOCK_FRAMES) {
        let produced = resampler
            .process(&[block.to_vec()], None)
            .map_err(|e| anyhow!(e))
            .context("resampler process failed")?;
        out.extend_from_slice(&produced[0]);
    }

    Ok(out)
}

fn sniff_format(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        Some("wav")
    } else if bytes.starts_with(b"fLaC") {
        Some("flac")
    } else if bytes.starts_with(b"OggS") {
        Some("ogg")
    } else {
        None
    }
}

fn decode_with_symphonia(bytes: &[u8], hint_extension: Option<&str>) -> Result<(Vec<f32>, u32)> {
    let source = ReadOnlySource::new(Cursor::new(bytes.to_vec()));
    let mss = MediaSourceStream::new(
        Box::new(source),
        MediaSourceStreamOptions {
            buffer_len: 256 * 1024,
        },
    );

    let mut hint = Hint::new();
    if let Some(ext) = hint_extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| Error::validation(format!("unrecognized media container: {e}")))?;

    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL && t.codec_params.sample_rate.is_some())
        .cloned()
        .ok_or_else(|| Error::validation("no audio track found"))?;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| Error::validation("audio track has no sample rate"))?;
    let channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(1);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| anyhow!(e))
        .context("failed to create decoder for audio track")?;

    let mut interleaved = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            // IO error means end-of-stream for an in-memory source.
            Err(SymphoniaError::IoError(_)) => break,
            Err(e) => return Err(anyhow!(e).context("failed reading packet").into()),
        };
        if packet.track_id() != track.id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let buf = sample_buf.get_or_insert_with(|| {
                    SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec())
                });
                buf.copy_interleaved_ref(decoded);
                interleaved.extend_from_slice(buf.samples());
            }
            // Skip corrupt frames; treat IO errors as end-of-stream.
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(SymphoniaError::IoError(_)) => break,
            Err(e) => return Err(anyhow!(e).context("decoder failure").into()),
        }
    }

    if interleaved.is_empty() {
        return Err(Error::validation("media contained no decodable audio"));
    }

    Ok((downmix(&interleaved, channels.max(1)), sample_rate))
}

/// Transcode via an external ffmpeg into 16 kHz mono s16le, then normalize.
fn decode_with_ffmpeg(bytes: &[u8], format: &str) -> Result<(Vec<f32>, u32)> {
    const FFMPEG_RATE: u32 = 16_000;

    if which::which("ffmpeg").is_err() {
        return Err(Error::validation(format!(
            "unsupported audio format '{format}': install ffmpeg for MP3/M4A/WEBM/AAC support, \
             or upload WAV/FLAC/OGG"
        )));
    }

    let mut child = Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-i",
            "pipe:0",
            "-f",
            "s16le",
            "-acodec",
            "pcm_s16le",
            "-ar",
            "16000",
            "-ac",
            "1",
            "pipe:1",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to spawn ffmpeg")?;

    // Write the input on a separate thread so a large transcode can't deadlock the pipes.
    let mut stdin = child.stdin.take().context("ffmpeg stdin unavailable")?;
    let input = bytes.to_vec();
    let writer = std::thread::spawn(move || {
        let _ = stdin.write_all(&input);
    });

    let output = child
        .wait_with_output()
        .context("failed waiting for ffmpeg")?;
    let _ = writer.join();

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::validation(format!(
            "ffmpeg could not transcode '{format}' input: {}",
            stderr.trim()
        )));
    }

    let mut samples = Vec::with_capacity(output.stdout.len() / 2);
    let mut reader = Cursor::new(output.stdout);
    let mut frame = [0u8; 2];
    while reader.read_exact(&mut frame).is_ok() {
        samples.push(i16::from_le_bytes(frame) as f32 / i16::MAX as f32);
    }

    if samples.is_empty() {
        return Err(Error::validation("ffmpeg produced no audio"));
    }

    Ok((samples, FFMPEG_RATE))
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
    fn decodes_wav_payloads_by_sniffing() -> anyhow::Result<()> {
        let samples = vec![0.25f32; 1_600];
        let bytes = wav::encode_pcm16_mono(&samples, 16_000)?;

        let (decoded, rate) = decode_audio(&bytes, None)?;
        assert_eq!(rate, 16_000);
        assert_eq!(decoded.len(), samples.len());
        Ok(())
    }

    #[test]
    fn declared_format_beats_sniffing() -> anyhow::Result<()> {
        let bytes = wav::encode_pcm16_mono(&[0.1f32; 160], 8_000)?;
        let (_, rate) = decode_audio(&bytes, Some("wav"))?;
        assert_eq!(rate, 8_000);
        Ok(())
    }

    #[test]
    fn empty_payload_is_a_validation_error() {
        let err = decode_audio(&[], None).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn unknown_garbage_is_a_validation_error() {
        let err = decode_audio(b"not audio at all", None).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn resample_is_identity_at_equal_rates() -> anyhow::Result<()> {
        let samples = vec![0.5f32; 100];
        assert_eq!(resample(&samples, 16_000, 16_000)?, samples);
        Ok(())
    }

    #[test]
    fn resample_halves_the_sample_count_for_2x_downsample() -> anyhow::Result<()> {
        let samples = vec![0.1f32; 32_000];
        let out = resample(&samples, 32_000, 16_000)?;
        // Block padding adds a little slack; the ratio should still be ~0.5.
        let ratio = out.len() as f64 / samples.len() as f64;
        assert!((ratio - 0.5).abs() < 0.1, "ratio was {ratio}");
        Ok(())
    }

    #[test]
    fn sniffs_known_magic_numbers() {
        assert_eq!(sniff_format(b"fLaC...."), Some("flac"));
        assert_eq!(sniff_format(b"OggS...."), Some("ogg"));
        assert_eq!(sniff_format(b"????"), None);
    }
}
