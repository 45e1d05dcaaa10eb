//! Segmentation controller.
//!
//! Decides what audio to send for transcription and when, given a stream of VAD results
//! over an append-only buffer. Timeout chunks give the UI low-latency partials during
//! long utterances; the utterance-end pass re-transcribes a wider window so the
//! recognizer can produce a corrected transcript, bounded by `lookback_duration`.
//!
//! The controller is pure bookkeeping: it holds absolute sample indices, never samples,
//! and performs no I/O. Callers execute the returned `Action`s and report back via
//! `note_chunk` / `end_utterance` so replacement bookkeeping stays consistent even when a
//! provider call fails.

use crate::config::Settings;

pub type SegmentId = u64;

/// How many timeout chunks from the current utterance stay eligible for replacement.
const RECENT_CHUNK_CAP: usize = 3;

#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    pub sample_rate: u32,
    /// Maximum in-flight audio length before a timeout chunk is cut (seconds).
    pub max_segment_duration: f64,
    /// Maximum preceding audio eligible for re-transcription at utterance end (seconds).
    pub lookback_duration: f64,
    /// How far before the speech-start edge the utterance start is placed (seconds).
    pub pre_roll: f64,
    /// Maximum idle silence retained in the buffer before trimming (seconds).
    pub silence_keep: f64,
}

impl SegmenterConfig {
    pub fn from_settings(settings: &Settings, chunk_duration_override: Option<f64>) -> Self {
        let max_segment_duration = chunk_duration_override.unwrap_or(settings.chunk_duration);
        Self {
            sample_rate: settings.sample_rate,
            max_segment_duration,
            lookback_duration: settings.lookback_duration,
            pre_roll: settings.pre_roll,
            silence_keep: max_segment_duration * 2.0,
        }
    }

    fn samples(&self, seconds: f64) -> u64 {
        (seconds * self.sample_rate as f64) as u64
    }

    fn max_segment_samples(&self) -> u64 {
        self.samples(self.max_segment_duration)
    }

    fn lookback_samples(&self) -> u64 {
        self.samples(self.lookback_duration)
    }

    fn pre_roll_samples(&self) -> u64 {
        self.samples(self.pre_roll)
    }

    fn silence_keep_samples(&self) -> u64 {
        self.samples(self.silence_keep)
    }
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            max_segment_duration: 3.0,
            lookback_duration: 9.0,
            pre_roll: 0.5,
            silence_keep: 6.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    TimeoutChunk,
    Final,
    Reprocessed,
}

/// A decided transcription: which absolute range to send and what it supersedes.
#[derive(Debug, Clone)]
pub struct Cut {
    pub kind: SegmentKind,
    pub start: u64,
    pub end: u64,
    /// Ids of previously emitted segments this cut supersedes.
    pub replaces: Vec<SegmentId>,
}

/// What the caller should do after feeding one VAD result.
#[derive(Debug, Clone)]
pub enum Action {
    /// Transcribe this range.
    Transcribe(Cut),
    /// Drop buffered audio before this absolute index.
    TrimTo(u64),
}

#[derive(Debug, Clone, Copy)]
struct ChunkRecord {
    id: SegmentId,
    start: u64,
    #[allow(dead_code)]
    end: u64,
}

pub struct Segmenter {
    cfg: SegmenterConfig,
    active: bool,
    utterance_start: Option<u64>,
    last_chunk_end: u64,
    recent_chunks: Vec<ChunkRecord>,
}

impl Segmenter {
    pub fn new(cfg: SegmenterConfig) -> Self {
        Self {
            cfg,
            active: false,
            utterance_start: None,
            last_chunk_end: 0,
            recent_chunks: Vec::new(),
        }
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.cfg
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Feed one VAD result. `base_offset`/`now_index` describe the buffer at the moment
    /// this push was appended; all returned indices are absolute.
    pub fn on_audio(
        &mut self,
        is_speaking: bool,
        state_changed: bool,
        base_offset: u64,
        now_index: u64,
    ) -> Option<Action> {
        if state_changed {
            if is_speaking {
                self.begin_utterance(base_offset, now_index);
                return None;
            }
            if self.active {
                return self.end_utterance(now_index).map(Action::Transcribe);
            }
            return None;
        }

        if self.active && is_speaking {
            return self.due_chunk(now_index).map(Action::Transcribe);
        }

        // Idle silence: stop dead audio from accumulating forever.
        if !self.active
            && !is_speaking
            && now_index - base_offset >= self.cfg.silence_keep_samples()
        {
            return Some(Action::TrimTo(
                now_index.saturating_sub(self.cfg.max_segment_samples()),
            ));
        }

        None
    }

    /// Synthetic speech-end edge for control `stop`: flush the active utterance.
    pub fn flush(&mut self, now_index: u64) -> Option<Cut> {
        if !self.active {
            return None;
        }
        self.end_utterance(now_index)
    }

    /// Record an emitted timeout chunk. Called whether or not transcription succeeded:
    /// the segment went on the wire either way, and the replacement bookkeeping must
    /// match what the client saw.
    pub fn note_chunk(&mut self, id: SegmentId, start: u64, end: u64) {
        self.recent_chunks.push(ChunkRecord { id, start, end });
        if self.recent_chunks.len() > RECENT_CHUNK_CAP {
            self.recent_chunks.remove(0);
        }
        self.last_chunk_end = end;
    }

    /// Discard all utterance state.
    pub fn reset(&mut self) {
        self.active = false;
        self.utterance_start = None;
        self.last_chunk_end = 0;
        self.recent_chunks.clear();
    }

    fn begin_utterance(&mut self, base_offset: u64, now_index: u64) {
        // Pre-roll reaches back past the edge to capture the speech onset, clamped to
        // what the buffer still holds.
        let start = now_index
            .saturating_sub(self.cfg.pre_roll_samples())
            .max(base_offset);
        self.active = true;
        self.utterance_start = Some(start);
        self.last_chunk_end = start;
        self.recent_chunks.clear();
    }

    /// Cut a timeout chunk when enough unprocessed audio has piled up.
    ///
    /// When several deadlines elapsed while a transcription was in flight, this coalesces
    /// them: one cut, capped at `max_segment_duration`, ending no later than `now_index`.
    fn due_chunk(&self, now_index: u64) -> Option<Cut> {
        let max_samples = self.cfg.max_segment_samples();
        let unprocessed = now_index.saturating_sub(self.last_chunk_end);
        if unprocessed < max_samples {
            return None;
        }

        // The due condition guarantees at least max_samples of unprocessed audio, so the
        // cap always lands exactly one max_segment_duration past the last cut.
        let start = self.last_chunk_end;
        let end = (start + max_samples).min(now_index);

        Some(Cut {
            kind: SegmentKind::TimeoutChunk,
            start,
            end,
            replaces: Vec::new(),
        })
    }

    /// Utterance-end policy. Always transitions to IDLE; returns the cut to transcribe,
    /// if the utterance contained any audio.
    fn end_utterance(&mut self, now_index: u64) -> Option<Cut> {
        let start = self.utterance_start.unwrap_or(0);
        let chunks = std::mem::take(&mut self.recent_chunks);
        let last_chunk_end = self.last_chunk_end;

        self.active = false;
        self.utterance_start = None;
        self.last_chunk_end = 0;

        if now_index <= start {
            return None;
        }

        // No timeout chunks: the whole utterance becomes a single final segment.
        if chunks.is_empty() {
            return Some(Cut {
                kind: SegmentKind::Final,
                start,
                end: now_index,
                replaces: Vec::new(),
            });
        }

        // Short enough to re-transcribe wholesale.
        if now_index - start <= self.cfg.lookback_samples() {
            return Some(Cut {
                kind: SegmentKind::Reprocessed,
                start,
                end: now_index,
                replaces: chunks.iter().map(|c| c.id).collect(),
            });
        }

        // Long utterance: re-transcribe from the first chunk boundary inside the
        // lookback window, so the replaced region is an exact suffix of what was emitted.
        let lookback_start = now_index.saturating_sub(self.cfg.lookback_samples());
        if let Some(pos) = chunks.iter().position(|c| c.start >= lookback_start) {
            return Some(Cut {
                kind: SegmentKind::Reprocessed,
                start: chunks[pos].start,
                end: now_index,
                replaces: chunks[pos..].iter().map(|c| c.id).collect(),
            });
        }

        // No chunk boundary falls within the window: transcribe only the tail; the
        // earlier chunks stay accepted.
        if now_index > last_chunk_end {
            return Some(Cut {
                kind: SegmentKind::Final,
                start: last_chunk_end,
                end: now_index,
                replaces: Vec::new(),
            });
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u64 = 16_000;

    fn segmenter() -> Segmenter {
        Segmenter::new(SegmenterConfig::default())
    }

    fn cut(action: Option<Action>) -> Cut {
        match action {
            Some(Action::Transcribe(cut)) => cut,
            other => panic!("expected a transcription, got {other:?}"),
        }
    }

    #[test]
    fn speech_edge_places_the_start_pre_roll_back() {
        let mut seg = segmenter();
        assert!(seg.on_audio(true, true, 0, 24_000).is_none());
        assert!(seg.is_active());

        // Pre-roll of 0.5 s = 8000 samples.
        let end = cut(seg.on_audio(false, true, 0, 30_000));
        assert_eq!(end.kind, SegmentKind::Final);
        assert_eq!(end.start, 16_000);
        assert_eq!(end.end, 30_000);
        assert!(end.replaces.is_empty());
        assert!(!seg.is_active());
    }

    #[test]
    fn pre_roll_is_clamped_to_the_buffer_base() {
        let mut seg = segmenter();
        seg.on_audio(true, true, 2_000, 4_000);
        let end = cut(seg.on_audio(false, true, 2_000, 20_000));
        assert_eq!(end.start, 2_000);
    }

    #[test]
    fn chunk_becomes_due_after_max_segment_duration() {
        let mut seg = segmenter();
        seg.on_audio(true, true, 0, 8_000);
        // utterance_start = 0 after pre-roll clamp; due at 3 s of unprocessed audio.
        assert!(seg.on_audio(true, false, 0, 40_000).is_none());

        let chunk = cut(seg.on_audio(true, false, 0, RATE * 3));
        assert_eq!(chunk.kind, SegmentKind::TimeoutChunk);
        assert_eq!((chunk.start, chunk.end), (0, RATE * 3));

        // Not due again until the emission is acknowledged and more audio accrues.
        seg.note_chunk(1, chunk.start, chunk.end);
        assert!(seg.on_audio(true, false, 0, RATE * 3 + 100).is_none());
    }

    #[test]
    fn elapsed_deadlines_coalesce_into_one_capped_chunk() {
        let mut seg = segmenter();
        seg.on_audio(true, true, 0, 4_000);

        // 7 s of unprocessed audio piled up during an in-flight call: one 3 s cut.
        let chunk = cut(seg.on_audio(true, false, 0, RATE * 7));
        assert_eq!((chunk.start, chunk.end), (0, RATE * 3));
    }

    #[test]
    fn short_utterance_ends_in_a_single_final() {
        let mut seg = segmenter();
        seg.on_audio(true, true, 0, 16_000);
        let end = cut(seg.on_audio(false, true, 0, 40_000));
        assert_eq!(end.kind, SegmentKind::Final);
        assert_eq!((end.start, end.end), (8_000, 40_000));
    }

    #[test]
    fn utterance_with_chunks_reprocesses_wholesale_within_lookback() {
        let mut seg = segmenter();
        seg.on_audio(true, true, 0, 8_000);
        let c1 = cut(seg.on_audio(true, false, 0, RATE * 3));
        seg.note_chunk(11, c1.start, c1.end);

        // 4.5 s total, under the 9 s lookback: replace C1 with the whole range.
        let end = cut(seg.on_audio(false, true, 0, 72_000));
        assert_eq!(end.kind, SegmentKind::Reprocessed);
        assert_eq!((end.start, end.end), (0, 72_000));
        assert_eq!(end.replaces, vec![11]);
    }

    #[test]
    fn long_utterance_cuts_at_a_chunk_boundary_inside_the_lookback() {
        let mut seg = segmenter();
        seg.on_audio(true, true, 0, 8_000);

        let mut ids = Vec::new();
        for id in 1..=4u64 {
            let chunk = cut(seg.on_audio(true, false, 0, RATE * 3 * id));
            seg.note_chunk(id, chunk.start, chunk.end);
            ids.push(id);
        }

        // Silence at 12.5 s; lookback window starts at 200000 - 144000 = 56000. Chunks
        // started at 0/48000/96000/144000; the first inside the window is C3.
        let end = cut(seg.on_audio(false, true, 0, 200_000));
        assert_eq!(end.kind, SegmentKind::Reprocessed);
        assert_eq!((end.start, end.end), (96_000, 200_000));
        assert_eq!(end.replaces, vec![3, 4]);
    }

    #[test]
    fn tail_final_when_no_chunk_boundary_is_in_the_window() {
        // Chunk duration larger than lookback forces the no-boundary branch.
        let mut seg = Segmenter::new(SegmenterConfig {
            max_segment_duration: 4.0,
            lookback_duration: 3.0,
            silence_keep: 8.0,
            ..SegmenterConfig::default()
        });
        seg.on_audio(true, true, 0, 8_000);

        let c1 = cut(seg.on_audio(true, false, 0, RATE * 4));
        seg.note_chunk(1, c1.start, c1.end);

        // End at 5 s: window starts at 2 s, C1 started at 0 -> outside. Only the tail
        // past the last chunk is transcribed; C1 stays accepted.
        let end = cut(seg.on_audio(false, true, 0, RATE * 5));
        assert_eq!(end.kind, SegmentKind::Final);
        assert_eq!((end.start, end.end), (RATE * 4, RATE * 5));
        assert!(end.replaces.is_empty());
    }

    #[test]
    fn recent_chunks_cap_at_three() {
        let mut seg = segmenter();
        seg.on_audio(true, true, 0, 8_000);
        for id in 1..=5u64 {
            seg.note_chunk(id, RATE * 3 * (id - 1), RATE * 3 * id);
        }

        // Silence at 15 s: the lookback window opens at 96000, exactly where the oldest
        // retained chunk starts. Chunks 1 and 2 aged out of the replaceable set.
        let end = cut(seg.flush(RATE * 15).map(Action::Transcribe));
        assert_eq!(end.kind, SegmentKind::Reprocessed);
        assert_eq!((end.start, end.end), (96_000, RATE * 15));
        assert_eq!(end.replaces, vec![3, 4, 5]);
    }

    #[test]
    fn idle_silence_triggers_a_bounded_trim() {
        let mut seg = segmenter();
        // 6.5 s of idle silence: keep only the last 3 s.
        let action = seg.on_audio(false, false, 0, 104_000);
        match action {
            Some(Action::TrimTo(index)) => assert_eq!(index, 104_000 - RATE * 3),
            other => panic!("expected a trim, got {other:?}"),
        }

        // Active utterances are never trimmed this way.
        seg.on_audio(true, true, 0, 104_000);
        assert!(seg.on_audio(false, false, 0, 200_000).is_none());
        assert!(seg.is_active());
    }

    #[test]
    fn flush_acts_as_a_synthetic_silence_edge() {
        let mut seg = segmenter();
        seg.on_audio(true, true, 0, 8_000);
        let c1 = cut(seg.on_audio(true, false, 0, RATE * 3));
        seg.note_chunk(7, c1.start, c1.end);

        let end = seg.flush(RATE * 4).expect("expected a flush cut");
        assert_eq!(end.kind, SegmentKind::Reprocessed);
        assert_eq!(end.replaces, vec![7]);
        assert!(!seg.is_active());

        // Nothing left to flush.
        assert!(seg.flush(RATE * 4).is_none());
    }

    #[test]
    fn empty_utterances_produce_no_cut() {
        let mut seg = segmenter();
        seg.on_audio(true, true, 0, 0);
        assert!(seg.on_audio(false, true, 0, 0).is_none());
        assert!(!seg.is_active());
    }

    #[test]
    fn reset_is_idempotent() {
        let mut seg = segmenter();
        seg.on_audio(true, true, 0, 8_000);
        seg.note_chunk(1, 0, RATE * 3);

        seg.reset();
        seg.reset();
        assert!(!seg.is_active());
        // A fresh utterance starts clean.
        seg.on_audio(true, true, 0, 8_000);
        let end = cut(seg.on_audio(false, true, 0, 40_000));
        assert!(end.replaces.is_empty());
    }
}
