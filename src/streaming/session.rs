//! Per-client streaming session.
//!
//! A session aggregates the audio buffer, VAD engine, segmentation controller, provider
//! clients, and result history for one client, and runs as a single consumer task over a
//! bounded inbound channel. That single-consumer shape is what provides the ordering
//! guarantees: statuses precede results for each push, results go out in production
//! order, and at most one transcription is outstanding at any instant. Chunk deadlines
//! that elapse while a call is in flight simply queue behind it and coalesce into one cut
//! (the segmenter caps the range) once the session gets back to the channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::AudioBuffer;
use crate::capture::{CaptureRecord, CaptureSink};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::providers::{Corrector, Transcriber, TranscriptionRequest};
use crate::streaming::manager::GatewayStats;
use crate::streaming::protocol::{
    self, AudioFrame, ClientMessage, ControlCommand, ControlRequest, ResultBody, ServerMessage,
    SessionConfig, Status, StatusBody, VadState,
};
use crate::streaming::segmenter::{Action, Cut, Segmenter, SegmenterConfig, SegmentKind};
use crate::vad::VadEngine;

/// Accepted transcripts kept for prompt context.
const HISTORY_CAP: usize = 10;

/// Builds provider clients for a configured session.
///
/// This is the seam that keeps sessions testable: production uses HTTP clients, tests
/// inject scripted ones.
pub trait ProviderFactory: Send + Sync {
    fn transcriber(
        &self,
        config: &SessionConfig,
        settings: &Settings,
    ) -> Result<Arc<dyn Transcriber>>;

    fn corrector(
        &self,
        config: &SessionConfig,
        settings: &Settings,
    ) -> Option<Arc<dyn Corrector>>;
}

/// Default factory: HTTP clients against the configured provider endpoints.
pub struct HttpProviderFactory;

impl ProviderFactory for HttpProviderFactory {
    fn transcriber(
        &self,
        config: &SessionConfig,
        settings: &Settings,
    ) -> Result<Arc<dyn Transcriber>> {
        let client = crate::providers::HttpTranscriber::new(
            settings.asr_api_url.clone(),
            config.api_key.clone(),
            settings.asr_model.clone(),
            settings.asr_timeout(),
            settings.asr_max_concurrency,
        )?;
        Ok(Arc::new(client))
    }

    fn corrector(
        &self,
        config: &SessionConfig,
        settings: &Settings,
    ) -> Option<Arc<dyn Corrector>> {
        if !config.enable_llm {
            return None;
        }
        // The corrector reuses the session credential unless the operator pinned one.
        let api_key = settings
            .llm_api_key
            .clone()
            .unwrap_or_else(|| config.api_key.clone());
        Some(Arc::new(crate::providers::HttpCorrector::new(
            settings.llm_api_url.clone(),
            api_key,
            settings.llm_model.clone(),
            settings.llm_timeout(),
        )))
    }
}

/// Everything that exists only once the client has sent its configuration.
struct Pipeline {
    config: SessionConfig,
    buffer: AudioBuffer,
    vad: VadEngine,
    segmenter: Segmenter,
    transcriber: Arc<dyn Transcriber>,
    corrector: Option<Arc<dyn Corrector>>,
    history: VecDeque<(u64, String)>,
    recording: bool,
    capture: Option<CaptureSink>,
}

impl Pipeline {
    /// Context prompt: the last two accepted transcripts, excluding any that the pending
    /// cut is about to replace.
    fn prompt_excluding(&self, replaces: &[u64]) -> String {
        let recent: Vec<&str> = self
            .history
            .iter()
            .filter(|(id, _)| !replaces.contains(id))
            .map(|(_, text)| text.as_str())
            .collect();
        let tail = recent.len().saturating_sub(2);
        recent[tail..].join(" ")
    }
}

pub struct Session {
    id: Uuid,
    settings: Arc<Settings>,
    factory: Arc<dyn ProviderFactory>,
    outbound: mpsc::Sender<ServerMessage>,
    stats: Arc<GatewayStats>,
    pipeline: Option<Pipeline>,
    last_segment_id: u64,
}

impl Session {
    pub fn new(
        id: Uuid,
        settings: Arc<Settings>,
        factory: Arc<dyn ProviderFactory>,
        outbound: mpsc::Sender<ServerMessage>,
        stats: Arc<GatewayStats>,
    ) -> Self {
        Self {
            id,
            settings,
            factory,
            outbound,
            stats,
            pipeline: None,
            last_segment_id: 0,
        }
    }

    /// Consume inbound messages until the channel closes, the idle timeout fires, the
    /// cancellation token trips, or an unrecoverable error is reported.
    ///
    /// Cancellation mid-transcription drops the in-flight call without emitting its
    /// result; the session has moved on.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<ClientMessage>, cancel: CancellationToken) {
        let idle = self.settings.idle_timeout();

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                received = tokio::time::timeout(idle, inbound.recv()) => match received {
                    Ok(Some(message)) => message,
                    Ok(None) => break,
                    Err(_) => {
                        info!(session_id = %self.id, "closing idle session");
                        break;
                    }
                },
            };

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.handle(message) => outcome,
            };

            if let Err(err) = outcome {
                let fatal = !err.recoverable();
                warn!(session_id = %self.id, error = %err, fatal, "session error");
                self.send(ServerMessage::from_error(&err)).await;
                if fatal {
                    break;
                }
            }
        }

        self.send(ServerMessage::status(Status::Disconnected)).await;
        debug!(session_id = %self.id, "session task finished");
    }

    pub async fn handle(&mut self, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::Config(config) => self.configure(config).await,
            ClientMessage::Audio(frame) => self.push_audio(frame).await,
            ClientMessage::Control(request) => self.control(request).await,
        }
    }

    /// Build the processing pipeline and fail fast against the provider.
    async fn configure(&mut self, config: SessionConfig) -> Result<()> {
        config.validate()?;

        let transcriber = self.factory.transcriber(&config, &self.settings)?;
        transcriber.self_test().await.map_err(|err| {
            Error::configuration(format!("transcription provider self-test failed: {err}"))
        })?;
        let corrector = self.factory.corrector(&config, &self.settings);

        let threshold = config.vad_threshold.unwrap_or(self.settings.vad_threshold);
        let vad = VadEngine::with_energy_classifier(
            threshold,
            self.settings.vad_hop_size,
            std::time::Duration::from_secs_f64(self.settings.vad_silence_duration),
        );

        let segmenter = Segmenter::new(SegmenterConfig::from_settings(
            &self.settings,
            config.chunk_duration,
        ));

        let capture = self
            .settings
            .capture_dir
            .as_ref()
            .and_then(|dir| CaptureSink::create(dir.join(self.id.to_string())));

        info!(
            session_id = %self.id,
            enable_llm = config.enable_llm,
            language = config.language.as_deref().unwrap_or("auto"),
            vad_threshold = threshold,
            "session configured"
        );

        self.pipeline = Some(Pipeline {
            config,
            buffer: AudioBuffer::new(self.settings.sample_rate),
            vad,
            segmenter,
            transcriber,
            corrector,
            history: VecDeque::new(),
            recording: false,
            capture,
        });

        self.send(ServerMessage::Status(StatusBody {
            status: Status::Ready,
            vad_state: None,
            session_id: Some(self.id.to_string()),
            metadata: serde_json::json!({ "protocol_version": protocol::PROTOCOL_VERSION }),
        }))
        .await;

        Ok(())
    }

    async fn push_audio(&mut self, frame: AudioFrame) -> Result<()> {
        frame.validate()?;

        let pipeline = self.pipeline.as_mut().ok_or_else(not_configured)?;
        if !pipeline.recording {
            debug!(session_id = %self.id, "received audio while not recording");
            return Ok(());
        }
        if frame.sample_rate != pipeline.buffer.sample_rate() {
            return Err(Error::validation(format!(
                "sample_rate {} does not match the session rate {}",
                frame.sample_rate,
                pipeline.buffer.sample_rate()
            )));
        }

        pipeline.buffer.append(&frame.audio_data)?;
        let report = pipeline.vad.process(&frame.audio_data)?;

        let action = pipeline.segmenter.on_audio(
            report.is_speaking,
            report.state_changed,
            pipeline.buffer.base_offset(),
            pipeline.buffer.end_index(),
        );

        // Status first, then any result this push produced.
        let vad_state = VadState::from(&report);
        self.send(ServerMessage::Status(StatusBody {
            status: Status::Processing,
            vad_state: Some(vad_state),
            session_id: Some(self.id.to_string()),
            metadata: serde_json::Value::Null,
        }))
        .await;

        match action {
            None => {}
            Some(Action::TrimTo(index)) => {
                if let Some(pipeline) = self.pipeline.as_mut() {
                    pipeline.buffer.trim_before(index);
                }
            }
            Some(Action::Transcribe(cut)) => {
                let utterance_done = cut.kind != SegmentKind::TimeoutChunk;
                let end = cut.end;
                self.execute_cut(cut).await?;
                if utterance_done && let Some(pipeline) = self.pipeline.as_mut() {
                    pipeline.buffer.trim_before(end);
                }
            }
        }

        Ok(())
    }

    async fn control(&mut self, request: ControlRequest) -> Result<()> {
        let pipeline = self.pipeline.as_mut().ok_or_else(not_configured)?;
        debug!(session_id = %self.id, command = ?request.command, "control command");

        match request.command {
            ControlCommand::Start => {
                pipeline.recording = true;
                pipeline.segmenter.reset();
                info!(session_id = %self.id, "recording started");
            }
            ControlCommand::Stop => {
                pipeline.recording = false;
                let end_index = pipeline.buffer.end_index();
                let flush = pipeline.segmenter.flush(end_index);
                if let Some(cut) = flush {
                    self.execute_cut(cut).await?;
                }
                if let Some(pipeline) = self.pipeline.as_mut() {
                    pipeline.buffer.trim_before(end_index);
                }
                info!(session_id = %self.id, "recording stopped");
            }
            ControlCommand::Pause => {
                pipeline.recording = false;
            }
            ControlCommand::Resume => {
                pipeline.recording = true;
            }
            ControlCommand::Reset => {
                pipeline.recording = false;
                pipeline.buffer = AudioBuffer::new(self.settings.sample_rate);
                pipeline.segmenter.reset();
                pipeline.vad.reset();
                pipeline.history.clear();
                info!(session_id = %self.id, "session reset");
            }
        }

        Ok(())
    }

    /// Execute one decided transcription and emit its result.
    ///
    /// Provider failure does not propagate: the segment already has an identity and the
    /// client needs a result for it, so an empty-text result goes out with the same
    /// id/range semantics. A failed reprocess keeps its `replaces` empty so the chunks it
    /// meant to supersede stay accepted.
    async fn execute_cut(&mut self, cut: Cut) -> Result<()> {
        let Some(pipeline) = self.pipeline.as_mut() else {
            return Ok(());
        };

        let samples = pipeline.buffer.extract(cut.start, Some(cut.end))?;
        if samples.is_empty() {
            return Ok(());
        }

        let sample_rate = pipeline.buffer.sample_rate();
        let prompt = pipeline.prompt_excluding(&cut.replaces);
        let language = pipeline.config.language.clone();
        let enable_llm = pipeline.config.enable_llm;
        let transcriber = Arc::clone(&pipeline.transcriber);
        let corrector = pipeline.corrector.clone();

        let segment_id = self.next_segment_id();
        let started = Instant::now();

        let outcome = transcriber
            .transcribe(TranscriptionRequest {
                samples: samples.clone(),
                sample_rate,
                prompt,
                language,
            })
            .await;

        let (text, processing_ms, failed) = match outcome {
            Ok(transcription) => (transcription.text, transcription.processing_ms, false),
            Err(err) => {
                warn!(
                    session_id = %self.id,
                    segment_id,
                    error = %err,
                    "transcription failed; emitting empty result"
                );
                (String::new(), started.elapsed().as_millis() as u64, true)
            }
        };

        let replaces = if failed && cut.kind == SegmentKind::Reprocessed {
            Vec::new()
        } else {
            cut.replaces.clone()
        };

        let corrected_text = match (&corrector, enable_llm && !failed && !text.is_empty()) {
            (Some(corrector), true) => Some(corrector.correct(&text).await),
            _ => None,
        };

        let mut metadata = serde_json::json!({
            "audio_duration": samples.len() as f64 / sample_rate as f64,
            "start_index": cut.start,
            "end_index": cut.end,
        });
        if failed {
            metadata["error"] = serde_json::Value::String("transcription failed".into());
        }

        let body = ResultBody {
            segment_id,
            text: text.clone(),
            corrected_text: corrected_text.clone(),
            is_final: cut.kind != SegmentKind::TimeoutChunk,
            is_timeout_chunk: cut.kind == SegmentKind::TimeoutChunk,
            is_reprocessed: cut.kind == SegmentKind::Reprocessed,
            replaces_segments: replaces.clone(),
            processing_time_ms: processing_ms,
            metadata,
        };
        self.send(ServerMessage::Result(body)).await;
        self.stats.add_transcription_ms(processing_ms);
        self.stats.record_segment(cut.kind, replaces.len(), failed);

        let Some(pipeline) = self.pipeline.as_mut() else {
            return Ok(());
        };

        if cut.kind == SegmentKind::TimeoutChunk {
            pipeline.segmenter.note_chunk(segment_id, cut.start, cut.end);
        }

        if !failed && !text.is_empty() {
            if cut.kind == SegmentKind::Reprocessed {
                pipeline.history.retain(|(id, _)| !replaces.contains(id));
            }
            pipeline.history.push_back((segment_id, text.clone()));
            while pipeline.history.len() > HISTORY_CAP {
                pipeline.history.pop_front();
            }
        }

        if let Some(capture) = &pipeline.capture {
            capture.record(
                &samples,
                sample_rate,
                &CaptureRecord {
                    segment_id,
                    kind: match cut.kind {
                        SegmentKind::TimeoutChunk => "timeout_chunk",
                        SegmentKind::Final => "final",
                        SegmentKind::Reprocessed => "reprocessed",
                    },
                    start_index: cut.start,
                    end_index: cut.end,
                    text: &text,
                    corrected_text: corrected_text.as_deref(),
                    processing_time_ms: processing_ms,
                    replaces_segments: &replaces,
                },
            );
        }

        Ok(())
    }

    /// Millisecond wall-clock, bumped when two segments land in the same tick so ids
    /// stay strictly increasing.
    fn next_segment_id(&mut self) -> u64 {
        let candidate = protocol::now_ms();
        self.last_segment_id = candidate.max(self.last_segment_id + 1);
        self.last_segment_id
    }

    async fn send(&self, message: ServerMessage) {
        // A failed send means the transport is gone; the run loop will notice the closed
        // channel on its own.
        let _ = self.outbound.send(message).await;
    }
}

fn not_configured() -> Error {
    Error::configuration("session is not configured; send a config message first")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_ids_are_strictly_increasing_within_a_tick() {
        let (tx, _rx) = mpsc::channel(4);
        let mut session = Session::new(
            Uuid::new_v4(),
            Arc::new(Settings::default()),
            Arc::new(HttpProviderFactory),
            tx,
            Arc::new(GatewayStats::default()),
        );

        let a = session.next_segment_id();
        let b = session.next_segment_id();
        let c = session.next_segment_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn prompt_takes_the_last_two_accepted_excluding_replacements() {
        let pipeline_history: VecDeque<(u64, String)> = vec![
            (1, "alpha".to_owned()),
            (2, "bravo".to_owned()),
            (3, "charlie".to_owned()),
        ]
        .into();

        let pipeline = Pipeline {
            config: SessionConfig {
                api_key: "k".into(),
                enable_llm: false,
                language: None,
                vad_threshold: None,
                chunk_duration: None,
            },
            buffer: AudioBuffer::new(16_000),
            vad: VadEngine::with_energy_classifier(0.5, 256, std::time::Duration::from_millis(800)),
            segmenter: Segmenter::new(SegmenterConfig::default()),
            transcriber: Arc::new(NoopTranscriber),
            corrector: None,
            history: pipeline_history,
            recording: false,
            capture: None,
        };

        assert_eq!(pipeline.prompt_excluding(&[]), "bravo charlie");
        assert_eq!(pipeline.prompt_excluding(&[3]), "alpha bravo");
        assert_eq!(pipeline.prompt_excluding(&[1, 2, 3]), "");
    }

    struct NoopTranscriber;

    #[async_trait::async_trait]
    impl Transcriber for NoopTranscriber {
        async fn transcribe(
            &self,
            _request: TranscriptionRequest,
        ) -> Result<crate::providers::Transcription> {
            Ok(crate::providers::Transcription {
                text: String::new(),
                processing_ms: 0,
                provider_meta: serde_json::Value::Null,
            })
        }
    }
}
