//! Prometheus metrics for the gateway.
//!
//! The session pipeline keeps its counters in the manager's `GatewayStats` (the library
//! has no prometheus dependency); this module projects a snapshot of those counters into
//! a registry at scrape time. Counters are delta-synced so they stay monotonic no matter
//! how often `/metrics` is hit.

use std::sync::OnceLock;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use prometheus::{
    Counter, Encoder, IntCounter, IntCounterVec, IntGauge, Opts as PromOpts, Registry,
    TextEncoder,
};

use parlance::streaming::StatsSnapshot;

use crate::AppState;

struct Metrics {
    registry: Registry,
    active_sessions: IntGauge,
    sessions_opened_total: IntCounter,
    messages_total: IntCounter,
    segments_emitted_total: IntCounterVec,
    segments_replaced_total: IntCounter,
    provider_failures_total: IntCounter,
    transcription_seconds_total: Counter,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn build_metrics() -> Result<Metrics> {
    let registry = Registry::new();

    let active_sessions = IntGauge::new(
        "parlance_active_sessions",
        "Current number of open streaming sessions.",
    )
    .context("invalid definition for parlance_active_sessions")?;

    let sessions_opened_total = IntCounter::new(
        "parlance_sessions_opened_total",
        "Streaming sessions opened since startup.",
    )
    .context("invalid definition for parlance_sessions_opened_total")?;

    let messages_total = IntCounter::new(
        "parlance_messages_total",
        "Inbound streaming messages routed to sessions.",
    )
    .context("invalid definition for parlance_messages_total")?;

    let segments_emitted_total = IntCounterVec::new(
        PromOpts::new(
            "parlance_segments_emitted_total",
            "Transcript segments emitted, by kind.",
        ),
        &["kind"],
    )
    .context("invalid definition for parlance_segments_emitted_total")?;

    let segments_replaced_total = IntCounter::new(
        "parlance_segments_replaced_total",
        "Previously emitted segments superseded by a reprocessed result.",
    )
    .context("invalid definition for parlance_segments_replaced_total")?;

    let provider_failures_total = IntCounter::new(
        "parlance_provider_failures_total",
        "Transcription provider calls that failed and produced an empty result.",
    )
    .context("invalid definition for parlance_provider_failures_total")?;

    let transcription_seconds_total = Counter::new(
        "parlance_transcription_seconds_total",
        "Cumulative wall-clock time spent in transcription provider calls.",
    )
    .context("invalid definition for parlance_transcription_seconds_total")?;

    registry
        .register(Box::new(active_sessions.clone()))
        .context("failed to register parlance_active_sessions")?;
    registry
        .register(Box::new(sessions_opened_total.clone()))
        .context("failed to register parlance_sessions_opened_total")?;
    registry
        .register(Box::new(messages_total.clone()))
        .context("failed to register parlance_messages_total")?;
    registry
        .register(Box::new(segments_emitted_total.clone()))
        .context("failed to register parlance_segments_emitted_total")?;
    registry
        .register(Box::new(segments_replaced_total.clone()))
        .context("failed to register parlance_segments_replaced_total")?;
    registry
        .register(Box::new(provider_failures_total.clone()))
        .context("failed to register parlance_provider_failures_total")?;
    registry
        .register(Box::new(transcription_seconds_total.clone()))
        .context("failed to register parlance_transcription_seconds_total")?;

    Ok(Metrics {
        registry,
        active_sessions,
        sessions_opened_total,
        messages_total,
        segments_emitted_total,
        segments_replaced_total,
        provider_failures_total,
        transcription_seconds_total,
    })
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

pub fn init() -> Result<()> {
    if metrics().is_some() {
        return Ok(());
    }

    let built = build_metrics()?;
    let _ = METRICS.set(built);
    Ok(())
}

/// Project a manager snapshot into the registry.
fn sync(snapshot: &StatsSnapshot) {
    let Some(metrics) = metrics() else {
        return;
    };

    metrics
        .active_sessions
        .set(snapshot.active_sessions as i64);
    bump_to(&metrics.sessions_opened_total, snapshot.total_opened);
    bump_to(&metrics.messages_total, snapshot.total_messages);
    bump_to(
        &metrics
            .segments_emitted_total
            .with_label_values(&["timeout_chunk"]),
        snapshot.timeout_chunks_emitted,
    );
    bump_to(
        &metrics.segments_emitted_total.with_label_values(&["final"]),
        snapshot.finals_emitted,
    );
    bump_to(
        &metrics
            .segments_emitted_total
            .with_label_values(&["reprocessed"]),
        snapshot.reprocessed_emitted,
    );
    bump_to(&metrics.segments_replaced_total, snapshot.segments_replaced);
    bump_to(&metrics.provider_failures_total, snapshot.provider_failures);

    let seconds = snapshot.total_transcription_ms as f64 / 1_000.0;
    let current = metrics.transcription_seconds_total.get();
    if seconds > current {
        metrics.transcription_seconds_total.inc_by(seconds - current);
    }
}

/// Advance a counter to `target` without ever moving it backwards.
fn bump_to(counter: &IntCounter, target: u64) {
    let current = counter.get();
    if target > current {
        counter.inc_by(target - current);
    }
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    if metrics().is_none()
        && let Err(err) = init()
    {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to initialize metrics: {err:#}"),
        )
            .into_response();
    }

    sync(&state.manager.stats());

    let Some(metrics) = metrics() else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "metrics not initialized").into_response();
    };

    let families = metrics.registry.gather();
    let mut buf = Vec::new();
    if TextEncoder::new().encode(&families, &mut buf).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to encode metrics",
        )
            .into_response();
    }

    (
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
        )],
        buf,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(transcripts: u64) -> StatsSnapshot {
        StatsSnapshot {
            active_sessions: 2,
            total_opened: 5,
            total_messages: 40,
            total_transcription_ms: 1_500,
            timeout_chunks_emitted: transcripts,
            finals_emitted: 1,
            reprocessed_emitted: 1,
            segments_replaced: transcripts,
            provider_failures: 1,
            uptime_seconds: 60,
            max_sessions: 100,
        }
    }

    #[test]
    fn init_is_idempotent_and_registers_domain_families() {
        init().unwrap();
        init().unwrap();

        sync(&snapshot(3));

        let families = metrics().unwrap().registry.gather();
        let names: Vec<&str> = families.iter().map(|f| f.name()).collect();
        assert!(names.contains(&"parlance_active_sessions"));
        assert!(names.contains(&"parlance_sessions_opened_total"));
        assert!(names.contains(&"parlance_segments_emitted_total"));
        assert!(names.contains(&"parlance_segments_replaced_total"));
        assert!(names.contains(&"parlance_provider_failures_total"));
        assert!(names.contains(&"parlance_transcription_seconds_total"));
    }

    #[test]
    fn sync_is_monotonic_across_repeated_scrapes() {
        init().unwrap();

        sync(&snapshot(3));
        sync(&snapshot(3));
        let chunks = metrics()
            .unwrap()
            .segments_emitted_total
            .with_label_values(&["timeout_chunk"])
            .get();
        assert_eq!(chunks, 3);

        // A grown snapshot advances by the delta only.
        sync(&snapshot(7));
        let chunks = metrics()
            .unwrap()
            .segments_emitted_total
            .with_label_values(&["timeout_chunk"])
            .get();
        assert_eq!(chunks, 7);
    }

    #[tokio::test]
    async fn prometheus_metrics_returns_text_format() -> anyhow::Result<()> {
        use std::sync::Arc;

        init().unwrap();

        let settings = Arc::new(parlance::Settings::default());
        let state = AppState {
            manager: Arc::new(parlance::SessionManager::new(Arc::clone(&settings))),
            settings,
        };

        let resp = prometheus_metrics(State(state)).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()
                .get(header::CONTENT_TYPE)
                .expect("content-type header")
                .to_str()?,
            "text/plain; version=0.0.4; charset=utf-8"
        );

        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await?;
        let text = std::str::from_utf8(&bytes)?;
        assert!(text.contains("parlance_active_sessions"));
        assert!(text.contains("parlance_segments_emitted_total"));
        Ok(())
    }
}
