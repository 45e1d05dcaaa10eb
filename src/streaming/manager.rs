//! Session manager.
//!
//! Accepts connections up to a concurrency cap, spawns one consumer task per session,
//! and routes inbound messages to it. Ownership is strictly one-way: the manager owns
//! session handles, sessions hold only a send-half to their transport, and teardown is
//! always manager → session via a cancellation token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::streaming::protocol::{ClientMessage, ServerMessage, Status};
use crate::streaming::segmenter::SegmentKind;
use crate::streaming::session::{HttpProviderFactory, ProviderFactory, Session};

const INBOUND_QUEUE: usize = 64;
const OUTBOUND_QUEUE: usize = 256;

/// Cross-session counters. Sessions get a clone of the `Arc`; nothing holds a reference
/// back to the manager.
#[derive(Default)]
pub struct GatewayStats {
    total_opened: AtomicU64,
    total_messages: AtomicU64,
    transcription_ms: AtomicU64,
    timeout_chunks_emitted: AtomicU64,
    finals_emitted: AtomicU64,
    reprocessed_emitted: AtomicU64,
    segments_replaced: AtomicU64,
    provider_failures: AtomicU64,
}

impl GatewayStats {
    pub fn add_transcription_ms(&self, ms: u64) {
        self.transcription_ms.fetch_add(ms, Ordering::Relaxed);
    }

    /// Record one emitted segment: its kind, how many prior segments it superseded, and
    /// whether the provider call behind it failed.
    pub fn record_segment(&self, kind: SegmentKind, replaced: usize, provider_failed: bool) {
        let counter = match kind {
            SegmentKind::TimeoutChunk => &self.timeout_chunks_emitted,
            SegmentKind::Final => &self.finals_emitted,
            SegmentKind::Reprocessed => &self.reprocessed_emitted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.segments_replaced
            .fetch_add(replaced as u64, Ordering::Relaxed);
        if provider_failed {
            self.provider_failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Point-in-time statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub active_sessions: usize,
    pub total_opened: u64,
    pub total_messages: u64,
    pub total_transcription_ms: u64,
    pub timeout_chunks_emitted: u64,
    pub finals_emitted: u64,
    pub reprocessed_emitted: u64,
    pub segments_replaced: u64,
    pub provider_failures: u64,
    pub uptime_seconds: u64,
    pub max_sessions: usize,
}

struct SessionHandle {
    inbound: mpsc::Sender<ClientMessage>,
    cancel: CancellationToken,
}

/// Transport-side view of an open session.
#[derive(Debug)]
pub struct SessionGateway {
    pub id: Uuid,
    /// Messages the transport must deliver to the client.
    pub outbound: mpsc::Receiver<ServerMessage>,
    /// Extra sender for transport-level errors (framing failures and the like) so they
    /// interleave correctly with session output.
    pub transport_tx: mpsc::Sender<ServerMessage>,
}

pub struct SessionManager {
    settings: Arc<Settings>,
    factory: Arc<dyn ProviderFactory>,
    sessions: Arc<Mutex<HashMap<Uuid, SessionHandle>>>,
    stats: Arc<GatewayStats>,
    started: Instant,
}

impl SessionManager {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self::with_factory(settings, Arc::new(HttpProviderFactory))
    }

    pub fn with_factory(settings: Arc<Settings>, factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            settings,
            factory,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(GatewayStats::default()),
            started: Instant::now(),
        }
    }

    /// Register a new session and spawn its consumer task.
    ///
    /// Fails with `AT_CAPACITY` when the active count is at the configured maximum.
    pub fn open(&self) -> Result<SessionGateway> {
        let id = Uuid::new_v4();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let cancel = CancellationToken::new();

        {
            let mut sessions = self.lock_sessions();
            if sessions.len() >= self.settings.max_sessions {
                return Err(Error::AtCapacity(sessions.len()));
            }
            sessions.insert(
                id,
                SessionHandle {
                    inbound: inbound_tx,
                    cancel: cancel.clone(),
                },
            );
        }
        self.stats.total_opened.fetch_add(1, Ordering::Relaxed);

        // Greet before any session output.
        let _ = outbound_tx.try_send(ServerMessage::status(Status::Connecting));

        let session = Session::new(
            id,
            Arc::clone(&self.settings),
            Arc::clone(&self.factory),
            outbound_tx.clone(),
            Arc::clone(&self.stats),
        );

        // The task owns only the session map handle, so it can deregister itself when it
        // finishes for any reason (disconnect, idle timeout, fatal error).
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            session.run(inbound_rx, cancel).await;
            sessions.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            info!(session_id = %id, "session deregistered");
        });

        info!(session_id = %id, active = self.active_count(), "session opened");

        Ok(SessionGateway {
            id,
            outbound: outbound_rx,
            transport_tx: outbound_tx,
        })
    }

    /// Deliver one inbound message to a session.
    ///
    /// Applies backpressure: when the session is mid-transcription its queue fills and
    /// this await slows the transport's read loop instead of growing without bound.
    pub async fn route(&self, id: Uuid, message: ClientMessage) -> Result<()> {
        let sender = {
            let sessions = self.lock_sessions();
            let handle = sessions
                .get(&id)
                .ok_or_else(|| Error::Streaming(format!("unknown session {id}")))?;
            handle.inbound.clone()
        };

        self.stats.total_messages.fetch_add(1, Ordering::Relaxed);
        sender
            .send(message)
            .await
            .map_err(|_| Error::Streaming(format!("session {id} is gone")))
    }

    /// Cancel a session's work and release it. In-flight transcription is dropped.
    pub fn close(&self, id: Uuid) {
        let handle = self.lock_sessions().remove(&id);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            info!(session_id = %id, "session closed");
        }
    }

    /// Tear down every session.
    pub fn shutdown(&self) {
        let handles: Vec<_> = self.lock_sessions().drain().collect();
        for (id, handle) in handles {
            handle.cancel.cancel();
            info!(session_id = %id, "session closed at shutdown");
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock_sessions().len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_sessions: self.active_count(),
            total_opened: self.stats.total_opened.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_transcription_ms: self.stats.transcription_ms.load(Ordering::Relaxed),
            timeout_chunks_emitted: self.stats.timeout_chunks_emitted.load(Ordering::Relaxed),
            finals_emitted: self.stats.finals_emitted.load(Ordering::Relaxed),
            reprocessed_emitted: self.stats.reprocessed_emitted.load(Ordering::Relaxed),
            segments_replaced: self.stats.segments_replaced.load(Ordering::Relaxed),
            provider_failures: self.stats.provider_failures.load(Ordering::Relaxed),
            uptime_seconds: self.started.elapsed().as_secs(),
            max_sessions: self.settings.max_sessions,
        }
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, SessionHandle>> {
        // Session handles can't poison anything meaningful; recover the map either way.
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_sessions: usize) -> SessionManager {
        let settings = Settings {
            max_sessions,
            ..Settings::default()
        };
        SessionManager::new(Arc::new(settings))
    }

    #[tokio::test]
    async fn open_is_rejected_at_capacity() {
        let manager = manager(1);
        let _first = manager.open().expect("first session fits");

        let err = manager.open().unwrap_err();
        assert_eq!(err.code(), "AT_CAPACITY");
        assert!(!err.recoverable());
    }

    #[tokio::test]
    async fn open_greets_with_a_connecting_status() {
        let manager = manager(4);
        let mut gateway = manager.open().expect("session");

        let message = gateway.outbound.recv().await.expect("greeting");
        let frame = message.to_frame();
        assert!(frame.contains("\"connecting\""));
    }

    #[tokio::test]
    async fn routing_to_an_unknown_session_is_a_streaming_error() {
        let manager = manager(4);
        let err = manager
            .route(
                Uuid::new_v4(),
                ClientMessage::Control(crate::streaming::protocol::ControlRequest {
                    command: crate::streaming::protocol::ControlCommand::Start,
                    parameters: None,
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "STREAMING_ERROR");
    }

    #[tokio::test]
    async fn close_releases_capacity() {
        let manager = manager(1);
        let gateway = manager.open().expect("session");
        manager.close(gateway.id);
        assert_eq!(manager.active_count(), 0);

        let _second = manager.open().expect("capacity released");
    }

    #[tokio::test]
    async fn stats_track_opens_and_messages() {
        let manager = manager(4);
        let gateway = manager.open().expect("session");

        // An unconfigured session reports an error for control messages, but the message
        // still counts as routed.
        manager
            .route(
                gateway.id,
                ClientMessage::Control(crate::streaming::protocol::ControlRequest {
                    command: crate::streaming::protocol::ControlCommand::Start,
                    parameters: None,
                }),
            )
            .await
            .expect("routed");

        let stats = manager.stats();
        assert_eq!(stats.total_opened, 1);
        assert_eq!(stats.total_messages, 1);
        assert_eq!(stats.max_sessions, 4);
    }
}
