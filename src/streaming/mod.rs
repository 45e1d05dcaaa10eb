//! The per-session streaming pipeline and its multiplexing.
//!
//! Data flow: inbound audio frames → `AudioBuffer` → `VadEngine` → `Segmenter` →
//! transcription provider (→ corrector) → session emitter → wire protocol → client.
//! Control flow (`start`/`stop`/`reset`) preempts the segmenter and flushes pending
//! work.

pub mod manager;
pub mod protocol;
pub mod segmenter;
pub mod session;

pub use manager::{SessionManager, StatsSnapshot};
pub use protocol::{ClientMessage, ServerMessage};
pub use segmenter::{Segmenter, SegmenterConfig};
pub use session::{HttpProviderFactory, ProviderFactory, Session};
