//! # podium-core
//!
//! Dominant speaker identification for multi-party conferences.
//!
//! ## Architecture
//!
//! ```text
//! report_level(id, level, ts) ──► Registry ──► SpeakerState (per participant)
//!                                    │            levels → immediates → mediums → longs
//!                                    │            noise floor gate, binomial scores
//!                                    ▼
//!                         decision scheduler thread (lazy)
//!                           ├─ idle sweep every 40 ms
//!                           └─ global decision every 300 ms
//!                                    │
//!              DominantSpeakerListener + broadcast::Sender<DominantSpeakerEvent>
//! ```
//!
//! Producers never block on the scheduler. The scheduler starts with the
//! first reported level and stops itself once reports dry up.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod buffering;
pub mod clock;
pub mod engine;
pub mod error;
pub mod events;
pub mod scoring;
pub mod speaker;

/// Opaque participant identifier (typically the RTP SSRC).
pub type ParticipantId = u64;

// Convenience re-exports for downstream crates
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::scheduler::{DetectorDiagnostics, DiagnosticsSnapshot};
pub use engine::{DetectorConfig, DominantSpeakerDetector};
pub use error::{PodiumError, Result};
pub use events::{DominantSpeakerEvent, DominantSpeakerListener, SchedulerStatus};
pub use scoring::{Scale, SpeechActivityScores};
