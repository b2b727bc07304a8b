//! Dominant speaker notifications.
//!
//! Hosts observe decisions either through a [`DominantSpeakerListener`]
//! invoked on the scheduler thread, or by subscribing to the broadcast
//! channel of [`DominantSpeakerEvent`]s. Both fire once per change.

use serde::{Deserialize, Serialize};

use crate::ParticipantId;

/// Callback contract for dominant speaker changes.
///
/// Called synchronously from the scheduler thread with no engine lock held,
/// so implementations may call back into the detector. They must return
/// quickly: the next decision cycle waits for them.
pub trait DominantSpeakerListener: Send + Sync + 'static {
    fn on_dominant_speaker_changed(&self, previous: Option<ParticipantId>, current: ParticipantId);
}

impl<F> DominantSpeakerListener for F
where
    F: Fn(Option<ParticipantId>, ParticipantId) + Send + Sync + 'static,
{
    fn on_dominant_speaker_changed(&self, previous: Option<ParticipantId>, current: ParticipantId) {
        self(previous, current)
    }
}

/// Broadcast on every dominant speaker change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DominantSpeakerEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Dominant speaker before this decision, if any.
    pub previous: Option<ParticipantId>,
    /// Newly dominant speaker.
    pub current: ParticipantId,
    /// Detector clock time of the decision cycle.
    pub decided_at_ms: i64,
}

/// State of the background decision scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerStatus {
    /// No worker; the next reported level starts one.
    Stopped,
    /// A worker is making decisions.
    Running,
    /// The detector was disposed and will not run again.
    Disposed,
}
