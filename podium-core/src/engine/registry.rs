//! Conference-wide speaker registry and the global decision.
//!
//! ## Locking
//!
//! The registry mutex guards the speaker map, the dominant id and the
//! scheduler timestamps. It is held only for map/pointer updates and for
//! cloning speaker handles; score evaluation and level pushes happen under
//! each speaker's own mutex. Lock order is registry → speaker.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::debug;

use crate::scoring::{RelativeActivity, SpeechActivityScores, C2};
use crate::speaker::SpeakerState;
use crate::ParticipantId;

pub type SpeakerHandle = Arc<Mutex<SpeakerState>>;

/// A change of the dominant speaker produced by [`Registry::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DominantChange {
    pub previous: Option<ParticipantId>,
    pub current: ParticipantId,
}

/// Outcome of ingesting one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelReport {
    /// The sample passed the monotonic timestamp check.
    pub accepted: bool,
    /// The sample registered a new speaker.
    pub created: bool,
}

/// Outcome of one idle sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Speakers that received a synthesized silent level.
    pub timed_out: usize,
    /// Speakers removed after the speaker idle timeout.
    pub expired: usize,
}

/// Scheduler bookkeeping, in detector clock milliseconds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Timestamps {
    /// Latest level report of any speaker.
    pub last_activity: Option<i64>,
    /// Start of the latest decision cycle.
    pub last_decision: Option<i64>,
    /// Latest idle sweep (or the cycle that armed the sweep timer).
    pub last_idle_sweep: Option<i64>,
}

#[derive(Default)]
struct RegistryInner {
    speakers: BTreeMap<ParticipantId, SpeakerHandle>,
    dominant: Option<ParticipantId>,
    timestamps: Timestamps,
}

pub struct Registry {
    inner: Mutex<RegistryInner>,
    min_level_window_length: u32,
}

impl Registry {
    pub fn new(min_level_window_length: u32) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            min_level_window_length,
        }
    }

    /// Record `level` for `id` measured at `timestamp`, registering unseen ids.
    ///
    /// `now` is the detector clock time and marks the registry as active.
    pub fn report_level(
        &self,
        id: ParticipantId,
        level: i32,
        timestamp: i64,
        now: i64,
    ) -> LevelReport {
        let mut created = false;
        let handle = {
            let mut inner = self.inner.lock();
            let last = inner.timestamps.last_activity.unwrap_or(i64::MIN);
            inner.timestamps.last_activity = Some(last.max(now));

            let window = self.min_level_window_length;
            let handle = inner.speakers.entry(id).or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(SpeakerState::new(id, timestamp, window)))
            });
            Arc::clone(handle)
        };

        let accepted = handle.lock().level_changed(level, timestamp);
        LevelReport { accepted, created }
    }

    pub fn dominant(&self) -> Option<ParticipantId> {
        self.inner.lock().dominant
    }

    pub fn speaker_count(&self) -> usize {
        self.inner.lock().speakers.len()
    }

    /// Registered ids in ascending order.
    pub fn speaker_ids(&self) -> Vec<ParticipantId> {
        self.inner.lock().speakers.keys().copied().collect()
    }

    pub fn speaker(&self, id: ParticipantId) -> Option<SpeakerHandle> {
        self.inner.lock().speakers.get(&id).map(Arc::clone)
    }

    pub fn timestamps(&self) -> Timestamps {
        self.inner.lock().timestamps
    }

    /// Lock the scheduler timestamps. Used by the scheduler to make its idle
    /// check atomic with respect to level reports.
    pub(crate) fn lock_timestamps(&self) -> MappedMutexGuard<'_, Timestamps> {
        MutexGuard::map(self.inner.lock(), |inner| &mut inner.timestamps)
    }

    pub fn record_decision(&self, now: i64) {
        self.inner.lock().timestamps.last_decision = Some(now);
    }

    pub fn record_idle_sweep(&self, now: i64) {
        self.inner.lock().timestamps.last_idle_sweep = Some(now);
    }

    /// Run the global decision and commit its winner.
    ///
    /// Returns the change when the dominant speaker differs from before.
    pub fn decide(&self) -> Option<DominantChange> {
        let (current, handles) = {
            let inner = self.inner.lock();
            let handles: Vec<(ParticipantId, SpeakerHandle)> = inner
                .speakers
                .iter()
                .map(|(id, handle)| (*id, Arc::clone(handle)))
                .collect();
            (inner.dominant, handles)
        };

        let scored: Vec<(ParticipantId, SpeechActivityScores)> = handles
            .iter()
            .map(|(id, handle)| (*id, handle.lock().evaluate_scores()))
            .collect();

        let winner = select_dominant(current, &scored)?;

        let mut inner = self.inner.lock();
        // The map may have been cleared by disposal while scores were evaluated.
        if inner.dominant == Some(winner) || !inner.speakers.contains_key(&winner) {
            return None;
        }
        let previous = inner.dominant.replace(winner);
        Some(DominantChange {
            previous,
            current: winner,
        })
    }

    /// Age out idle speakers.
    ///
    /// Non-dominant speakers idle longer than `speaker_idle_timeout` are
    /// removed; others idle longer than `level_idle_timeout` get a silent
    /// level pushed.
    pub fn sweep_idle(
        &self,
        now: i64,
        level_idle_timeout: i64,
        speaker_idle_timeout: i64,
    ) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let mut stale = Vec::new();
        {
            let mut inner = self.inner.lock();
            let dominant = inner.dominant;
            inner.speakers.retain(|id, handle| {
                let idle = now.saturating_sub(handle.lock().last_sample_time());
                if idle > speaker_idle_timeout && dominant != Some(*id) {
                    debug!(speaker = id, idle_ms = idle, "expiring idle speaker");
                    outcome.expired += 1;
                    return false;
                }
                if idle > level_idle_timeout {
                    stale.push(Arc::clone(handle));
                }
                true
            });
        }

        for handle in stale {
            let mut speaker = handle.lock();
            // A producer may have refreshed the speaker since the map scan.
            if now.saturating_sub(speaker.last_sample_time()) > level_idle_timeout {
                speaker.level_timed_out();
                outcome.timed_out += 1;
            }
        }
        outcome
    }

    /// Drop every speaker and forget the dominant one.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.speakers.clear();
        inner.dominant = None;
    }
}

/// Pick the dominant speaker from freshly evaluated scores.
///
/// `scored` must be in ascending id order. Without a current dominant among
/// them, the first speaker is nominated and the rest compete against it. A
/// challenger must beat the dominant at all three scales; among challengers
/// the largest relative medium activity wins, ties going to the lower id.
pub fn select_dominant(
    current: Option<ParticipantId>,
    scored: &[(ParticipantId, SpeechActivityScores)],
) -> Option<ParticipantId> {
    let (first, _) = scored.first()?;
    if scored.len() == 1 {
        return Some(*first);
    }

    let (dominant_id, dominant_scores) = current
        .and_then(|id| scored.iter().find(|(candidate, _)| *candidate == id))
        .unwrap_or(&scored[0]);

    let mut winner = *dominant_id;
    let mut best_medium = C2;
    for (id, scores) in scored {
        if id == dominant_id {
            continue;
        }
        let relative = RelativeActivity::between(scores, dominant_scores);
        if relative.exceeds_thresholds() && relative.medium > best_medium {
            best_medium = relative.medium;
            winner = *id;
        }
    }
    Some(winner)
}
