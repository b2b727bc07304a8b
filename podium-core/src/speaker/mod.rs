//! Per-participant state: level history, noise floor, aggregates and scores.
//!
//! ## Aggregation
//!
//! ```text
//! levels (50, newest first)
//!   │ gate below floor + bucket width, bucket by width 10
//!   ▼
//! immediates (50, each in 0..13)
//!   │ per group of 5: count immediates > 7
//!   ▼
//! mediums (10, each in 0..=5)
//!   │ per group of 10: count mediums > 4
//!   ▼
//! longs (1, in 0..=10)
//! ```
//!
//! Aggregates are rebuilt lazily from `evaluate_scores`, and only stages whose
//! input actually changed are recomputed and rescored.

pub mod noise_floor;

pub use noise_floor::NoiseFloor;

use crate::buffering::LevelHistory;
use crate::scoring::{
    scale_score, Scale, SpeechActivityScores, HISTORY_LEN, LONG_COUNT, LONG_THRESHOLD, MAX_LEVEL,
    MEDIUM_COUNT, MEDIUM_THRESHOLD, N1_SUBUNIT_WIDTH,
};
use crate::ParticipantId;

/// Clamp a raw level report into the quantized range.
pub fn clamp_level(level: i32) -> u8 {
    level.clamp(0, i32::from(MAX_LEVEL)) as u8
}

#[derive(Debug)]
pub struct SpeakerState {
    id: ParticipantId,
    levels: LevelHistory,
    noise_floor: NoiseFloor,
    /// Set by every push, cleared by `evaluate_scores`.
    levels_changed: bool,
    immediates: [u8; HISTORY_LEN],
    mediums: [u8; MEDIUM_COUNT],
    longs: [u8; LONG_COUNT],
    scores: SpeechActivityScores,
    last_sample_time: i64,
}

impl SpeakerState {
    /// Create the state for a participant first heard at `created_at`.
    pub fn new(id: ParticipantId, created_at: i64, min_level_window_length: u32) -> Self {
        Self {
            id,
            levels: LevelHistory::new(HISTORY_LEN),
            noise_floor: NoiseFloor::new(min_level_window_length),
            levels_changed: false,
            immediates: [0; HISTORY_LEN],
            mediums: [0; MEDIUM_COUNT],
            longs: [0; LONG_COUNT],
            scores: SpeechActivityScores::default(),
            last_sample_time: created_at,
        }
    }

    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn last_sample_time(&self) -> i64 {
        self.last_sample_time
    }

    pub fn min_level(&self) -> u8 {
        self.noise_floor.level()
    }

    pub fn latest_level(&self) -> u8 {
        self.levels.latest()
    }

    /// Level history, newest first.
    pub fn levels(&self) -> Vec<u8> {
        self.levels.to_vec()
    }

    /// Scores as of the last `evaluate_scores`.
    pub fn scores(&self) -> SpeechActivityScores {
        self.scores
    }

    pub fn immediates(&self) -> &[u8] {
        &self.immediates
    }

    pub fn mediums(&self) -> &[u8] {
        &self.mediums
    }

    pub fn longs(&self) -> &[u8] {
        &self.longs
    }

    /// Accept a level measured at `time`.
    ///
    /// Returns `false` (and changes nothing) when `time` precedes the last
    /// accepted sample.
    pub fn level_changed(&mut self, level: i32, time: i64) -> bool {
        if time < self.last_sample_time {
            return false;
        }
        self.last_sample_time = time;
        let level = clamp_level(level);
        self.levels.push(level);
        self.levels_changed = true;
        self.noise_floor.observe(level);
        true
    }

    /// Push silence without advancing `last_sample_time`, so the participant
    /// keeps ageing towards expiry.
    pub fn level_timed_out(&mut self) {
        let at = self.last_sample_time;
        self.level_changed(0, at);
    }

    /// Bring aggregates and cached scores up to date with the level history.
    pub fn evaluate_scores(&mut self) -> SpeechActivityScores {
        if !std::mem::take(&mut self.levels_changed) {
            return self.scores;
        }

        if self.compute_immediates() {
            self.rescore(Scale::Immediate, self.immediates[0]);
            if compute_bigs(&self.immediates, &mut self.mediums, MEDIUM_THRESHOLD) {
                self.rescore(Scale::Medium, self.mediums[0]);
                if compute_bigs(&self.mediums, &mut self.longs, LONG_THRESHOLD) {
                    self.rescore(Scale::Long, self.longs[0]);
                }
            }
        }
        self.scores
    }

    fn rescore(&mut self, scale: Scale, v: u8) {
        self.scores.set(scale, scale_score(scale, v));
    }

    /// Gate levels at the noise floor and bucket them. Returns whether any
    /// immediate changed.
    fn compute_immediates(&mut self) -> bool {
        let gate = i32::from(self.noise_floor.level()) + i32::from(N1_SUBUNIT_WIDTH);
        let mut changed = false;
        for (slot, level) in self.immediates.iter_mut().zip(self.levels.newest_first()) {
            let gated = if i32::from(level) < gate { 0 } else { level };
            let immediate = gated / N1_SUBUNIT_WIDTH;
            if *slot != immediate {
                *slot = immediate;
                changed = true;
            }
        }
        changed
    }
}

/// Each big counts the littles of its group above `threshold`. Returns
/// whether any big changed.
fn compute_bigs(littles: &[u8], bigs: &mut [u8], threshold: u8) -> bool {
    let per_big = littles.len() / bigs.len();
    let mut changed = false;
    for (big, group) in bigs.iter_mut().zip(littles.chunks(per_big)) {
        let count = group.iter().filter(|&&little| little > threshold).count() as u8;
        if *big != count {
            *big = count;
            changed = true;
        }
    }
    changed
}
