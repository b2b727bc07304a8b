//! `DominantSpeakerDetector`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! DominantSpeakerDetector::new()        → status = Stopped
//!     └─► report_level()                → worker launched, status = Running
//!         └─► 15 s without reports      → worker retires, status = Stopped
//!             └─► report_level()        → worker relaunched, status = Running
//! dispose() / drop                      → worker detached, speakers dropped, status = Disposed
//! ```
//!
//! `dispose()` is idempotent. Reports after disposal are ignored.
//!
//! ## Threading
//!
//! Producers call `report_level` from any thread; it never waits on the
//! scheduler. The scheduler is a single named thread per detector, alive only
//! while levels keep arriving. Listener callbacks run on that thread with no
//! engine lock held.

pub mod registry;
pub mod scheduler;

use std::str::FromStr;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::{
    clock::{Clock, SystemClock},
    error::{PodiumError, Result},
    events::{DominantSpeakerEvent, DominantSpeakerListener, SchedulerStatus},
    speaker::noise_floor::DEFAULT_WINDOW_LENGTH,
    ParticipantId,
};

use registry::{DominantChange, Registry};
use scheduler::{DetectorDiagnostics, DiagnosticsSnapshot, SchedulerSlot};

/// A running scheduler that has not completed a cycle for this many of its
/// longest periods is reported as stalled.
const STALL_FACTOR: i64 = 10;

/// Configuration for `DominantSpeakerDetector`.
///
/// Only timing and capacity are tunable; the scoring model's constants are
/// fixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DetectorConfig {
    /// Period of the global decision. Default: 300 ms.
    pub decision_interval_ms: u64,
    /// Silence after which a speaker gets synthesized zero levels, and the
    /// period of the idle sweep. Default: 40 ms.
    pub level_idle_timeout_ms: u64,
    /// Silence after which a non-dominant speaker is forgotten.
    /// Default: 1 hour.
    pub speaker_idle_timeout_ms: u64,
    /// Time without reports after which the scheduler thread stops.
    /// Default: 15 s.
    pub decision_maker_idle_timeout_ms: u64,
    /// Levels per noise-floor window. Default: 750 (15 s at 20 ms per level).
    pub min_level_window_length: u32,
    /// Buffered `DominantSpeakerEvent`s per subscriber. Default: 64.
    pub event_capacity: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            decision_interval_ms: 300,
            level_idle_timeout_ms: 40,
            speaker_idle_timeout_ms: 60 * 60 * 1000,
            decision_maker_idle_timeout_ms: 15 * 1000,
            min_level_window_length: DEFAULT_WINDOW_LENGTH,
            event_capacity: 64,
        }
    }
}

impl DetectorConfig {
    /// Parse a JSON config object. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PODIUM_*` environment variable overrides. Unparseable values
    /// are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        override_from_env("PODIUM_DECISION_INTERVAL_MS", &mut self.decision_interval_ms);
        override_from_env("PODIUM_LEVEL_IDLE_TIMEOUT_MS", &mut self.level_idle_timeout_ms);
        override_from_env(
            "PODIUM_SPEAKER_IDLE_TIMEOUT_MS",
            &mut self.speaker_idle_timeout_ms,
        );
        override_from_env(
            "PODIUM_DECISION_MAKER_IDLE_TIMEOUT_MS",
            &mut self.decision_maker_idle_timeout_ms,
        );
        override_from_env(
            "PODIUM_MIN_LEVEL_WINDOW_LENGTH",
            &mut self.min_level_window_length,
        );
        override_from_env("PODIUM_EVENT_CAPACITY", &mut self.event_capacity);
        self
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&'static str, bool); 6] = [
            ("decisionIntervalMs", self.decision_interval_ms > 0),
            ("levelIdleTimeoutMs", self.level_idle_timeout_ms > 0),
            ("speakerIdleTimeoutMs", self.speaker_idle_timeout_ms > 0),
            (
                "decisionMakerIdleTimeoutMs",
                self.decision_maker_idle_timeout_ms > 0,
            ),
            ("minLevelWindowLength", self.min_level_window_length > 0),
            ("eventCapacity", self.event_capacity > 0),
        ];
        for (field, ok) in checks {
            if !ok {
                return Err(PodiumError::InvalidConfig {
                    field,
                    reason: "must be greater than zero",
                });
            }
        }
        Ok(())
    }

    pub(crate) fn decision_interval(&self) -> i64 {
        millis(self.decision_interval_ms)
    }

    pub(crate) fn level_idle_timeout(&self) -> i64 {
        millis(self.level_idle_timeout_ms)
    }

    pub(crate) fn speaker_idle_timeout(&self) -> i64 {
        millis(self.speaker_idle_timeout_ms)
    }

    pub(crate) fn decision_maker_idle_timeout(&self) -> i64 {
        millis(self.decision_maker_idle_timeout_ms)
    }
}

fn millis(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

fn override_from_env<T: FromStr>(name: &str, target: &mut T) {
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => warn!(variable = name, value = %raw, "ignoring unparseable config override"),
    }
}

/// State shared between the detector handle and its scheduler thread.
pub(crate) struct Shared {
    pub(crate) config: DetectorConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) registry: Registry,
    pub(crate) scheduler: Mutex<SchedulerSlot>,
    /// Fast-path mirror of "the slot holds a worker".
    pub(crate) scheduler_running: AtomicBool,
    disposed: AtomicBool,
    listener: RwLock<Option<Arc<dyn DominantSpeakerListener>>>,
    events_tx: broadcast::Sender<DominantSpeakerEvent>,
    seq: AtomicU64,
    pub(crate) diagnostics: DetectorDiagnostics,
}

impl Shared {
    pub(crate) fn new(config: DetectorConfig, clock: Arc<dyn Clock>) -> Self {
        let (events_tx, _) = broadcast::channel(config.event_capacity);
        Self {
            registry: Registry::new(config.min_level_window_length),
            config,
            clock,
            scheduler: Mutex::new(SchedulerSlot::default()),
            scheduler_running: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            listener: RwLock::new(None),
            events_tx,
            seq: AtomicU64::new(0),
            diagnostics: DetectorDiagnostics::default(),
        }
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Ingest one level. Returns whether it was accepted.
    pub(crate) fn record_level(&self, id: ParticipantId, level: i32, timestamp: i64) -> bool {
        if self.is_disposed() {
            return false;
        }
        let report = self
            .registry
            .report_level(id, level, timestamp, self.clock.now_millis());

        if report.created {
            self.diagnostics
                .speakers_registered
                .fetch_add(1, Ordering::Relaxed);
            debug!(speaker = id, "registered speaker");
        }
        if report.accepted {
            self.diagnostics
                .samples_accepted
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.diagnostics
                .samples_dropped
                .fetch_add(1, Ordering::Relaxed);
            trace!(speaker = id, timestamp, "dropped out-of-order level");
        }
        report.accepted
    }

    /// Deliver a committed change to the listener and subscribers.
    pub(crate) fn notify(&self, change: DominantChange, decided_at_ms: i64) {
        if self.is_disposed() {
            return;
        }
        info!(
            previous = ?change.previous,
            current = change.current,
            "dominant speaker changed"
        );

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        // No subscribers is not an error.
        let _ = self.events_tx.send(DominantSpeakerEvent {
            seq,
            previous: change.previous,
            current: change.current,
            decided_at_ms,
        });

        // Subscribers first: a panicking listener unwinds past this point.
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.on_dominant_speaker_changed(change.previous, change.current);
        }
    }

    /// Mark disposed, detach the worker and drop all speakers. Returns the
    /// worker thread on the first call.
    fn dispose(&self) -> Option<thread::JoinHandle<()>> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return None;
        }
        let worker = self.scheduler.lock().take_thread();
        self.scheduler_running.store(false, Ordering::SeqCst);
        self.registry.clear();
        *self.listener.write() = None;
        info!("dominant speaker detector disposed");
        worker
    }
}

/// The top-level detector handle.
///
/// `DominantSpeakerDetector` is `Send + Sync`; wrap it in an `Arc` to share it
/// between producer threads. Dropping it disposes it.
pub struct DominantSpeakerDetector {
    shared: Arc<Shared>,
}

impl DominantSpeakerDetector {
    /// Create a detector on the system clock. No thread is started until the
    /// first level arrives.
    pub fn new(config: DetectorConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Create a detector on a custom clock.
    pub fn with_clock(config: DetectorConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared::new(config, clock)),
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.shared.config
    }

    /// Current detector clock time. Stamp levels with this.
    pub fn now_millis(&self) -> i64 {
        self.shared.clock.now_millis()
    }

    /// Report the audio level of participant `id` measured at `timestamp_ms`.
    ///
    /// Levels are clamped to 0..=127, late samples are dropped and unknown
    /// ids are registered. Never fails and never waits on the scheduler.
    pub fn report_level(&self, id: ParticipantId, level: i32, timestamp_ms: i64) {
        if self.shared.is_disposed() {
            return;
        }
        self.shared.record_level(id, level, timestamp_ms);

        if self.shared.scheduler_running.load(Ordering::SeqCst) {
            return;
        }
        match scheduler::ensure_running(&self.shared) {
            Ok(_) | Err(PodiumError::Disposed) => {}
            Err(e) => warn!(error = %e, "decision scheduler unavailable, retrying on next level"),
        }
    }

    /// Report a level measured now.
    pub fn level_changed(&self, id: ParticipantId, level: i32) {
        self.report_level(id, level, self.now_millis());
    }

    pub fn current_dominant(&self) -> Option<ParticipantId> {
        self.shared.registry.dominant()
    }

    pub fn speaker_count(&self) -> usize {
        self.shared.registry.speaker_count()
    }

    /// Registered participants in ascending id order.
    pub fn speaker_ids(&self) -> Vec<ParticipantId> {
        self.shared.registry.speaker_ids()
    }

    /// Install the change listener, replacing any previous one.
    pub fn set_listener<L: DominantSpeakerListener>(&self, listener: L) {
        *self.shared.listener.write() = Some(Arc::new(listener));
    }

    pub fn clear_listener(&self) {
        *self.shared.listener.write() = None;
    }

    /// Subscribe to dominant speaker change events.
    pub fn subscribe(&self) -> broadcast::Receiver<DominantSpeakerEvent> {
        self.shared.events_tx.subscribe()
    }

    pub fn scheduler_status(&self) -> SchedulerStatus {
        if self.shared.is_disposed() {
            SchedulerStatus::Disposed
        } else if self.shared.scheduler_running.load(Ordering::SeqCst) {
            SchedulerStatus::Running
        } else {
            SchedulerStatus::Stopped
        }
    }

    /// Snapshot of ingestion and scheduler counters.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.shared.diagnostics.snapshot()
    }

    /// Whether the scheduler is running but has stopped completing cycles.
    pub fn scheduler_stalled(&self) -> bool {
        if self.scheduler_status() != SchedulerStatus::Running {
            return false;
        }
        let Some(last_cycle) = self.diagnostics_snapshot().last_cycle_ms else {
            return false;
        };
        let config = &self.shared.config;
        let period = config.decision_interval().max(config.level_idle_timeout());
        self.now_millis().saturating_sub(last_cycle) > period.saturating_mul(STALL_FACTOR)
    }

    /// Stop the scheduler and release all speaker state. Idempotent.
    ///
    /// Waits for the scheduler thread to exit unless called from it (e.g.
    /// from a listener callback).
    pub fn dispose(&self) {
        let Some(worker) = self.shared.dispose() else {
            return;
        };
        if worker.thread().id() == thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            warn!("decision scheduler panicked during dispose");
        }
    }
}

impl Drop for DominantSpeakerDetector {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for DominantSpeakerDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DominantSpeakerDetector")
            .field("config", &self.shared.config)
            .field("status", &self.scheduler_status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::clock::ManualClock;

    const FRAME_MS: i64 = 20;

    struct Harness {
        clock: Arc<ManualClock>,
        shared: Shared,
        changes: Arc<Mutex<Vec<(Option<ParticipantId>, ParticipantId)>>>,
    }

    impl Harness {
        fn new(config: DetectorConfig) -> Self {
            let clock = Arc::new(ManualClock::new(0));
            let shared = Shared::new(config, clock.clone());
            let changes = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&changes);
            *shared.listener.write() = Some(Arc::new(
                move |previous: Option<ParticipantId>, current: ParticipantId| {
                    sink.lock().push((previous, current))
                },
            ));
            Self {
                clock,
                shared,
                changes,
            }
        }

        /// Advance to `t`, feed one level per participant, run a cycle.
        fn frame(&self, t: i64, levels: &[(ParticipantId, i32)]) {
            self.clock.set(t);
            for &(id, level) in levels {
                self.shared.record_level(id, level, t);
            }
            scheduler::run_cycle(&self.shared, t);
        }

        fn changes(&self) -> Vec<(Option<ParticipantId>, ParticipantId)> {
            self.changes.lock().clone()
        }
    }

    #[test]
    fn loud_participant_becomes_dominant_exactly_once() {
        let h = Harness::new(DetectorConfig::default());
        for frame in 0..(5_000 / FRAME_MS) {
            let t = frame * FRAME_MS;
            h.frame(t, &[(1, 100), (2, 5)]);
            if t >= 300 {
                assert_eq!(h.shared.registry.dominant(), Some(1), "t={t}");
            }
        }
        assert_eq!(h.changes(), vec![(None, 1)]);
        assert_eq!(h.shared.diagnostics.snapshot().speaker_switches, 1);
    }

    #[test]
    fn single_silent_speaker_dominates_after_one_cycle() {
        let h = Harness::new(DetectorConfig::default());
        h.frame(0, &[(7, 0)]);
        assert_eq!(h.shared.registry.dominant(), Some(7));
        assert_eq!(h.changes(), vec![(None, 7)]);
    }

    #[test]
    fn one_sample_burst_never_takes_over() {
        let h = Harness::new(DetectorConfig::default());
        // A talks continuously over a quiet floor.
        h.frame(0, &[(1, 5)]);
        assert_eq!(h.shared.registry.dominant(), Some(1));

        for frame in 1..200 {
            let t = frame * FRAME_MS;
            let b_level = if frame == 100 { 127 } else { 5 };
            h.frame(t, &[(1, 100), (2, b_level)]);
            assert_eq!(h.shared.registry.dominant(), Some(1), "t={t}");
        }
        assert_eq!(h.changes(), vec![(None, 1)]);
    }

    #[test]
    fn burst_against_silent_dominant_is_filtered() {
        let h = Harness::new(DetectorConfig::default());
        h.frame(0, &[(1, 5)]);
        for frame in 1..100 {
            let t = frame * FRAME_MS;
            let b_level = if frame == 50 { 127 } else { 5 };
            h.frame(t, &[(1, 5), (2, b_level)]);
        }
        assert_eq!(h.shared.registry.dominant(), Some(1));
        assert_eq!(h.changes(), vec![(None, 1)]);
    }

    #[test]
    fn sustained_speech_takes_over_from_fallen_silent_speaker() {
        let h = Harness::new(DetectorConfig::default());
        h.frame(0, &[(1, 5), (2, 5)]);
        for frame in 1..100 {
            h.frame(frame * FRAME_MS, &[(1, 100), (2, 5)]);
        }
        assert_eq!(h.shared.registry.dominant(), Some(1));

        for frame in 100..250 {
            h.frame(frame * FRAME_MS, &[(1, 5), (2, 100)]);
        }
        assert_eq!(h.shared.registry.dominant(), Some(2));
        assert_eq!(h.changes(), vec![(None, 1), (Some(1), 2)]);
    }

    #[test]
    fn idle_speaker_expires_but_dominant_stays() {
        let config = DetectorConfig {
            speaker_idle_timeout_ms: 1_000,
            ..DetectorConfig::default()
        };
        let h = Harness::new(config);
        h.frame(0, &[(1, 30)]);
        h.frame(FRAME_MS, &[(1, 30), (2, 30)]);
        assert_eq!(h.shared.registry.dominant(), Some(1));
        assert_eq!(h.shared.registry.speaker_count(), 2);

        // Both fall silent; only the non-dominant one may be removed.
        for frame in 2..200 {
            h.frame(frame * FRAME_MS, &[]);
        }
        assert_eq!(h.shared.registry.speaker_ids(), vec![1]);
        assert_eq!(h.shared.registry.dominant(), Some(1));
        let snapshot = h.shared.diagnostics.snapshot();
        assert_eq!(snapshot.speakers_expired, 1);
        assert!(snapshot.levels_timed_out > 0);
    }

    #[test]
    fn idle_sweep_pushes_silence_into_quiet_speakers() {
        let h = Harness::new(DetectorConfig::default());
        h.frame(0, &[(1, 90)]);
        h.frame(20, &[(1, 90)]);
        // Arm, then let the sweep fire past the 40 ms level timeout.
        h.frame(100, &[]);
        h.frame(200, &[]);

        let speaker = h.shared.registry.speaker(1).expect("speaker 1");
        let speaker = speaker.lock();
        assert_eq!(speaker.latest_level(), 0);
        assert_eq!(speaker.last_sample_time(), 20);
    }

    #[test]
    fn cycle_sleeps_until_next_due_task() {
        let h = Harness::new(DetectorConfig::default());
        h.shared.record_level(1, 10, 0);
        // First cycle arms the sweep and decides immediately.
        assert_eq!(scheduler::run_cycle(&h.shared, 0), Duration::ZERO);
        // Sweep due in 30 ms, decision in 290 ms.
        assert_eq!(
            scheduler::run_cycle(&h.shared, 10),
            Duration::from_millis(30)
        );
        assert_eq!(h.shared.registry.timestamps().last_decision, Some(0));
    }

    #[test]
    fn notifications_stop_after_dispose() {
        let h = Harness::new(DetectorConfig::default());
        let mut events = h.shared.events_tx.subscribe();
        h.shared.record_level(1, 10, 0);
        h.shared.dispose();

        assert!(!h.shared.record_level(1, 10, 20));
        scheduler::run_cycle(&h.shared, 20);
        assert!(h.changes().is_empty());
        assert!(events.try_recv().is_err());
        assert_eq!(h.shared.registry.dominant(), None);
        assert!(h.shared.dispose().is_none(), "second dispose is a no-op");
    }

    #[test]
    fn events_carry_sequence_and_decision_time() {
        let h = Harness::new(DetectorConfig::default());
        let mut events = h.shared.events_tx.subscribe();
        h.frame(40, &[(3, 10)]);

        let event = events.try_recv().expect("dominant speaker event");
        assert_eq!(
            event,
            DominantSpeakerEvent {
                seq: 0,
                previous: None,
                current: 3,
                decided_at_ms: 40,
            }
        );
    }

    #[test]
    fn panicking_listener_does_not_swallow_the_event() {
        let h = Harness::new(DetectorConfig::default());
        *h.shared.listener.write() = Some(Arc::new(
            |_previous: Option<ParticipantId>, _current: ParticipantId| {
                panic!("listener failure");
            },
        ));
        let mut events = h.shared.events_tx.subscribe();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            h.frame(0, &[(1, 10)]);
        }));
        assert!(outcome.is_err());

        let event = events.try_recv().expect("event sent before the listener ran");
        assert_eq!(event.current, 1);
        assert_eq!(h.shared.registry.dominant(), Some(1));
    }

    #[test]
    fn stopped_scheduler_is_never_stalled() {
        let clock = Arc::new(ManualClock::new(0));
        let detector = DominantSpeakerDetector::with_clock(DetectorConfig::default(), clock.clone())
            .expect("create detector");
        clock.set(1_000_000);
        assert_eq!(detector.scheduler_status(), SchedulerStatus::Stopped);
        assert!(!detector.scheduler_stalled());
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = DetectorConfig::default();
        assert_eq!(config.decision_interval_ms, 300);
        assert_eq!(config.level_idle_timeout_ms, 40);
        assert_eq!(config.speaker_idle_timeout_ms, 3_600_000);
        assert_eq!(config.decision_maker_idle_timeout_ms, 15_000);
        assert_eq!(config.min_level_window_length, 750);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_from_json_fills_defaults() {
        let config = DetectorConfig::from_json(r#"{"decisionIntervalMs": 150}"#)
            .expect("parse partial config");
        assert_eq!(config.decision_interval_ms, 150);
        assert_eq!(config.level_idle_timeout_ms, 40);
    }

    #[test]
    fn config_rejects_zero_values() {
        let err = DetectorConfig::from_json(r#"{"levelIdleTimeoutMs": 0}"#)
            .expect_err("zero level idle timeout");
        assert!(matches!(
            err,
            PodiumError::InvalidConfig {
                field: "levelIdleTimeoutMs",
                ..
            }
        ));
        assert!(matches!(
            DetectorConfig::from_json("{not json"),
            Err(PodiumError::ConfigParse(_))
        ));
    }

    #[test]
    fn env_overrides_replace_parseable_values() {
        std::env::set_var("PODIUM_EVENT_CAPACITY", "8");
        std::env::set_var("PODIUM_SPEAKER_IDLE_TIMEOUT_MS", "soon");
        let config = DetectorConfig::default().with_env_overrides();
        std::env::remove_var("PODIUM_EVENT_CAPACITY");
        std::env::remove_var("PODIUM_SPEAKER_IDLE_TIMEOUT_MS");

        assert_eq!(config.event_capacity, 8);
        assert_eq!(config.speaker_idle_timeout_ms, 3_600_000);
    }

    #[test]
    fn detector_rejects_invalid_config() {
        let config = DetectorConfig {
            event_capacity: 0,
            ..DetectorConfig::default()
        };
        assert!(DominantSpeakerDetector::new(config).is_err());
    }
}
