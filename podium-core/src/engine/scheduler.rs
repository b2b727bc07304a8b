//! Background decision scheduler.
//!
//! ## Cycle
//!
//! ```text
//! 1. Retire if disposed, superseded, or idle for decision_maker_idle_timeout
//! 2. Idle sweep when level_idle_timeout has elapsed since the last one
//! 3. Global decision when decision_interval has elapsed since the last one
//! 4. Wait min(time to next sweep, time to next decision) on the wake channel
//! ```
//!
//! At most one worker runs per detector. The slot records the generation of
//! the live worker; a worker that finds another generation (or none) in the
//! slot exits. Retiring for idleness clears the slot while the registry
//! timestamps are locked, so a concurrent level report either keeps the worker
//! alive or observes the cleared slot and launches a fresh one.
//!
//! A worker that panics releases the slot from its exit guard and is
//! relaunched lazily by the next level report.

use std::sync::{
    atomic::{AtomicI64, AtomicUsize, Ordering},
    Arc,
};
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::engine::Shared;
use crate::error::{PodiumError, Result};

/// Sentinel for "no cycle has run yet".
const NO_HEARTBEAT: i64 = i64::MIN;

/// Live worker bookkeeping, guarded by `Shared::scheduler`.
#[derive(Default)]
pub(crate) struct SchedulerSlot {
    worker: Option<WorkerHandle>,
    next_generation: u64,
}

impl SchedulerSlot {
    fn owned_by(&self, generation: u64) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|w| w.generation == generation)
    }

    /// Detach the live worker. Dropping the wake sender interrupts its wait.
    pub(crate) fn take_thread(&mut self) -> Option<JoinHandle<()>> {
        self.worker.take().map(|w| {
            drop(w.wake_tx);
            w.thread
        })
    }
}

struct WorkerHandle {
    generation: u64,
    /// Never sent on; dropping it disconnects the worker's wait.
    wake_tx: Sender<()>,
    thread: JoinHandle<()>,
}

/// Scheduler and ingestion counters.
pub struct DetectorDiagnostics {
    pub samples_accepted: AtomicUsize,
    pub samples_dropped: AtomicUsize,
    pub speakers_registered: AtomicUsize,
    pub decisions: AtomicUsize,
    pub speaker_switches: AtomicUsize,
    pub idle_sweeps: AtomicUsize,
    pub levels_timed_out: AtomicUsize,
    pub speakers_expired: AtomicUsize,
    pub scheduler_launches: AtomicUsize,
    pub scheduler_faults: AtomicUsize,
    pub spawn_failures: AtomicUsize,
    /// Clock time of the latest completed cycle (or launch).
    pub last_cycle_ms: AtomicI64,
}

impl Default for DetectorDiagnostics {
    fn default() -> Self {
        Self {
            samples_accepted: AtomicUsize::new(0),
            samples_dropped: AtomicUsize::new(0),
            speakers_registered: AtomicUsize::new(0),
            decisions: AtomicUsize::new(0),
            speaker_switches: AtomicUsize::new(0),
            idle_sweeps: AtomicUsize::new(0),
            levels_timed_out: AtomicUsize::new(0),
            speakers_expired: AtomicUsize::new(0),
            scheduler_launches: AtomicUsize::new(0),
            scheduler_faults: AtomicUsize::new(0),
            spawn_failures: AtomicUsize::new(0),
            last_cycle_ms: AtomicI64::new(NO_HEARTBEAT),
        }
    }
}

impl DetectorDiagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let last_cycle_ms = self.last_cycle_ms.load(Ordering::Relaxed);
        DiagnosticsSnapshot {
            samples_accepted: self.samples_accepted.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
            speakers_registered: self.speakers_registered.load(Ordering::Relaxed),
            decisions: self.decisions.load(Ordering::Relaxed),
            speaker_switches: self.speaker_switches.load(Ordering::Relaxed),
            idle_sweeps: self.idle_sweeps.load(Ordering::Relaxed),
            levels_timed_out: self.levels_timed_out.load(Ordering::Relaxed),
            speakers_expired: self.speakers_expired.load(Ordering::Relaxed),
            scheduler_launches: self.scheduler_launches.load(Ordering::Relaxed),
            scheduler_faults: self.scheduler_faults.load(Ordering::Relaxed),
            spawn_failures: self.spawn_failures.load(Ordering::Relaxed),
            last_cycle_ms: (last_cycle_ms != NO_HEARTBEAT).then_some(last_cycle_ms),
        }
    }

    fn heartbeat(&self, now: i64) {
        self.last_cycle_ms.store(now, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub samples_accepted: usize,
    pub samples_dropped: usize,
    pub speakers_registered: usize,
    pub decisions: usize,
    pub speaker_switches: usize,
    pub idle_sweeps: usize,
    pub levels_timed_out: usize,
    pub speakers_expired: usize,
    pub scheduler_launches: usize,
    pub scheduler_faults: usize,
    pub spawn_failures: usize,
    pub last_cycle_ms: Option<i64>,
}

/// Launch a worker unless one is already running.
///
/// Returns `Ok(true)` when a new worker was started.
pub(crate) fn ensure_running(shared: &Arc<Shared>) -> Result<bool> {
    let mut slot = shared.scheduler.lock();
    if shared.is_disposed() {
        return Err(PodiumError::Disposed);
    }
    if slot.worker.is_some() {
        return Ok(false);
    }

    let generation = slot.next_generation;
    slot.next_generation += 1;

    let (wake_tx, wake_rx) = crossbeam_channel::bounded::<()>(0);
    let worker_shared = Arc::clone(shared);
    let thread = thread::Builder::new()
        .name(format!("podium-dsi-{generation}"))
        .spawn(move || run_worker(worker_shared, generation, wake_rx))
        .map_err(|e| spawn_failed(shared, e))?;

    slot.worker = Some(WorkerHandle {
        generation,
        wake_tx,
        thread,
    });
    shared.scheduler_running.store(true, Ordering::SeqCst);
    shared
        .diagnostics
        .scheduler_launches
        .fetch_add(1, Ordering::Relaxed);
    shared.diagnostics.heartbeat(shared.clock.now_millis());
    info!(generation, "decision scheduler started");
    Ok(true)
}

fn spawn_failed(shared: &Shared, e: io::Error) -> PodiumError {
    shared
        .diagnostics
        .spawn_failures
        .fetch_add(1, Ordering::Relaxed);
    PodiumError::SchedulerSpawn(e)
}

/// One scheduler iteration at clock time `now`. Returns how long to wait
/// before the next one.
pub(crate) fn run_cycle(shared: &Shared, now: i64) -> Duration {
    let config = &shared.config;
    let level_idle_timeout = config.level_idle_timeout();
    let decision_interval = config.decision_interval();
    let times = shared.registry.timestamps();

    let mut sleep = 0;
    match times.last_idle_sweep {
        // The first cycle only arms the sweep timer.
        None => shared.registry.record_idle_sweep(now),
        Some(last) => {
            let remaining = level_idle_timeout.saturating_sub(now.saturating_sub(last));
            if remaining <= 0 {
                sweep_idle(shared, now);
                shared.registry.record_idle_sweep(now);
            } else {
                sleep = remaining;
            }
        }
    }

    let mut decision_remaining = times.last_decision.map_or(0, |last| {
        decision_interval.saturating_sub(now.saturating_sub(last))
    });
    if decision_remaining <= 0 {
        shared.registry.record_decision(now);
        make_decision(shared, now);
        // Deciding may take a while; schedule from the cycle start.
        decision_remaining =
            decision_interval.saturating_sub(shared.clock.now_millis().saturating_sub(now));
    }
    if decision_remaining > 0 && sleep > decision_remaining {
        sleep = decision_remaining;
    }

    Duration::from_millis(u64::try_from(sleep).unwrap_or(0))
}

fn sweep_idle(shared: &Shared, now: i64) {
    let outcome = shared.registry.sweep_idle(
        now,
        shared.config.level_idle_timeout(),
        shared.config.speaker_idle_timeout(),
    );
    let diagnostics = &shared.diagnostics;
    diagnostics.idle_sweeps.fetch_add(1, Ordering::Relaxed);
    diagnostics
        .levels_timed_out
        .fetch_add(outcome.timed_out, Ordering::Relaxed);
    diagnostics
        .speakers_expired
        .fetch_add(outcome.expired, Ordering::Relaxed);
    if outcome.expired > 0 {
        info!(expired = outcome.expired, "removed idle speakers");
    }
}

fn make_decision(shared: &Shared, now: i64) {
    shared.diagnostics.decisions.fetch_add(1, Ordering::Relaxed);
    if let Some(change) = shared.registry.decide() {
        shared
            .diagnostics
            .speaker_switches
            .fetch_add(1, Ordering::Relaxed);
        shared.notify(change, now);
    }
}

/// Whether the worker of `generation` must stop. Clears the slot when it
/// stops for idleness.
fn should_retire(shared: &Shared, generation: u64) -> bool {
    let mut slot = shared.scheduler.lock();
    if !slot.owned_by(generation) || shared.is_disposed() {
        return true;
    }

    let times = shared.registry.lock_timestamps();
    let Some(last_decision) = times.last_decision else {
        return false;
    };
    let idle = last_decision.saturating_sub(times.last_activity.unwrap_or(i64::MIN));
    if idle < shared.config.decision_maker_idle_timeout() {
        return false;
    }

    slot.worker = None;
    shared.scheduler_running.store(false, Ordering::SeqCst);
    drop(times);
    info!(generation, idle_ms = idle, "decision scheduler idle, stopping");
    true
}

fn run_worker(shared: Arc<Shared>, generation: u64, wake_rx: Receiver<()>) {
    let _guard = ExitGuard {
        shared: &shared,
        generation,
    };

    loop {
        if should_retire(&shared, generation) {
            break;
        }

        let now = shared.clock.now_millis();
        let sleep = run_cycle(&shared, now);
        shared.diagnostics.heartbeat(now);

        if sleep.is_zero() {
            continue;
        }
        match wake_rx.recv_timeout(sleep) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!(generation, "decision scheduler detached");
                break;
            }
        }
    }
}

/// Releases the slot however the worker exits, including by panic.
struct ExitGuard<'a> {
    shared: &'a Shared,
    generation: u64,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        let panicking = thread::panicking();
        // Before the slot release, so `Stopped` implies the fault is counted.
        if panicking {
            self.shared
                .diagnostics
                .scheduler_faults
                .fetch_add(1, Ordering::Relaxed);
        }

        let mut slot = self.shared.scheduler.lock();
        if slot.owned_by(self.generation) {
            slot.worker = None;
            self.shared.scheduler_running.store(false, Ordering::SeqCst);
        }
        drop(slot);

        if panicking {
            error!(
                generation = self.generation,
                "decision scheduler panicked, relaunching on next level report"
            );
        } else {
            debug!(generation = self.generation, "decision scheduler exited");
        }
    }
}
