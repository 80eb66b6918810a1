//! Drift corrector
//!
//! Compares the expected room position with the local audio engine and
//! jumps the engine when the difference exceeds the adaptive tolerance.
//! Correction and measurement failures are counted, never propagated; the
//! count drives the visible sync status and the force-recovery offer.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tandem_common::api::PlaybackStateView;
use tandem_common::events::RoomEvent;
use tandem_common::Clock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::clock::{adaptive_tolerance, ClockEstimate, ClockSyncEstimator};
use super::history::{SyncEntry, SyncHistory};
use super::position::RoomSnapshot;
use crate::config::SyncSettings;
use crate::error::Result;

/// Local audio output being kept in sync
#[async_trait]
pub trait AudioEngine: Send + Sync {
    /// Current playback position (seconds)
    async fn position(&self) -> Result<f64>;

    /// Jump to `position` (seconds)
    async fn seek(&self, position: f64) -> Result<()>;

    async fn is_paused(&self) -> bool;

    async fn play(&self) -> Result<()>;

    async fn pause(&self) -> Result<()>;

    /// Load a track (None unloads and stops)
    async fn load(&self, track_id: Option<Uuid>) -> Result<()>;
}

/// User-visible sync status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Syncing,
    OutOfSync,
    Recovering,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Synced => write!(f, "synced"),
            SyncStatus::Syncing => write!(f, "syncing"),
            SyncStatus::OutOfSync => write!(f, "out_of_sync"),
            SyncStatus::Recovering => write!(f, "recovering"),
        }
    }
}

/// Per-connection sync state, reset on reconnect
#[derive(Debug, Clone)]
pub struct ClientSyncState {
    pub server_time_offset_ms: f64,
    pub network_latency_ms: f64,
    pub jitter_ms: f64,
    /// Seconds
    pub adaptive_tolerance: f64,
    pub sync_failure_count: u32,
    pub sync_history: SyncHistory,
    pub status: SyncStatus,
}

impl ClientSyncState {
    pub fn new(settings: &SyncSettings) -> Self {
        Self {
            server_time_offset_ms: 0.0,
            network_latency_ms: 0.0,
            jitter_ms: 0.0,
            adaptive_tolerance: adaptive_tolerance(settings, 0.0, 0.0),
            sync_failure_count: 0,
            sync_history: SyncHistory::new(settings.history_size),
            status: SyncStatus::Syncing,
        }
    }
}

/// Result of one `synchronize()` pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncOutcome {
    pub expected: f64,
    pub actual: f64,
    pub diff: f64,
    pub tolerance: f64,
    /// Whether a seek was issued and succeeded
    pub corrected: bool,
    /// Mean drift over the recent window, this pass included
    pub average_drift: Option<f64>,
}

/// Keeps the local audio engine on the room timeline
pub struct DriftCorrector {
    estimator: ClockSyncEstimator,
    audio: Arc<dyn AudioEngine>,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
    state: Mutex<ClientSyncState>,
    room: Mutex<RoomSnapshot>,
    /// Held for the duration of one synchronize() pass
    in_flight: tokio::sync::Mutex<()>,
}

impl DriftCorrector {
    pub fn new(
        estimator: ClockSyncEstimator,
        audio: Arc<dyn AudioEngine>,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> Self {
        let state = ClientSyncState::new(&settings);
        Self {
            estimator,
            audio,
            clock,
            settings,
            state: Mutex::new(state),
            room: Mutex::new(RoomSnapshot::default()),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn audio(&self) -> &Arc<dyn AudioEngine> {
        &self.audio
    }

    // ========================================================================
    // Room state
    // ========================================================================

    /// Replace the room snapshot (welcome frame)
    pub fn apply_view(&self, view: &PlaybackStateView) {
        *self.room() = RoomSnapshot::from_view(view);
    }

    /// Fold an event into the room snapshot; true if the timeline changed
    pub fn apply_event(&self, event: &RoomEvent) -> bool {
        self.room().apply(event)
    }

    pub fn room_snapshot(&self) -> RoomSnapshot {
        self.room().clone()
    }

    /// Expected room position right now (seconds)
    pub fn expected_position(&self) -> f64 {
        let offset = self.state().server_time_offset_ms;
        self.room().expected_position(self.clock.now_millis(), offset)
    }

    // ========================================================================
    // Clock measurement
    // ========================================================================

    /// Re-measure the clock offset and recompute the tolerance
    ///
    /// Falls back to offset 0 and counts a failure when every sample fails.
    pub async fn measure_clock(&self) -> Option<ClockEstimate> {
        let result = self.estimator.calculate_offset().await;
        let mut state = self.state();
        match result {
            Ok(estimate) => {
                state.server_time_offset_ms = estimate.offset_ms;
                state.network_latency_ms = estimate.latency_ms;
                state.jitter_ms = estimate.jitter_ms;
                state.adaptive_tolerance =
                    adaptive_tolerance(&self.settings, estimate.latency_ms, estimate.jitter_ms);
                info!(
                    "Clock offset {:.1}ms, latency {:.1}ms, jitter {:.1}ms, tolerance {:.3}s",
                    estimate.offset_ms, estimate.latency_ms, estimate.jitter_ms, state.adaptive_tolerance
                );
                Some(estimate)
            }
            Err(e) => {
                warn!("{}; falling back to offset 0", e);
                state.server_time_offset_ms = 0.0;
                self.record_failure(&mut state);
                None
            }
        }
    }

    // ========================================================================
    // Synchronization
    // ========================================================================

    /// Compare expected and actual positions, jumping the engine if needed
    ///
    /// Also brings the engine's play/pause state in line with the room.
    /// Every pass past the guards appends one history entry. Returns None
    /// when skipped (another pass is still in flight, or no track is loaded)
    /// or when the engine position could not be read.
    pub async fn synchronize(&self) -> Option<SyncOutcome> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("Synchronize skipped: previous pass still running");
            return None;
        };

        let now_ms = self.clock.now_millis();
        let (offset, tolerance) = {
            let state = self.state();
            (state.server_time_offset_ms, state.adaptive_tolerance)
        };
        let (expected, room_playing) = {
            let room = self.room();
            room.track_id?;
            (room.expected_position(now_ms, offset), room.is_playing)
        };

        let actual = match self.audio.position().await {
            Ok(actual) => actual,
            Err(e) => {
                warn!("Sync drift: cannot read audio position: {}", e);
                self.finish_pass(SyncEntry {
                    timestamp: now_ms,
                    expected,
                    actual: f64::NAN,
                    diff: f64::NAN,
                    tolerance,
                    failed: true,
                });
                return None;
            }
        };

        let diff = (expected - actual).abs();
        let mut corrected = false;
        let mut failed = false;

        if diff > tolerance {
            debug!(
                "Drift {:.3}s exceeds tolerance {:.3}s (expected {:.3}, actual {:.3})",
                diff, tolerance, expected, actual
            );
            match self.audio.seek(expected).await {
                Ok(()) => corrected = true,
                Err(e) => {
                    warn!("Sync drift: seek to {:.3}s failed: {}", expected, e);
                    failed = true;
                }
            }
        }

        let engine_paused = self.audio.is_paused().await;
        if room_playing && engine_paused {
            if let Err(e) = self.audio.play().await {
                warn!("Sync drift: resume failed: {}", e);
                failed = true;
            }
        } else if !room_playing && !engine_paused {
            debug!("Engine playing while room is paused; pausing");
            if let Err(e) = self.audio.pause().await {
                warn!("Sync drift: pause failed: {}", e);
                failed = true;
            }
        }

        let average_drift = self.finish_pass(SyncEntry {
            timestamp: now_ms,
            expected,
            actual,
            diff,
            tolerance,
            failed,
        });

        Some(SyncOutcome {
            expected,
            actual,
            diff,
            tolerance,
            corrected,
            average_drift,
        })
    }

    /// Record a pass and update status and tolerance; returns the recent average drift
    fn finish_pass(&self, entry: SyncEntry) -> Option<f64> {
        let mut state = self.state();
        state.sync_history.push(entry);

        if entry.failed {
            self.record_failure(&mut state);
        } else if state.status != SyncStatus::OutOfSync {
            state.status = if entry.out_of_tolerance() {
                SyncStatus::Syncing
            } else {
                SyncStatus::Synced
            };
        }

        if state
            .sync_history
            .sustained_poor_performance(self.settings.poor_window, self.settings.poor_threshold)
        {
            let bumped = (state.adaptive_tolerance + self.settings.poor_tolerance_bump)
                .min(self.settings.max_tolerance());
            if bumped > state.adaptive_tolerance {
                info!(
                    "Sustained poor sync, tolerance {:.3}s -> {:.3}s",
                    state.adaptive_tolerance, bumped
                );
                state.adaptive_tolerance = bumped;
            }
        }

        state.sync_history.average_drift(self.settings.poor_window)
    }

    /// Sync period for the current latency
    pub fn next_interval(&self) -> Duration {
        let latency = self.state().network_latency_ms;
        if latency >= self.settings.high_latency_threshold_ms {
            Duration::from_millis(self.settings.high_latency_interval_ms)
        } else {
            Duration::from_millis(self.settings.normal_interval_ms)
        }
    }

    // ========================================================================
    // Escalation and recovery
    // ========================================================================

    pub fn status(&self) -> SyncStatus {
        self.state().status
    }

    pub fn failure_count(&self) -> u32 {
        self.state().sync_failure_count
    }

    /// Whether the failure count warrants offering a force recovery
    pub fn can_force_recovery(&self) -> bool {
        self.state().sync_failure_count >= self.settings.force_recovery_threshold
    }

    /// Re-measure the clock and reset the failure count to the recovered baseline
    pub async fn force_recovery(&self) -> Option<ClockEstimate> {
        {
            let mut state = self.state();
            info!(
                "Force recovery requested ({} failure(s))",
                state.sync_failure_count
            );
            state.status = SyncStatus::Recovering;
        }
        let estimate = self.measure_clock().await;

        let mut state = self.state();
        state.sync_failure_count = self.settings.recovered_failure_count;
        state.status = SyncStatus::Syncing;
        estimate
    }

    /// Fresh state for a new connection
    pub fn reset(&self) {
        *self.state() = ClientSyncState::new(&self.settings);
        debug!("Sync state reset");
    }

    /// Copy of the current sync state
    pub fn snapshot(&self) -> ClientSyncState {
        self.state().clone()
    }

    fn record_failure(&self, state: &mut ClientSyncState) {
        state.sync_failure_count = state.sync_failure_count.saturating_add(1);
        if state.sync_failure_count >= self.settings.out_of_sync_threshold {
            if state.status != SyncStatus::OutOfSync {
                warn!(
                    "Out of sync after {} failure(s)",
                    state.sync_failure_count
                );
            }
            state.status = SyncStatus::OutOfSync;
        }
        if state.sync_failure_count == self.settings.force_recovery_threshold {
            warn!("Sync failing repeatedly; force recovery available");
        }
    }

    fn state(&self) -> MutexGuard<'_, ClientSyncState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn room(&self) -> MutexGuard<'_, RoomSnapshot> {
        self.room.lock().unwrap_or_else(|e| e.into_inner())
    }
}
