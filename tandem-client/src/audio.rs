//! Simulated audio engine
//!
//! Headless stand-in for a real output device. Position advances with the
//! injected clock, optionally running fast or slow so drift correction has
//! something to correct.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tandem_common::Clock;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::sync::AudioEngine;

#[derive(Debug, Default)]
struct Playhead {
    track_id: Option<Uuid>,
    playing: bool,
    /// Position at `anchor_secs`
    anchor_position: f64,
    anchor_secs: f64,
}

/// Clock-driven audio engine with drift and fault injection
pub struct SimulatedAudioEngine {
    clock: Arc<dyn Clock>,
    playhead: Mutex<Playhead>,
    /// Playback speed error, e.g. 0.01 runs 1% fast
    drift_rate: f64,
    fail_seeks: AtomicBool,
    seeks: AtomicU64,
}

impl SimulatedAudioEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_drift(clock, 0.0)
    }

    pub fn with_drift(clock: Arc<dyn Clock>, drift_rate: f64) -> Self {
        Self {
            clock,
            playhead: Mutex::new(Playhead::default()),
            drift_rate,
            fail_seeks: AtomicBool::new(false),
            seeks: AtomicU64::new(0),
        }
    }

    /// Make subsequent seeks fail (device busy)
    pub fn set_fail_seeks(&self, fail: bool) {
        self.fail_seeks.store(fail, Ordering::Relaxed);
    }

    /// Successful seeks so far
    pub fn seek_count(&self) -> u64 {
        self.seeks.load(Ordering::Relaxed)
    }

    pub fn track_id(&self) -> Option<Uuid> {
        self.playhead().track_id
    }

    fn current_position(&self, playhead: &Playhead) -> f64 {
        if !playhead.playing {
            return playhead.anchor_position;
        }
        let elapsed = (self.clock.now_secs() - playhead.anchor_secs).max(0.0);
        (playhead.anchor_position + elapsed * (1.0 + self.drift_rate)).max(0.0)
    }

    /// Re-anchor at the current position so later rate changes start here
    fn reanchor(&self, playhead: &mut Playhead) {
        playhead.anchor_position = self.current_position(playhead);
        playhead.anchor_secs = self.clock.now_secs();
    }

    fn playhead(&self) -> MutexGuard<'_, Playhead> {
        self.playhead.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl AudioEngine for SimulatedAudioEngine {
    async fn position(&self) -> Result<f64> {
        let playhead = self.playhead();
        Ok(self.current_position(&playhead))
    }

    async fn seek(&self, position: f64) -> Result<()> {
        if self.fail_seeks.load(Ordering::Relaxed) {
            return Err(Error::SyncDrift("audio device rejected seek".to_string()));
        }
        let mut playhead = self.playhead();
        if playhead.track_id.is_none() {
            return Err(Error::SyncDrift("no track loaded".to_string()));
        }
        playhead.anchor_position = position.max(0.0);
        playhead.anchor_secs = self.clock.now_secs();
        self.seeks.fetch_add(1, Ordering::Relaxed);
        debug!("Audio seek to {:.3}s", position);
        Ok(())
    }

    async fn is_paused(&self) -> bool {
        !self.playhead().playing
    }

    async fn play(&self) -> Result<()> {
        let mut playhead = self.playhead();
        if playhead.track_id.is_none() {
            return Err(Error::SyncDrift("no track loaded".to_string()));
        }
        if !playhead.playing {
            self.reanchor(&mut playhead);
            playhead.playing = true;
        }
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        let mut playhead = self.playhead();
        if playhead.playing {
            self.reanchor(&mut playhead);
            playhead.playing = false;
        }
        Ok(())
    }

    async fn load(&self, track_id: Option<Uuid>) -> Result<()> {
        let mut playhead = self.playhead();
        *playhead = Playhead {
            track_id,
            playing: false,
            anchor_position: 0.0,
            anchor_secs: self.clock.now_secs(),
        };
        debug!("Audio loaded {:?}", track_id);
        Ok(())
    }
}
