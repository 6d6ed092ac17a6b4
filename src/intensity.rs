//! Shared intensity state and the entry points game-event hooks call into.
//!
//! Many hooks may request a vibration during one tick. The rule is that the
//! strongest request of a tick wins: a weak event firing after a strong one in
//! the same tick must not lower the intensity. The vibration controller resets
//! the per-tick maximum at the start of every tick.
//!
//! Every field is stored as the bit pattern of an `f32` inside an `AtomicU32`.
//! In practice all writers run on the tick thread; the atomics only guarantee
//! that a reader on another thread never observes a torn value. Two hooks racing
//! on different threads can at worst both apply their request, and both are
//! clamped to [0, 1], so the race is benign.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::config::VibeConfig;

/// Clamps a requested speed into [0, 1]. NaN maps to 0.
pub fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[derive(Debug)]
struct AtomicF32(AtomicU32);

impl AtomicF32 {
    fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Stores `max(current, value)` and returns the new maximum.
    fn fetch_max(&self, value: f32) -> f32 {
        let previous = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some(f32::from_bits(bits).max(value).to_bits())
            })
            .unwrap_or_else(|bits| bits);
        f32::from_bits(previous).max(value)
    }

    fn add(&self, delta: f32) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f32::from_bits(bits) + delta).to_bits())
            });
    }
}

/// Speed and duration bookkeeping shared by the event hooks and the controller.
#[derive(Debug)]
pub struct SharedIntensityState {
    current_speed: AtomicF32,
    max_speed_this_tick: AtomicF32,
    vibe_duration: AtomicF32,
}

impl Default for SharedIntensityState {
    fn default() -> Self {
        Self {
            current_speed: AtomicF32::new(0.0),
            max_speed_this_tick: AtomicF32::new(0.0),
            vibe_duration: AtomicF32::new(0.0),
        }
    }
}

impl SharedIntensityState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always within [0, 1].
    pub fn current_speed(&self) -> f32 {
        self.current_speed.load()
    }

    pub fn max_speed_this_tick(&self) -> f32 {
        self.max_speed_this_tick.load()
    }

    /// Seconds since the last vibration request.
    pub fn vibe_duration(&self) -> f32 {
        self.vibe_duration.load()
    }

    /// Records a vibration request; returns the speed now in effect.
    pub fn request(&self, speed: f32) -> f32 {
        let speed = clamp_unit(speed);
        self.vibe_duration.store(0.0);
        let winner = self.max_speed_this_tick.fetch_max(speed);
        self.current_speed.store(winner);
        winner
    }

    pub(crate) fn begin_tick(&self) {
        self.max_speed_this_tick.store(0.0);
    }

    pub(crate) fn accumulate_duration(&self, elapsed: f32) {
        self.vibe_duration.add(elapsed);
    }

    pub(crate) fn force_speed(&self, speed: f32) {
        self.current_speed.store(clamp_unit(speed));
    }
}

/// Cloneable handle handed to every event source.
///
/// Reads `tap_speed` from the live configuration, so a changed tap speed
/// applies to the next call without re-issuing handles.
#[derive(Clone, Debug)]
pub struct IntensityHandle {
    state: Arc<SharedIntensityState>,
    config: watch::Receiver<VibeConfig>,
}

impl IntensityHandle {
    pub fn new(state: Arc<SharedIntensityState>, config: watch::Receiver<VibeConfig>) -> Self {
        Self { state, config }
    }

    pub fn vibrate(&self, speed: f32) {
        let effective = self.state.request(speed);
        debug!("Vibrate request {:.3} -> effective {:.3}", speed, effective);
    }

    pub fn tap(&self) {
        self.vibrate(self.tap_speed());
    }

    /// Vibrates at `value / relative_to`, never below the tap speed.
    pub fn vibrate_relative(&self, value: f32, relative_to: f32) {
        self.vibrate_relative_with_min(value, relative_to, self.tap_speed());
    }

    /// Vibrates at `max(min_speed, value / relative_to)`.
    ///
    /// A zero `relative_to` follows IEEE division: a positive `value` saturates
    /// to full intensity, a negative one or `0 / 0` falls back to `min_speed`.
    pub fn vibrate_relative_with_min(&self, value: f32, relative_to: f32, min_speed: f32) {
        // f32::max ignores a NaN operand, so 0/0 resolves to min_speed here.
        let ratio = value / relative_to;
        self.vibrate(min_speed.max(ratio));
    }

    pub fn state(&self) -> &SharedIntensityState {
        &self.state
    }

    fn tap_speed(&self) -> f32 {
        self.config.borrow().tap_speed
    }
}
