use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::{InputMode, VibeConfig};
use crate::intensity::{clamp_unit, IntensityHandle, SharedIntensityState};

/// Minimum tick time between two dispatches. The device transport cannot keep
/// up with faster command streams.
pub const DISPATCH_INTERVAL_SECS: f32 = 0.10;

const STATS_LOG_INTERVAL_SECS: f32 = 10.0;

/// Receiver of dispatched intensities.
///
/// Implementations must return immediately; the controller calls this from the
/// tick thread.
pub trait IntensitySink: Send + Sync {
    fn dispatch(&self, intensity: f32);
}

impl<T: IntensitySink + ?Sized> IntensitySink for Arc<T> {
    fn dispatch(&self, intensity: f32) {
        (**self).dispatch(intensity)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DispatchStats {
    pub dispatches: u64,
    pub last_intensity: f32,
}

/// Per-tick state machine deciding what the devices should be doing.
pub struct VibrationController<S: IntensitySink> {
    state: Arc<SharedIntensityState>,
    config: watch::Receiver<VibeConfig>,
    sink: S,
    handle: IntensityHandle,
    time_since_last_dispatch: f32,
    stats: DispatchStats,

    // Periodic rate logging
    time_since_stats_log: f32,
    dispatches_since_stats_log: u64,
}

impl<S: IntensitySink> VibrationController<S> {
    pub fn new(config: watch::Receiver<VibeConfig>, sink: S) -> Self {
        let state = Arc::new(SharedIntensityState::new());
        let handle = IntensityHandle::new(state.clone(), config.clone());
        info!(
            "Vibration controller created (dispatch interval {}ms)",
            (DISPATCH_INTERVAL_SECS * 1000.0) as u32
        );
        Self {
            state,
            config,
            sink,
            handle,
            time_since_last_dispatch: 0.0,
            stats: DispatchStats::default(),
            time_since_stats_log: 0.0,
            dispatches_since_stats_log: 0,
        }
    }

    /// Handle for event hooks; all clones feed this controller.
    pub fn handle(&self) -> IntensityHandle {
        self.handle.clone()
    }

    pub fn vibrate(&self, speed: f32) {
        self.handle.vibrate(speed);
    }

    pub fn tap(&self) {
        self.handle.tap();
    }

    pub fn vibrate_relative(&self, value: f32, relative_to: f32) {
        self.handle.vibrate_relative(value, relative_to);
    }

    pub fn vibrate_relative_with_min(&self, value: f32, relative_to: f32, min_speed: f32) {
        self.handle
            .vibrate_relative_with_min(value, relative_to, min_speed);
    }

    pub fn current_speed(&self) -> f32 {
        self.state.current_speed()
    }

    pub fn state(&self) -> &SharedIntensityState {
        &self.state
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Advances the controller by `elapsed` seconds.
    ///
    /// Call exactly once per frame. Negative or non-finite values count as zero.
    pub fn tick(&mut self, elapsed: f32) {
        let elapsed = if elapsed.is_finite() && elapsed > 0.0 {
            elapsed
        } else {
            0.0
        };
        // One snapshot per tick; config writes land on the next tick.
        let config = self.config.borrow().clone();

        self.state.begin_tick();
        self.state.accumulate_duration(elapsed);
        self.time_since_last_dispatch += elapsed;

        if config.emergency_stop || config.input_mode == InputMode::None {
            self.state.force_speed(0.0);
        }

        if self.time_since_last_dispatch > DISPATCH_INTERVAL_SECS {
            let intensity = clamp_unit(self.state.current_speed() * config.strength_multiplier);
            self.sink.dispatch(intensity);
            self.time_since_last_dispatch = 0.0;
            self.stats.dispatches += 1;
            self.stats.last_intensity = intensity;
            self.dispatches_since_stats_log += 1;
        }

        if config.input_mode == InputMode::Varied
            && self.state.vibe_duration() > config.max_vibe_duration
        {
            self.state.force_speed(config.base_speed);
        }

        self.log_stats_if_due(elapsed);
    }

    fn log_stats_if_due(&mut self, elapsed: f32) {
        self.time_since_stats_log += elapsed;
        if self.time_since_stats_log < STATS_LOG_INTERVAL_SECS {
            return;
        }
        debug!(
            "Vibration controller stats: {} dispatches in last {:.1}s (avg {:.2}/sec), last intensity {:.3}",
            self.dispatches_since_stats_log,
            self.time_since_stats_log,
            self.dispatches_since_stats_log as f32 / self.time_since_stats_log,
            self.stats.last_intensity
        );
        self.time_since_stats_log = 0.0;
        self.dispatches_since_stats_log = 0;
    }
}
