use color_eyre::Result;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::command::HostCommand;
use crate::config::ConfigStore;
use crate::session::{IntensityDispatcher, SessionHandle};
use crate::vibration::VibrationController;

/// Drives the controller at a fixed tick rate and applies host commands
/// between ticks, so every event-source call runs on the tick task.
pub struct HostLoop {
    controller: VibrationController<IntensityDispatcher>,
    session: SessionHandle,
    config: ConfigStore,
    commands: mpsc::Receiver<HostCommand>,
}

impl HostLoop {
    pub fn new(
        controller: VibrationController<IntensityDispatcher>,
        session: SessionHandle,
        config: ConfigStore,
        commands: mpsc::Receiver<HostCommand>,
    ) -> Self {
        Self {
            controller,
            session,
            config,
            commands,
        }
    }

    /// Runs until `quit`, the command channel closing, or Ctrl-C; then waits
    /// for the device session to shut down.
    pub async fn run(mut self) -> Result<()> {
        let tick_rate = self.config.snapshot().tick_rate_hz.max(1);
        let period = Duration::from_secs_f64(1.0 / f64::from(tick_rate));
        info!("Starting tick loop at {}Hz", tick_rate);

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Instant::now();
                    let elapsed = now.duration_since(last_tick);
                    last_tick = now;
                    self.controller.tick(elapsed.as_secs_f32());
                }
                command = self.commands.recv() => match command {
                    Some(HostCommand::Quit) | None => {
                        info!("Stopping tick loop");
                        break;
                    }
                    Some(command) => self.apply(command).await,
                },
                _ = &mut ctrl_c => {
                    info!("Interrupted, stopping tick loop");
                    break;
                }
            }
        }

        self.session.shutdown().await;
        Ok(())
    }

    async fn apply(&mut self, command: HostCommand) {
        debug!("Host command: {:?}", command);
        match command {
            HostCommand::Vibrate(speed) => self.controller.vibrate(speed),
            HostCommand::Tap => self.controller.tap(),
            HostCommand::Relative {
                value,
                relative_to,
                min_speed: Some(min_speed),
            } => self
                .controller
                .vibrate_relative_with_min(value, relative_to, min_speed),
            HostCommand::Relative {
                value,
                relative_to,
                min_speed: None,
            } => self.controller.vibrate_relative(value, relative_to),
            HostCommand::EmergencyStop(engaged) => self.config.set_emergency_stop(engaged),
            HostCommand::Mode(mode) => {
                if let Err(e) = self.config.update(|c| c.input_mode = mode) {
                    warn!("Cannot change input mode: {}", e);
                } else {
                    info!("Input mode set to {}", mode);
                }
            }
            HostCommand::Strength(multiplier) => {
                if let Err(e) = self.config.update(|c| c.strength_multiplier = multiplier) {
                    warn!("Cannot change strength: {}", e);
                } else {
                    info!("Strength multiplier set to {}", multiplier);
                }
            }
            HostCommand::Reconnect => self.session.request_reconnect(),
            HostCommand::Disconnect => self.session.request_disconnect(),
            HostCommand::Devices => {
                let devices = self.session.devices().snapshot().await;
                if devices.is_empty() {
                    info!("No devices connected");
                }
                for device in devices {
                    info!(
                        "  [{}] {} - vibrators: {:?}, added {}",
                        device.index,
                        device.name,
                        device.vibrators,
                        device.added_at.format("%H:%M:%S")
                    );
                }
            }
            HostCommand::Status => {
                let config = self.config.snapshot();
                let stats = self.controller.stats();
                info!(
                    "Session: {}, speed {:.3}, mode {}, strength {}, emergency stop {}, {} dispatches (last {:.3})",
                    self.session.status(),
                    self.controller.current_speed(),
                    config.input_mode,
                    config.strength_multiplier,
                    config.emergency_stop,
                    stats.dispatches,
                    stats.last_intensity
                );
            }
            HostCommand::Reload => {
                // File I/O stays off the tick task
                let store = self.config.clone();
                tokio::spawn(async move {
                    if let Err(e) = store.reload().await {
                        warn!("Config reload failed: {}", e);
                    }
                });
            }
            HostCommand::Quit => {}
        }
    }
}
