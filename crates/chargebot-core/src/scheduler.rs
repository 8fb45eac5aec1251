//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Duty-cycle safety schedule for the relay."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use chargebot_common::config::ScheduleConfig;
use chargebot_msg::{ActuatorPort, PowerState};
use tokio::sync::broadcast;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Counters returned by [`DutyCycleScheduler::run`] when it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleSummary {
    /// Cycles started ("on" attempted).
    pub cycles: u64,
    /// Forced "off" commands attempted.
    pub forced_offs: u64,
    /// Commands the actuator refused.
    pub command_failures: u64,
}

/// Switches the relay on every `period` and forces it off `grace` later,
/// whatever the detector decided in between.
///
/// One task, one reusable forced-off deadline. A cycle that starts while the
/// previous deadline is still pending keeps that earlier deadline.
pub struct DutyCycleScheduler {
    config: ScheduleConfig,
    actuator: Arc<dyn ActuatorPort>,
    control_topic: String,
    forced_off_at: Option<Instant>,
    summary: ScheduleSummary,
}

impl DutyCycleScheduler {
    pub fn new(
        config: ScheduleConfig,
        actuator: Arc<dyn ActuatorPort>,
        control_topic: impl Into<String>,
    ) -> Self {
        Self {
            config,
            actuator,
            control_topic: control_topic.into(),
            forced_off_at: None,
            summary: ScheduleSummary::default(),
        }
    }

    /// Run cycles starting immediately until `shutdown` fires.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> ScheduleSummary {
        let mut next_cycle = Instant::now();
        info!(
            period = ?self.config.period,
            grace = ?self.config.grace,
            topic = %self.control_topic,
            "duty-cycle scheduler started"
        );

        loop {
            let forced_off_at = self.forced_off_at;
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    debug!("scheduler shutdown signal received");
                    break;
                }
                _ = sleep_until(forced_off_at.unwrap_or(next_cycle)), if forced_off_at.is_some() => {
                    self.forced_off_at = None;
                    self.summary.forced_offs += 1;
                    info!(grace = ?self.config.grace, "grace period over; forcing relay off");
                    self.switch(PowerState::Off).await;
                }
                _ = sleep_until(next_cycle) => {
                    self.start_cycle(next_cycle).await;
                    next_cycle += self.config.period;
                }
            }
        }

        info!(
            cycles = self.summary.cycles,
            forced_offs = self.summary.forced_offs,
            "duty-cycle scheduler stopped"
        );
        self.summary
    }

    async fn start_cycle(&mut self, scheduled_at: Instant) {
        self.summary.cycles += 1;
        info!(cycle = self.summary.cycles, "duty cycle start; turning relay on");
        self.switch(PowerState::On).await;

        let deadline = scheduled_at + self.config.grace;
        match self.forced_off_at {
            Some(pending) => {
                warn!(
                    pending_in = ?pending.saturating_duration_since(Instant::now()),
                    "previous forced-off still pending; keeping it"
                );
            }
            None => self.forced_off_at = Some(deadline),
        }
    }

    async fn switch(&mut self, state: PowerState) {
        if let Err(err) = self.actuator.set_power(&self.control_topic, state).await {
            self.summary.command_failures += 1;
            error!(
                actuator = self.actuator.name(),
                topic = %self.control_topic,
                command = %state,
                error = %err,
                "scheduled command failed"
            );
        }
    }
}
