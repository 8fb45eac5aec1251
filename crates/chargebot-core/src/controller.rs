//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Task wiring and lifecycle for detection and scheduling."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use chargebot_common::config::AppConfig;
use chargebot_msg::{ActuatorPort, TelemetryEvent};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::detection::{run_detection, ChargeDetector, DetectionSummary};
use crate::scheduler::{DutyCycleScheduler, ScheduleSummary};

/// Starts the detection task and, when enabled, the duty-cycle scheduler.
///
/// The two tasks share nothing but the actuator.
pub struct ChargeController {
    config: Arc<AppConfig>,
    actuator: Arc<dyn ActuatorPort>,
}

impl ChargeController {
    pub fn new(config: AppConfig, actuator: Arc<dyn ActuatorPort>) -> Self {
        Self {
            config: Arc::new(config),
            actuator,
        }
    }

    /// Spawn the tasks. `events` is consumed by the detection task only.
    pub fn start(self, events: mpsc::Receiver<TelemetryEvent>) -> ControllerHandle {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);

        let detector = ChargeDetector::new(self.config.detection);
        let detection = tokio::spawn(run_detection(
            events,
            detector,
            self.actuator.clone(),
            self.config.topics.clone(),
            shutdown_tx.subscribe(),
        ));

        let scheduler = if self.config.schedule.enabled {
            let scheduler = DutyCycleScheduler::new(
                self.config.schedule,
                self.actuator.clone(),
                self.config.topics.control.clone(),
            );
            Some(tokio::spawn(scheduler.run(shutdown_rx)))
        } else {
            warn!("duty-cycle scheduler disabled by configuration");
            None
        };

        info!(
            actuator = self.actuator.name(),
            monitor = %self.config.topics.monitor,
            control = %self.config.topics.control,
            "controller started"
        );

        ControllerHandle {
            shutdown: shutdown_tx,
            detection,
            scheduler,
        }
    }
}

/// What each task reported when it stopped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerSummary {
    pub detection: DetectionSummary,
    pub schedule: Option<ScheduleSummary>,
}

/// Lifecycle handle for the running controller tasks.
#[derive(Debug)]
pub struct ControllerHandle {
    shutdown: broadcast::Sender<()>,
    detection: JoinHandle<DetectionSummary>,
    scheduler: Option<JoinHandle<ScheduleSummary>>,
}

impl ControllerHandle {
    /// Signal every task to stop and wait for them.
    pub async fn shutdown(self) -> Result<ControllerSummary> {
        let _ = self.shutdown.send(());
        let detection = self
            .detection
            .await
            .context("detection task join failure")?;
        let schedule = join_scheduler(self.scheduler).await?;
        info!("controller shutdown complete");
        Ok(ControllerSummary {
            detection,
            schedule,
        })
    }

    /// Wait for detection to consume everything already queued, then stop
    /// the scheduler. Only returns once every telemetry sender is dropped.
    pub async fn drain(self) -> Result<ControllerSummary> {
        let detection = self
            .detection
            .await
            .context("detection task join failure")?;
        let _ = self.shutdown.send(());
        let schedule = join_scheduler(self.scheduler).await?;
        info!("controller drained");
        Ok(ControllerSummary {
            detection,
            schedule,
        })
    }
}

async fn join_scheduler(
    scheduler: Option<JoinHandle<ScheduleSummary>>,
) -> Result<Option<ScheduleSummary>> {
    match scheduler {
        Some(handle) => Ok(Some(
            handle.await.context("scheduler task join failure")?,
        )),
        None => Ok(None),
    }
}
