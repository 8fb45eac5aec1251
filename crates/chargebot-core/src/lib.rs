//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Charge detection, duty-cycle scheduling, and task wiring."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! Core runtime of chargebot: the charge detection state machine, the
//! duty-cycle safety scheduler, and the controller that runs both.

pub mod controller;
pub mod detection;
pub mod scheduler;

pub use controller::{ChargeController, ControllerHandle, ControllerSummary};
pub use detection::{
    run_detection, ChargeDetector, ChargePhase, ChargeState, DetectionSummary, Observation,
};
pub use scheduler::{DutyCycleScheduler, ScheduleSummary};
