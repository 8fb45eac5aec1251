//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared configuration and logging primitives."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the chargebot workspace: configuration loading and
//! validation, and tracing initialisation.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, BrokerEndpoint, DetectionConfig, LoadedAppConfig, LoggingConfig, MqttConfig,
    ScheduleConfig, TopicConfig,
};
pub use logging::{init_tracing, LogFormat};
