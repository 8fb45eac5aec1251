//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry types, actuator port, and MQTT transport."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Messaging boundary of chargebot: decoded telemetry types, the
//! [`ActuatorPort`] used to switch the relay, and the MQTT transport that
//! backs both directions in production.

use std::time::Duration;

pub mod mqtt;
pub mod transport;
pub mod types;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors raised at the messaging boundary.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// The MQTT client could not queue a request.
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    /// The connection to the broker failed.
    #[error("mqtt connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
    /// The broker refused the telemetry subscription.
    #[error("subscription to '{topic}' was rejected by the broker")]
    SubscriptionRejected {
        /// Topic filter that was refused.
        topic: String,
    },
    /// Connect and subscribe did not complete in time.
    #[error("broker handshake did not complete within {0:?}")]
    StartupTimeout(Duration),
    /// An actuator refused the command without reaching the transport.
    #[error("actuator '{0}' rejected the command")]
    Rejected(&'static str),
    /// Wrapper for JSON deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub use mqtt::{IngressMetrics, MqttActuator, MqttIngress, MqttSession};
pub use transport::{ActuatorPort, CommandRecord, InMemoryActuator};
pub use types::{PowerState, TelemetryEvent, TelemetrySample};
