//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry event and power command types."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Result;

/// Raw message as delivered by the telemetry subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    /// Topic the message arrived on.
    pub topic: String,
    /// Undecoded payload.
    pub payload: Bytes,
    /// Arrival time, used for logging only.
    pub received_at: DateTime<Utc>,
}

impl TelemetryEvent {
    /// Wrap a freshly received message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    /// Whether the topic ends with `suffix`. The relay publishes several
    /// report kinds (`STATE`, `SENSOR`, ...) below the same prefix.
    pub fn has_suffix(&self, suffix: &str) -> bool {
        self.topic.ends_with(suffix)
    }
}

type JsonObject = Map<String, Value>;

/// Key lookup preferring an exact match, then an ASCII case-insensitive one.
/// Firmware builds differ in how they capitalise report keys.
fn field<'a>(object: &'a JsonObject, name: &str) -> Option<&'a Value> {
    object.get(name).or_else(|| {
        object
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    })
}

/// One decoded power reading in watts.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TelemetrySample {
    /// Instantaneous power draw.
    pub power: f64,
}

impl TelemetrySample {
    /// Construct a sample from a known power value.
    pub fn new(power: f64) -> Self {
        Self { power }
    }

    /// Decode the `ENERGY.Power` field of a sensor report. Missing fields
    /// decode as zero; a payload that is not a JSON object is an error.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let report: JsonObject = serde_json::from_slice(payload)?;
        let energy = match field(&report, "ENERGY") {
            None | Some(Value::Null) => return Ok(Self::default()),
            Some(energy) => JsonObject::deserialize(energy)?,
        };
        let power = match field(&energy, "Power") {
            None | Some(Value::Null) => 0.0,
            Some(power) => f64::deserialize(power)?,
        };
        Ok(Self { power })
    }
}

/// Requested relay state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PowerState {
    /// Relay closed, load powered.
    On,
    /// Relay open.
    Off,
}

impl PowerState {
    /// Literal token published on the control topic.
    pub fn as_payload(&self) -> &'static str {
        match self {
            PowerState::On => "ON",
            PowerState::Off => "OFF",
        }
    }
}

impl From<bool> for PowerState {
    fn from(on: bool) -> Self {
        if on {
            PowerState::On
        } else {
            PowerState::Off
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_payload())
    }
}
