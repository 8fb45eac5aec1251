//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Charge detection state machine and its consumer task."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! Turns a stream of noisy power readings into a "charger finished" decision.
//!
//! ```text
//! Idle ──[rise > rise_ratio]──▶ Charging ──[fall > fall_ratio, debounce exhausted]──▶ Idle (relay off)
//!                                  ▲   │
//!                                  └───┘ rise resets the debounce count
//! ```
//!
//! The baseline is a lagging high-water mark: every rising edge moves it to
//! the midpoint between itself and the new reading, so ripple while charging
//! does not drag it around. Falling edges are measured against that baseline.

use std::fmt;
use std::sync::Arc;

use chargebot_common::config::{DetectionConfig, TopicConfig};
use chargebot_msg::{ActuatorPort, PowerState, TelemetryEvent, TelemetrySample};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

/// Coarse detector phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargePhase {
    /// No rising edge since start or since the last switch-off.
    Idle,
    /// A load was detected and the detector is watching for it to finish.
    Charging,
}

impl ChargePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargePhase::Idle => "idle",
            ChargePhase::Charging => "charging",
        }
    }
}

impl fmt::Display for ChargePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Working memory of the detector. Owned by exactly one task.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChargeState {
    last_power: f64,
    is_charging: bool,
    low_count: u32,
}

impl ChargeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idle state with a pre-learned baseline.
    pub fn with_baseline(last_power: f64) -> Self {
        Self {
            last_power,
            ..Self::default()
        }
    }

    pub fn last_power(&self) -> f64 {
        self.last_power
    }

    pub fn is_charging(&self) -> bool {
        self.is_charging
    }

    pub fn low_count(&self) -> u32 {
        self.low_count
    }

    pub fn phase(&self) -> ChargePhase {
        if self.is_charging {
            ChargePhase::Charging
        } else {
            ChargePhase::Idle
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Outcome of feeding one sample to the detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// No rule matched; state untouched.
    Unchanged,
    /// Rising edge. `cancelled` is the debounce count that was discarded.
    Rising { baseline: f64, cancelled: u32 },
    /// Falling edge absorbed by the debounce.
    Debouncing { low_count: u32 },
    /// Debounce exhausted: state was reset and the relay must be switched off.
    Finished,
}

impl Observation {
    /// Relay command implied by this observation.
    pub fn command(&self) -> Option<PowerState> {
        match self {
            Observation::Finished => Some(PowerState::Off),
            _ => None,
        }
    }
}

/// `|delta / baseline|`, with the zero baseline made explicit: `0 / 0` is
/// undefined and yields `None`, anything else over zero is unbounded.
fn relative_change(delta: f64, baseline: f64) -> Option<f64> {
    if baseline == 0.0 {
        return if delta == 0.0 {
            None
        } else {
            Some(f64::INFINITY)
        };
    }
    Some((delta / baseline).abs())
}

/// Stateless rule set; the state lives in [`ChargeState`].
#[derive(Debug, Clone, Copy)]
pub struct ChargeDetector {
    config: DetectionConfig,
}

impl ChargeDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Apply one reading to `state`.
    pub fn observe(&self, state: &mut ChargeState, sample: TelemetrySample) -> Observation {
        let current = sample.power;
        let last = state.last_power;
        let delta = current - last;

        let Some(delta_pct) = relative_change(delta, last) else {
            trace!(last, current, "zero baseline and zero reading; skipping rules");
            return Observation::Unchanged;
        };

        debug!(last, current, delta, pct = delta_pct, "power reading");

        if current > last && delta_pct > self.config.rise_ratio {
            state.is_charging = true;
            state.last_power = (current + last) / 2.0;
            let cancelled = std::mem::take(&mut state.low_count);
            if cancelled > 0 {
                info!(cancelled, baseline = state.last_power, "load rebounded; debounce reset");
            } else {
                debug!(baseline = state.last_power, "rising edge; load is on");
            }
            return Observation::Rising {
                baseline: state.last_power,
                cancelled,
            };
        }

        if state.is_charging && delta < 0.0 && delta_pct > self.config.fall_ratio {
            if state.low_count <= self.config.debounce_limit {
                state.low_count = state.low_count.saturating_add(1);
                debug!(low_count = state.low_count, "falling edge; waiting for it to persist");
                return Observation::Debouncing {
                    low_count: state.low_count,
                };
            }
            info!(last, current, "load finished");
            state.reset();
            return Observation::Finished;
        }

        Observation::Unchanged
    }
}

/// Counters returned by [`run_detection`] when it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DetectionSummary {
    /// Final detector state.
    pub state: ChargeState,
    /// Samples fed to the detector.
    pub samples: u64,
    /// Events dropped by the topic suffix filter.
    pub filtered: u64,
    /// Payloads that failed to decode and were read as zero power.
    pub decode_failures: u64,
    /// Switch-off commands accepted by the actuator.
    pub commands_sent: u64,
    /// Switch-off commands the actuator refused.
    pub command_failures: u64,
}

/// Detection task body: the sole consumer of the telemetry channel.
///
/// Events are handled one at a time, in arrival order, including the
/// actuator call. Returns when `shutdown` fires or every sender is dropped.
pub async fn run_detection(
    mut events: mpsc::Receiver<TelemetryEvent>,
    detector: ChargeDetector,
    actuator: Arc<dyn ActuatorPort>,
    topics: TopicConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> DetectionSummary {
    let mut state = ChargeState::new();
    let mut summary = DetectionSummary::default();

    loop {
        let event = tokio::select! {
            _ = shutdown.recv() => {
                debug!("detection shutdown signal received");
                break;
            }
            received = events.recv() => match received {
                Some(event) => event,
                None => {
                    debug!("telemetry channel closed");
                    break;
                }
            },
        };

        if !event.has_suffix(&topics.telemetry_suffix) {
            summary.filtered += 1;
            trace!(topic = %event.topic, "ignoring non-telemetry message");
            continue;
        }

        let sample = match TelemetrySample::decode(&event.payload) {
            Ok(sample) => sample,
            Err(err) => {
                summary.decode_failures += 1;
                warn!(topic = %event.topic, error = %err, "undecodable telemetry; reading as zero");
                TelemetrySample::default()
            }
        };
        summary.samples += 1;
        debug!(topic = %event.topic, received_at = %event.received_at, power = sample.power, "telemetry");

        let observation = detector.observe(&mut state, sample);
        if let Some(command) = observation.command() {
            info!(topic = %topics.control, command = %command, "switching relay");
            match actuator.set_power(&topics.control, command).await {
                Ok(()) => summary.commands_sent += 1,
                Err(err) => {
                    // State is not rolled back; the next rising edge starts over.
                    summary.command_failures += 1;
                    error!(
                        actuator = actuator.name(),
                        topic = %topics.control,
                        error = %err,
                        "failed to send switch-off command"
                    );
                }
            }
        }
    }

    summary.state = state;
    info!(
        samples = summary.samples,
        filtered = summary.filtered,
        decode_failures = summary.decode_failures,
        commands_sent = summary.commands_sent,
        phase = %state.phase(),
        "detection stopped"
    );
    summary
}
