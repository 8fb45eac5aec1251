//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Property tests for the charge detection state machine."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use chargebot_common::config::DetectionConfig;
use chargebot_core::{ChargeDetector, ChargeState, Observation};
use chargebot_msg::TelemetrySample;
use proptest::prelude::*;

fn detector_with_limit(debounce_limit: u32) -> ChargeDetector {
    ChargeDetector::new(DetectionConfig {
        debounce_limit,
        ..DetectionConfig::default()
    })
}

/// Charging with a 115 W baseline.
fn charging_state(detector: &ChargeDetector) -> ChargeState {
    let mut state = ChargeState::with_baseline(100.0);
    detector.observe(&mut state, TelemetrySample::new(130.0));
    state
}

fn reading() -> impl Strategy<Value = f64> {
    prop_oneof![
        3 => 0.0f64..2_000.0,
        1 => Just(0.0),
        1 => 0.0f64..20.0,
    ]
}

proptest! {
    /// Every step more than 25% above the baseline is a rising edge that
    /// lands on the midpoint and stays below the raw reading.
    #[test]
    fn rising_readings_move_baseline_to_midpoint(
        start in 1.0f64..1_000.0,
        factors in proptest::collection::vec(1.3f64..4.0, 1..40),
    ) {
        let detector = detector_with_limit(10);
        let mut state = ChargeState::with_baseline(start);
        for factor in factors {
            let previous = state.last_power();
            let current = previous * factor;
            let observation = detector.observe(&mut state, TelemetrySample::new(current));
            prop_assert_eq!(
                observation,
                Observation::Rising { baseline: (current + previous) / 2.0, cancelled: 0 }
            );
            prop_assert!(state.is_charging());
            prop_assert!(state.last_power() < current);
        }
    }

    /// Up to eleven qualifying falls followed by a rise never switch off and
    /// leave the debounce count at zero.
    #[test]
    fn short_fall_streak_then_rise_never_switches_off(
        falls in proptest::collection::vec(0.0f64..60.0, 0..=11),
    ) {
        let detector = detector_with_limit(10);
        let mut state = charging_state(&detector);
        for (index, power) in falls.iter().enumerate() {
            let observation = detector.observe(&mut state, TelemetrySample::new(*power));
            prop_assert_eq!(observation, Observation::Debouncing { low_count: index as u32 + 1 });
            prop_assert_eq!(observation.command(), None);
        }

        let rebound = state.last_power() * 2.0;
        let observation = detector.observe(&mut state, TelemetrySample::new(rebound));
        prop_assert_eq!(
            observation,
            Observation::Rising { baseline: 172.5, cancelled: falls.len() as u32 }
        );
        prop_assert_eq!(state.low_count(), 0);
        prop_assert!(state.is_charging());
    }

    /// A sustained drop switches off exactly once, on the fall after
    /// `debounce_limit + 1` absorbed ones.
    #[test]
    fn sustained_drop_switches_off_exactly_once(
        debounce_limit in 0u32..20,
        extra in 0usize..10,
    ) {
        let detector = detector_with_limit(debounce_limit);
        let mut state = charging_state(&detector);
        let total = debounce_limit as usize + 2 + extra;

        let observations: Vec<Observation> = (0..total)
            .map(|_| detector.observe(&mut state, TelemetrySample::new(10.0)))
            .collect();
        let finished: Vec<usize> = observations
            .iter()
            .enumerate()
            .filter(|(_, observation)| **observation == Observation::Finished)
            .map(|(index, _)| index)
            .collect();
        prop_assert_eq!(finished, vec![debounce_limit as usize + 1]);
    }

    /// Arbitrary telemetry never breaks the state invariants: the debounce
    /// count only moves while charging, stays bounded, and a switch-off
    /// always resets the whole state.
    #[test]
    fn random_walk_preserves_state_invariants(
        debounce_limit in 0u32..20,
        readings in proptest::collection::vec(reading(), 1..400),
    ) {
        let detector = detector_with_limit(debounce_limit);
        let mut state = ChargeState::new();
        for power in readings {
            let before = state;
            let observation = detector.observe(&mut state, TelemetrySample::new(power));
            match observation {
                Observation::Unchanged => {
                    prop_assert_eq!(state, before);
                }
                Observation::Rising { baseline, cancelled } => {
                    prop_assert!(power > before.last_power());
                    prop_assert!(state.is_charging());
                    prop_assert_eq!(baseline, state.last_power());
                    prop_assert_eq!(cancelled, before.low_count());
                    prop_assert_eq!(state.low_count(), 0);
                }
                Observation::Debouncing { low_count } => {
                    prop_assert!(before.is_charging());
                    prop_assert_eq!(low_count, before.low_count() + 1);
                    prop_assert_eq!(state.last_power(), before.last_power());
                }
                Observation::Finished => {
                    prop_assert!(before.is_charging());
                    prop_assert_eq!(before.low_count(), debounce_limit + 1);
                    prop_assert_eq!(state, ChargeState::new());
                }
            }
            prop_assert!(state.low_count() == 0 || state.is_charging());
            prop_assert!(state.low_count() <= debounce_limit + 1);
        }
    }

    /// Once switched off, falling readings leave the reset state alone.
    #[test]
    fn falls_after_switch_off_change_nothing(count in 1usize..50) {
        let detector = detector_with_limit(10);
        let mut state = charging_state(&detector);
        for _ in 0..12 {
            detector.observe(&mut state, TelemetrySample::new(10.0));
        }
        prop_assert_eq!(state, ChargeState::new());
        for _ in 0..count {
            prop_assert_eq!(
                detector.observe(&mut state, TelemetrySample::new(0.0)),
                Observation::Unchanged
            );
            prop_assert_eq!(state, ChargeState::new());
        }
    }
}
