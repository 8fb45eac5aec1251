//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Configuration model, loading, and validation."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;
use url::Url;

use crate::logging::LogFormat;

const DEFAULT_MQTT_PORT: u16 = 1883;
/// Upper bound accepted for `detection.debounce_limit`.
const MAX_DEBOUNCE_LIMIT: u32 = 10_000;

fn default_broker() -> String {
    "tcp://192.168.1.5:1883".to_owned()
}

fn default_client_id() -> String {
    "chargebot".to_owned()
}

fn default_clean_session() -> bool {
    true
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_reconnect_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_disconnect_grace() -> Duration {
    Duration::from_millis(250)
}

fn default_request_capacity() -> usize {
    10
}

fn default_channel_capacity() -> usize {
    16
}

fn default_telemetry_suffix() -> String {
    "SENSOR".to_owned()
}

fn default_rise_ratio() -> f64 {
    0.25
}

fn default_fall_ratio() -> f64 {
    0.45
}

fn default_debounce_limit() -> u32 {
    10
}

fn default_schedule_enabled() -> bool {
    true
}

fn default_cycle_period() -> Duration {
    Duration::from_secs(6 * 24 * 60 * 60)
}

fn default_grace_period() -> Duration {
    Duration::from_secs(60 * 60)
}

/// Primary configuration object for the chargebot daemon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub topics: TopicConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    /// `None` when no file was found and defaults were used.
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "CHARGEBOT_CONFIG";

    /// Load configuration, respecting the `CHARGEBOT_CONFIG` override.
    ///
    /// Unlike an explicit `--config` path, the candidates are optional: when
    /// none of them exist the defaults are returned and the caller is expected
    /// to fill the topics from the command line before calling
    /// [`AppConfig::validate`].
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path.to_path_buf()),
                });
            }
        }

        debug!("no configuration file found; using defaults");
        Ok(LoadedAppConfig {
            config: AppConfig::default(),
            source: None,
        })
    }

    /// Read and parse a TOML configuration file. Validation is deferred to
    /// [`AppConfig::validate`] so command line overrides can be applied first.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Render the effective configuration, used by `--print-config`.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render configuration")
    }

    /// Validate structural invariants. Any error here is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        self.topics.validate()?;
        self.mqtt.endpoint()?;
        self.detection.validate()?;
        self.schedule.validate()?;
        if self.mqtt.channel_capacity == 0 {
            bail!("mqtt.channel_capacity must be at least 1");
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        toml::from_str(content).with_context(|| "failed to parse configuration")
    }
}

/// Broker connection settings.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_broker")]
    pub broker: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    #[serde(default = "default_keep_alive")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keep_alive: Duration,
    /// Upper bound for the initial connect + subscribe handshake.
    #[serde(default = "default_connect_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub connect_timeout: Duration,
    #[serde(default = "default_reconnect_backoff")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub reconnect_backoff: Duration,
    #[serde(default = "default_disconnect_grace")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub disconnect_grace: Duration,
    /// Capacity of the client request queue.
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
    /// Capacity of the telemetry channel between ingress and detection.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            username: None,
            password: None,
            client_id: default_client_id(),
            clean_session: default_clean_session(),
            keep_alive: default_keep_alive(),
            connect_timeout: default_connect_timeout(),
            reconnect_backoff: default_reconnect_backoff(),
            disconnect_grace: default_disconnect_grace(),
            request_capacity: default_request_capacity(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Host and port extracted from [`MqttConfig::broker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
}

impl MqttConfig {
    /// Parse the broker address. Accepts `tcp://host:port`, `mqtt://host:port`
    /// or a bare `host[:port]`.
    pub fn endpoint(&self) -> Result<BrokerEndpoint> {
        let raw = self.broker.trim();
        if raw.is_empty() {
            bail!("mqtt.broker must not be empty");
        }
        let with_scheme = if raw.contains("://") {
            raw.to_owned()
        } else {
            format!("tcp://{raw}")
        };
        let url = Url::parse(&with_scheme)
            .with_context(|| format!("invalid broker address '{}'", self.broker))?;
        match url.scheme() {
            "tcp" | "mqtt" => {}
            other => bail!("unsupported broker scheme '{other}' (expected tcp or mqtt)"),
        }
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| anyhow!("broker address '{}' has no host", self.broker))?;
        Ok(BrokerEndpoint {
            host: host.to_owned(),
            port: url.port().unwrap_or(DEFAULT_MQTT_PORT),
        })
    }

    /// Username/password pair, if a username was supplied. An empty username
    /// counts as no credentials.
    pub fn credentials(&self) -> Option<(String, String)> {
        let user = self.username.as_deref().filter(|user| !user.is_empty())?;
        Some((
            user.to_owned(),
            self.password.clone().unwrap_or_default(),
        ))
    }
}

/// Topics for the monitored relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Subscription carrying power telemetry (e.g. `tele/plug/SENSOR`).
    #[serde(default)]
    pub monitor: String,
    /// Topic receiving `ON`/`OFF` commands (e.g. `cmnd/plug/POWER`).
    #[serde(default)]
    pub control: String,
    /// Only messages whose topic ends with this suffix are treated as telemetry.
    #[serde(default = "default_telemetry_suffix")]
    pub telemetry_suffix: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            monitor: String::new(),
            control: String::new(),
            telemetry_suffix: default_telemetry_suffix(),
        }
    }
}

impl TopicConfig {
    pub fn validate(&self) -> Result<()> {
        if self.monitor.trim().is_empty() || self.control.trim().is_empty() {
            bail!("invalid setting for monitor topic (--mt) or control topic (--ct), must not be empty");
        }
        Ok(())
    }
}

/// Thresholds used by the charge detector. Static for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Relative increase over the baseline that counts as a rising edge.
    #[serde(default = "default_rise_ratio")]
    pub rise_ratio: f64,
    /// Relative decrease below the baseline that counts as a falling edge.
    #[serde(default = "default_fall_ratio")]
    pub fall_ratio: f64,
    /// Falling edges absorbed before the relay is switched off. The command is
    /// issued on the first falling edge after `debounce_limit + 1` were counted.
    #[serde(default = "default_debounce_limit")]
    pub debounce_limit: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            rise_ratio: default_rise_ratio(),
            fall_ratio: default_fall_ratio(),
            debounce_limit: default_debounce_limit(),
        }
    }
}

impl DetectionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.rise_ratio.is_finite() && self.rise_ratio > 0.0) {
            bail!("detection.rise_ratio must be a positive number");
        }
        if !(self.fall_ratio.is_finite() && self.fall_ratio > 0.0 && self.fall_ratio < 1.0) {
            bail!("detection.fall_ratio must be within (0, 1)");
        }
        if self.debounce_limit > MAX_DEBOUNCE_LIMIT {
            bail!(
                "detection.debounce_limit must be at most {}",
                MAX_DEBOUNCE_LIMIT
            );
        }
        Ok(())
    }
}

/// Duty-cycle safety schedule.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_schedule_enabled")]
    pub enabled: bool,
    /// Time between two forced "on" commands.
    #[serde(default = "default_cycle_period")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub period: Duration,
    /// Delay after each "on" before the forced "off".
    #[serde(default = "default_grace_period")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub grace: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: default_schedule_enabled(),
            period: default_cycle_period(),
            grace: default_grace_period(),
        }
    }
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.period.is_zero() || self.grace.is_zero() {
            bail!("schedule.period and schedule.grace must be non-zero");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for the daily rolling log file. Stdout only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_topics() -> AppConfig {
        let mut config = AppConfig::default();
        config.topics.monitor = "tele/charger/SENSOR".into();
        config.topics.control = "cmnd/charger/POWER".into();
        config
    }

    #[test]
    fn defaults_match_relay_behaviour() {
        let config = AppConfig::default();
        assert_eq!(config.mqtt.client_id, "chargebot");
        assert!(config.mqtt.clean_session);
        assert_eq!(config.topics.telemetry_suffix, "SENSOR");
        assert_eq!(config.detection.rise_ratio, 0.25);
        assert_eq!(config.detection.fall_ratio, 0.45);
        assert_eq!(config.detection.debounce_limit, 10);
        assert_eq!(config.schedule.period, Duration::from_secs(518_400));
        assert_eq!(config.schedule.grace, Duration::from_secs(3_600));
        assert_eq!(config.mqtt.disconnect_grace, Duration::from_millis(250));
    }

    #[test]
    fn missing_topics_are_rejected() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_err());
        config.topics.monitor = "tele/charger/SENSOR".into();
        assert!(config.validate().is_err());
        config.topics.control = "cmnd/charger/POWER".into();
        config.validate().expect("topics present");
    }

    #[test]
    fn broker_address_forms() {
        let mut mqtt = MqttConfig::default();
        assert_eq!(
            mqtt.endpoint().unwrap(),
            BrokerEndpoint {
                host: "192.168.1.5".into(),
                port: 1883
            }
        );

        mqtt.broker = "mqtt://broker.local".into();
        assert_eq!(mqtt.endpoint().unwrap().port, 1883);

        mqtt.broker = "broker.local:2883".into();
        let endpoint = mqtt.endpoint().unwrap();
        assert_eq!(endpoint.host, "broker.local");
        assert_eq!(endpoint.port, 2883);

        mqtt.broker = "ws://broker.local:80".into();
        assert!(mqtt.endpoint().is_err());

        mqtt.broker = "  ".into();
        assert!(mqtt.endpoint().is_err());
    }

    #[test]
    fn empty_username_means_anonymous() {
        let mut mqtt = MqttConfig::default();
        assert!(mqtt.credentials().is_none());
        mqtt.username = Some(String::new());
        assert!(mqtt.credentials().is_none());
        mqtt.username = Some("plug".into());
        assert_eq!(mqtt.credentials(), Some(("plug".into(), String::new())));
    }

    #[test]
    fn parses_partial_toml() {
        let config: AppConfig = r#"
            [mqtt]
            broker = "tcp://10.0.0.2:1884"
            disconnect_grace = 500

            [topics]
            monitor = "tele/garage/SENSOR"
            control = "cmnd/garage/POWER"

            [schedule]
            period = 7200
            grace = 60
        "#
        .parse()
        .expect("valid toml");

        assert_eq!(config.mqtt.endpoint().unwrap().port, 1884);
        assert_eq!(config.mqtt.disconnect_grace, Duration::from_millis(500));
        assert_eq!(config.schedule.period, Duration::from_secs(7_200));
        assert_eq!(config.schedule.grace, Duration::from_secs(60));
        assert_eq!(config.detection, DetectionConfig::default());
        config.validate().expect("valid config");
    }

    #[test]
    fn rejects_nonsensical_thresholds() {
        let mut config = with_topics();
        config.detection.fall_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = with_topics();
        config.detection.rise_ratio = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = with_topics();
        config.detection.debounce_limit = u32::MAX;
        assert!(config.validate().is_err());
        config.detection.debounce_limit = 10_000;
        config.validate().expect("upper bound is inclusive");

        let mut config = with_topics();
        config.schedule.grace = Duration::ZERO;
        assert!(config.validate().is_err());
        config.schedule.enabled = false;
        config.validate().expect("disabled schedule is not checked");
    }

    #[test]
    fn loads_from_file_and_round_trips_through_print() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chargebot.toml");
        let rendered = with_topics().to_toml().expect("render");
        fs::write(&path, rendered).expect("write config");

        let loaded = AppConfig::from_path(&path).expect("load");
        assert_eq!(loaded, with_topics());
    }

    #[test]
    fn shipped_example_config_is_valid() {
        let config: AppConfig = include_str!("../../../configs/chargebot.example.toml")
            .parse()
            .expect("example parses");
        config.validate().expect("example validates");
        assert_eq!(config.detection, DetectionConfig::default());
        assert_eq!(config.schedule, ScheduleConfig::default());
        assert_eq!(config.mqtt, MqttConfig::default());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(AppConfig::from_path(&dir.path().join("absent.toml")).is_err());
    }
}
