//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the chargebot daemon."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chargebot_common::config::AppConfig;
use chargebot_common::logging::{init_tracing, LogFormat};
use chargebot_core::{ChargeController, ControllerSummary};
use chargebot_msg::{InMemoryActuator, MqttSession, TelemetryEvent};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Switches a smart plug off when the charger behind it has finished",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, env = "CHARGEBOT_BROKER", help = "MQTT broker, e.g. tcp://192.168.1.5:1883")]
    broker: Option<String>,

    #[arg(long, env = "CHARGEBOT_USER", help = "MQTT username")]
    user: Option<String>,

    #[arg(long, env = "CHARGEBOT_PASSWORD", hide_env_values = true, help = "MQTT password")]
    password: Option<String>,

    #[arg(
        long = "mt",
        alias = "monitor-topic",
        env = "CHARGEBOT_MONITOR_TOPIC",
        help = "Topic to subscribe for power telemetry"
    )]
    monitor_topic: Option<String>,

    #[arg(
        long = "ct",
        alias = "control-topic",
        env = "CHARGEBOT_CONTROL_TOPIC",
        help = "Topic receiving ON/OFF commands"
    )]
    control_topic: Option<String>,

    #[arg(long, help = "Override log format (json or pretty)")]
    log_format: Option<LogFormat>,

    #[arg(long, help = "Disable the duty-cycle scheduler")]
    no_schedule: bool,

    #[arg(
        long,
        help = "Read `topic<TAB>payload` lines from stdin and record commands instead of connecting"
    )]
    dry_run: bool,

    #[arg(long, help = "Print the effective configuration as TOML and exit")]
    print_config: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(broker) = &self.broker {
            config.mqtt.broker = broker.clone();
        }
        if let Some(user) = &self.user {
            config.mqtt.username = Some(user.clone());
        }
        if let Some(password) = &self.password {
            config.mqtt.password = Some(password.clone());
        }
        if let Some(topic) = &self.monitor_topic {
            config.topics.monitor = topic.clone();
        }
        if let Some(topic) = &self.control_topic {
            config.topics.control = topic.clone();
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
        if self.no_schedule {
            config.schedule.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        if !path.exists() {
            anyhow::bail!("config file {} does not exist", path.display());
        }
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/chargebot.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    cli.apply_overrides(&mut config);

    if cli.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    init_tracing("chargebotd", &config.logging)?;
    match &loaded.source {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => info!("no configuration file found; using defaults and flags"),
    }

    if let Err(err) = config.validate() {
        error!(error = %err, "invalid configuration");
        return Err(err);
    }

    let result = if cli.dry_run {
        run_dry(config).await
    } else {
        run_daemon(config).await
    };
    if let Err(err) = &result {
        error!(error = %err, "chargebotd exiting with error");
    }
    result
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let endpoint = config.mqtt.endpoint()?;
    let session = MqttSession::connect(&config.mqtt, &endpoint, &config.topics.monitor)
        .await
        .with_context(|| format!("unable to connect to broker {}", config.mqtt.broker))?;
    let (actuator, ingress) = session.split();

    let (events_tx, events_rx) = mpsc::channel(config.mqtt.channel_capacity);
    let (ingress_stop_tx, ingress_stop_rx) = broadcast::channel(1);
    let mut ingress_task = tokio::spawn(ingress.run(events_tx, ingress_stop_rx));

    let handle = ChargeController::new(config, Arc::new(actuator)).start(events_rx);

    info!("daemon running; waiting for termination signal");
    let ingress_done = tokio::select! {
        reason = shutdown_signal() => {
            info!(signal = reason, "termination signal received; shutting down");
            false
        }
        _ = &mut ingress_task => {
            warn!("telemetry ingress stopped unexpectedly; shutting down");
            true
        }
    };

    // Stop the controller first so pending commands reach the client queue
    // before the ingress disconnects.
    let summary = handle.shutdown().await?;
    log_summary(&summary);

    if !ingress_done {
        let _ = ingress_stop_tx.send(());
        let metrics = ingress_task.await.context("ingress task join failure")?;
        info!(
            received = metrics.received,
            reconnects = metrics.reconnects,
            errors = metrics.errors,
            "ingress stopped"
        );
    }

    Ok(())
}

async fn run_dry(config: AppConfig) -> Result<()> {
    info!("dry run: reading telemetry from stdin, commands are recorded only");
    let actuator = InMemoryActuator::new();
    let (events_tx, events_rx) = mpsc::channel(config.mqtt.channel_capacity);
    let handle = ChargeController::new(config, Arc::new(actuator.clone())).start(events_rx);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            reason = shutdown_signal() => {
                info!(signal = reason, "termination signal received; shutting down");
                break;
            }
            line = lines.next_line() => line.context("failed to read stdin")?,
        };
        let Some(line) = line else {
            info!("stdin closed");
            break;
        };
        let Some((topic, payload)) = line.split_once('\t') else {
            if !line.trim().is_empty() {
                warn!(line = %line, "expected `topic<TAB>payload`; skipping");
            }
            continue;
        };
        let event = TelemetryEvent::new(topic.trim(), payload.trim().to_owned());
        if events_tx.send(event).await.is_err() {
            warn!("detection stopped; no longer reading stdin");
            break;
        }
    }
    drop(events_tx);

    let summary = handle.drain().await?;
    log_summary(&summary);

    for record in actuator.commands() {
        println!("{}\t{}", record.topic, record.state);
    }
    Ok(())
}

fn log_summary(summary: &ControllerSummary) {
    let detection = &summary.detection;
    info!(
        samples = detection.samples,
        filtered = detection.filtered,
        decode_failures = detection.decode_failures,
        commands_sent = detection.commands_sent,
        command_failures = detection.command_failures,
        phase = %detection.state.phase(),
        "detection summary"
    );
    if let Some(schedule) = &summary.schedule {
        info!(
            cycles = schedule.cycles,
            forced_offs = schedule.forced_offs,
            command_failures = schedule.command_failures,
            "schedule summary"
        );
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};

    match unix_signal(SignalKind::terminate()) {
        Ok(mut terminate) => tokio::select! {
            _ = signal::ctrl_c() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        },
        Err(err) => {
            warn!(error = %err, "unable to install SIGTERM handler; only ctrl-c is honoured");
            let _ = signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    let _ = signal::ctrl_c().await;
    "ctrl-c"
}
