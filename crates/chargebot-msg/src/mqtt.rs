//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "MQTT session, telemetry ingress, and relay actuator."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use chargebot_common::config::{BrokerEndpoint, MqttConfig};
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubAck, SubscribeReasonCode,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::transport::ActuatorPort;
use crate::types::{PowerState, TelemetryEvent};
use crate::{MessagingError, Result};

/// Counters reported by [`MqttIngress::run`] when it stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngressMetrics {
    /// PUBLISH packets received from the broker.
    pub received: u64,
    /// Reconnections after the initial handshake.
    pub reconnects: u64,
    /// Event loop errors observed.
    pub errors: u64,
}

/// An established broker connection with the telemetry subscription in place.
pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    monitor_topic: String,
    backlog: Vec<TelemetryEvent>,
    reconnect_backoff: Duration,
    disconnect_grace: Duration,
}

impl MqttSession {
    /// Connect to the broker and subscribe to `monitor_topic` at QoS 0.
    ///
    /// Fails if the connection is refused, the subscription is rejected, or
    /// both do not complete within `connect_timeout`.
    pub async fn connect(
        config: &MqttConfig,
        endpoint: &BrokerEndpoint,
        monitor_topic: &str,
    ) -> Result<Self> {
        let mut options =
            MqttOptions::new(config.client_id.clone(), endpoint.host.clone(), endpoint.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(config.clean_session);
        if let Some((username, password)) = config.credentials() {
            options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, config.request_capacity);
        client.subscribe(monitor_topic, QoS::AtMostOnce).await?;

        let backlog = match timeout(
            config.connect_timeout,
            handshake(&mut eventloop, monitor_topic),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(MessagingError::StartupTimeout(config.connect_timeout)),
        };

        info!(
            host = %endpoint.host,
            port = endpoint.port,
            client_id = %config.client_id,
            topic = %monitor_topic,
            "connected and subscribed"
        );

        Ok(Self {
            client,
            eventloop,
            monitor_topic: monitor_topic.to_owned(),
            backlog,
            reconnect_backoff: config.reconnect_backoff,
            disconnect_grace: config.disconnect_grace,
        })
    }

    /// Split into the command side and the telemetry side.
    pub fn split(self) -> (MqttActuator, MqttIngress) {
        let actuator = MqttActuator {
            client: self.client.clone(),
        };
        let ingress = MqttIngress {
            client: self.client,
            eventloop: self.eventloop,
            monitor_topic: self.monitor_topic,
            backlog: self.backlog,
            reconnect_backoff: self.reconnect_backoff,
            disconnect_grace: self.disconnect_grace,
            metrics: IngressMetrics::default(),
        };
        (actuator, ingress)
    }
}

async fn handshake(eventloop: &mut EventLoop, topic: &str) -> Result<Vec<TelemetryEvent>> {
    let mut backlog = Vec::new();
    loop {
        match eventloop.poll().await? {
            Event::Incoming(Packet::ConnAck(ack)) => {
                debug!(session_present = ack.session_present, "broker accepted connection");
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                if subscription_refused(&ack) {
                    return Err(MessagingError::SubscriptionRejected {
                        topic: topic.to_owned(),
                    });
                }
                return Ok(backlog);
            }
            // Retained messages may race the SUBACK; keep them.
            Event::Incoming(Packet::Publish(publish)) => {
                backlog.push(TelemetryEvent::new(publish.topic, publish.payload));
            }
            _ => {}
        }
    }
}

fn subscription_refused(ack: &SubAck) -> bool {
    ack.return_codes
        .iter()
        .any(|code| matches!(code, SubscribeReasonCode::Failure))
}

/// Publishes relay commands through the shared MQTT client.
#[derive(Clone)]
pub struct MqttActuator {
    client: AsyncClient,
}

#[async_trait]
impl ActuatorPort for MqttActuator {
    async fn set_power(&self, topic: &str, state: PowerState) -> Result<()> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, state.as_payload())
            .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}

/// Drives the MQTT event loop and forwards every PUBLISH to the detector.
pub struct MqttIngress {
    client: AsyncClient,
    eventloop: EventLoop,
    monitor_topic: String,
    backlog: Vec<TelemetryEvent>,
    reconnect_backoff: Duration,
    disconnect_grace: Duration,
    metrics: IngressMetrics,
}

impl MqttIngress {
    /// Run until `shutdown` fires or the consumer drops its receiver, then
    /// disconnect with a bounded grace period for in-flight publishes.
    ///
    /// Forwarding awaits channel capacity, so a slow consumer stalls the event
    /// loop rather than dropping telemetry.
    pub async fn run(
        mut self,
        sink: mpsc::Sender<TelemetryEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> IngressMetrics {
        for event in std::mem::take(&mut self.backlog) {
            self.metrics.received += 1;
            if sink.send(event).await.is_err() {
                warn!("telemetry consumer closed before ingress started");
                self.disconnect().await;
                return self.metrics;
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("ingress shutdown signal received");
                    break;
                }
                polled = self.eventloop.poll() => match polled {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.metrics.received += 1;
                        let event = TelemetryEvent::new(publish.topic, publish.payload);
                        if sink.send(event).await.is_err() {
                            warn!("telemetry consumer closed; stopping ingress");
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // The initial CONNACK was consumed by the handshake.
                        self.metrics.reconnects += 1;
                        info!(reconnects = self.metrics.reconnects, "reconnected to broker");
                        if let Err(err) = self.client.try_subscribe(self.monitor_topic.clone(), QoS::AtMostOnce) {
                            error!(topic = %self.monitor_topic, error = %err, "re-subscribe failed");
                        }
                    }
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        if subscription_refused(&ack) {
                            error!(topic = %self.monitor_topic, "broker rejected re-subscription");
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        self.metrics.errors += 1;
                        error!(error = %err, backoff = ?self.reconnect_backoff, "mqtt event loop error");
                        tokio::select! {
                            _ = shutdown.recv() => break,
                            _ = tokio::time::sleep(self.reconnect_backoff) => {}
                        }
                    }
                },
            }
        }

        self.disconnect().await;
        info!(
            received = self.metrics.received,
            reconnects = self.metrics.reconnects,
            errors = self.metrics.errors,
            "ingress stopped"
        );
        self.metrics
    }

    async fn disconnect(&mut self) {
        if let Err(err) = self.client.try_disconnect() {
            warn!(error = %err, "unable to queue disconnect");
            return;
        }
        let eventloop = &mut self.eventloop;
        let drain = async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if timeout(self.disconnect_grace, drain).await.is_err() {
            debug!(grace = ?self.disconnect_grace, "disconnect grace period elapsed");
        }
    }
}
