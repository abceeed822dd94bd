//! # MQTT Transport
//!
//! [`Transport`] implementation backed by `rumqttc`.
//!
//! Each session authenticates with the device certificate over TLS (port 8883
//! by default), registers a last-will message, and is driven by one tokio
//! task polling the client event loop. Broker drops are retried with
//! exponential backoff; retries are reported as
//! [`TransportEvent::Reconnecting`] and running out of attempts as
//! [`TransportEvent::ConnectionLost`].

use bytes::Bytes;
use rumqttc::{
    AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS, TlsConfiguration,
    Transport as MqttWire,
};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::transport::{Session, Transport, TransportEvent};
use crate::config::BrokerConfig;
use crate::error::{Result, TelemetryError};
use crate::identity::DeviceIdentity;

/// Exponential backoff between reconnection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failures tolerated before giving up; 0 retries forever.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            min_backoff: Duration::from_millis(config.reconnect_min_backoff_ms),
            max_backoff: Duration::from_millis(config.reconnect_max_backoff_ms),
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Delay before reconnection attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.min_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts != 0 && attempt > self.max_attempts
    }
}

/// Opens TLS MQTT sessions against the configured broker.
#[derive(Debug, Clone)]
pub struct MqttTransport {
    config: BrokerConfig,
    policy: ReconnectPolicy,
}

impl MqttTransport {
    pub fn new(config: BrokerConfig) -> Self {
        let policy = ReconnectPolicy::from_config(&config);
        Self { config, policy }
    }

    fn options(&self, identity: &DeviceIdentity) -> Result<MqttOptions> {
        let ca = fs::read(&self.config.ca_path).map_err(|e| {
            TelemetryError::Connection(format!(
                "Failed to read CA bundle {}: {}",
                self.config.ca_path.display(),
                e
            ))
        })?;

        let mut options = MqttOptions::new(
            identity.device_id.clone(),
            self.config.endpoint.clone(),
            self.config.port,
        );
        options
            .set_keep_alive(self.config.keep_alive())
            .set_last_will(LastWill::new(
                self.config.last_will_topic.clone(),
                self.config.last_will_message.clone(),
                QoS::AtMostOnce,
                false,
            ))
            .set_transport(MqttWire::tls_with_config(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: Some((identity.certificate.clone(), identity.private_key.clone())),
            }));

        Ok(options)
    }
}

impl Transport for MqttTransport {
    fn open(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<(Arc<dyn Session>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let options = self.options(identity)?;
        let (client, eventloop) = AsyncClient::new(options, self.config.request_capacity);
        let (events, rx) = mpsc::unbounded_channel();

        info!(
            "Opening MQTT session to {}:{} as {}",
            self.config.endpoint, self.config.port, identity.device_id
        );
        tokio::spawn(drive(eventloop, events, self.policy));

        Ok((Arc::new(MqttSession { client }), rx))
    }
}

/// Poll the client event loop until the session closes or gives up.
async fn drive(
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<TransportEvent>,
    policy: ReconnectPolicy,
) {
    let mut failures = 0u32;
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                debug!("CONNACK: {:?}", ack.code);
                failures = 0;
                TransportEvent::Connected
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                let _ = events.send(TransportEvent::Closed);
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                failures += 1;
                if policy.exhausted(failures) {
                    warn!("Giving up on broker after {} attempts: {}", failures - 1, e);
                    let _ = events.send(TransportEvent::ConnectionLost {
                        error: Some(e.to_string()),
                    });
                    break;
                }

                let delay = policy.backoff(failures);
                warn!("Broker connection failed ({}); retrying in {:?}", e, delay);
                if events
                    .send(TransportEvent::Reconnecting {
                        error: Some(e.to_string()),
                    })
                    .is_err()
                {
                    break;
                }
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        if events.send(event).is_err() {
            break;
        }
    }

    debug!("MQTT event loop stopped");
}

struct MqttSession {
    client: AsyncClient,
}

impl Session for MqttSession {
    fn try_publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|e| TelemetryError::Publish(e.to_string()))
    }

    fn close(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not queued: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn broker_config() -> BrokerConfig {
        BrokerConfig {
            endpoint: "example-ats.iot.ca-central-1.amazonaws.com".to_string(),
            port: 8883,
            ca_path: PathBuf::from("/nonexistent/AmazonRootCA1.pem"),
            topic: "topic1".to_string(),
            keep_alive_secs: 10,
            last_will_topic: "my/lwt/topic".to_string(),
            last_will_message: "Android client lost connection".to_string(),
            reconnect_min_backoff_ms: 4000,
            reconnect_max_backoff_ms: 64000,
            max_reconnect_attempts: 10,
            request_capacity: 10,
        }
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            device_id: "device-1".to_string(),
            certificate: b"CERT".to_vec(),
            private_key: b"KEY".to_vec(),
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = ReconnectPolicy::from_config(&broker_config());

        assert_eq!(policy.backoff(1), Duration::from_secs(4));
        assert_eq!(policy.backoff(2), Duration::from_secs(8));
        assert_eq!(policy.backoff(4), Duration::from_secs(32));
        assert_eq!(policy.backoff(5), Duration::from_secs(64));
        assert_eq!(policy.backoff(9), Duration::from_secs(64));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(64));
    }

    #[test]
    fn test_attempt_limit() {
        let policy = ReconnectPolicy::from_config(&broker_config());
        assert!(!policy.exhausted(10));
        assert!(policy.exhausted(11));

        let unlimited = ReconnectPolicy {
            max_attempts: 0,
            ..policy
        };
        assert!(!unlimited.exhausted(u32::MAX));
    }

    #[test]
    fn test_missing_ca_bundle_fails_open() {
        let transport = MqttTransport::new(broker_config());
        match transport.options(&identity()) {
            Err(TelemetryError::Connection(msg)) => assert!(msg.contains("AmazonRootCA1.pem")),
            other => panic!("Expected Connection error, got: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_options_carry_device_identity() {
        let dir = tempfile::TempDir::new().unwrap();
        let ca_path = dir.path().join("ca.pem");
        fs::write(&ca_path, "CA").unwrap();

        let mut config = broker_config();
        config.ca_path = ca_path;
        let options = MqttTransport::new(config).options(&identity()).unwrap();

        assert_eq!(options.client_id(), "device-1");
        assert_eq!(
            options.broker_address(),
            ("example-ats.iot.ca-central-1.amazonaws.com".to_string(), 8883)
        );
        assert_eq!(options.keep_alive(), Duration::from_secs(10));

        let will = options.last_will().unwrap();
        assert_eq!(will.qos, QoS::AtMostOnce);
        assert!(!will.retain);
    }
}
