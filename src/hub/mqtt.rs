//! MQTT implementation of the hub sink
//!
//! Publishes each payload to a fixed topic over an MQTT broker. The event
//! loop runs in a background task; publish failures surface through the
//! [`HubSink`] result and drive the sender's retry logic.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, QoS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{HubSendError, HubSink};
use crate::errors::{BridgeError, BridgeResult};

#[derive(Clone, Debug)]
pub struct MqttSinkConfig {
    /// `mqtt://host:port` or `mqtts://host:port`
    pub broker_url: String,
    pub client_id: String,
    pub topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

pub struct MqttHubSink {
    client: AsyncClient,
    topic: String,
}

impl MqttHubSink {
    pub fn connect(config: &MqttSinkConfig, cancel: CancellationToken) -> BridgeResult<Self> {
        let url = Url::parse(&config.broker_url).map_err(|e| {
            BridgeError::Configuration(format!("invalid hub broker URL: {e}"))
        })?;
        let host = url.host_str().ok_or_else(|| {
            BridgeError::Configuration("hub broker URL without host".to_string())
        })?;
        let port = url.port().unwrap_or(1883);

        let mut options = MqttOptions::new(&config.client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);

        let broker = config.broker_url.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = event_loop.poll() => match event {
                        Ok(Event::Incoming(incoming)) => {
                            debug!(?incoming, "hub broker event");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(broker = %broker, error = %e, "hub broker connection error");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
            debug!("hub broker event loop stopped");
        });

        info!(broker = %config.broker_url, topic = %config.topic, "hub sink connected");
        Ok(Self {
            client,
            topic: config.topic.clone(),
        })
    }
}

#[async_trait]
impl HubSink for MqttHubSink {
    async fn send(&self, payload: String) -> Result<(), HubSendError> {
        self.client
            .publish(self.topic.clone(), QoS::AtLeastOnce, false, payload.into_bytes())
            .await
            .map_err(|e| HubSendError::Transport(e.to_string()))
    }
}

/// Fallback sink used when no hub transport is configured: payloads go to
/// the log so a development deployment still shows its output.
pub struct LoggingHubSink;

#[async_trait]
impl HubSink for LoggingHubSink {
    async fn send(&self, payload: String) -> Result<(), HubSendError> {
        info!(payload = %payload, "hub payload");
        Ok(())
    }
}
