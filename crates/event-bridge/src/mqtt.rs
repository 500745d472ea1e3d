//! MQTT transport for republished events
//!
//! One persistent `AsyncClient` per process. rumqttc only makes progress
//! while its `EventLoop` is polled, so `MqttBus::connect` spawns a task that
//! polls it until cancelled; a failed poll is retried after a short pause,
//! which is how rumqttc reconnects.
//!
//! `publish` waits for room in the client's request queue. While the broker
//! is unreachable the queue fills and publishes block, which holds the
//! dispatcher's permits and backpressures the event stream. A publish still
//! waiting after `publish_timeout` fails with `Error::Publish`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rumqttc::{AsyncClient, Event as MqttEvent, EventLoop, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::publisher::MessageBus;

/// Requests buffered between `publish` and the event loop.
const REQUEST_CAPACITY: usize = 64;

/// Pause after a failed event loop poll before reconnecting.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    /// Longest wait for room in the request queue.
    pub publish_timeout: Duration,
}

/// Publishes with QoS 0, not retained.
pub struct MqttBus {
    client: AsyncClient,
    publish_timeout: Duration,
}

impl MqttBus {
    /// Create the client and start its event loop task. The task stops when
    /// `cancel` fires.
    pub fn connect(settings: &MqttSettings, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let mut options = MqttOptions::new(
            settings.client_id.clone(),
            settings.host.clone(),
            settings.port,
        );
        options.set_keep_alive(settings.keep_alive);

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        info!(
            host = %settings.host,
            port = settings.port,
            client_id = %settings.client_id,
            "MQTT client initialized"
        );
        let handle = tokio::spawn(drive_event_loop(event_loop, cancel));
        (
            Self {
                client,
                publish_timeout: settings.publish_timeout,
            },
            handle,
        )
    }
}

impl MessageBus for MqttBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let queued = self
                .client
                .publish(topic, QoS::AtMostOnce, false, payload.to_vec());
            match tokio::time::timeout(self.publish_timeout, queued).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(Error::Publish(e.to_string())),
                Err(_) => Err(Error::Publish(format!(
                    "request queue still full after {:?}",
                    self.publish_timeout
                ))),
            }
        })
    }
}

async fn drive_event_loop(mut event_loop: EventLoop, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            polled = event_loop.poll() => match polled {
                Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                    info!("connected to MQTT broker");
                }
                Ok(event) => debug!(?event, "mqtt event"),
                Err(e) => {
                    warn!(error = %e, "MQTT connection error, reconnecting");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            },
        }
    }
    debug!("MQTT event loop stopped");
}
