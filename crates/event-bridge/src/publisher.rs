//! Republishing decoded events onto the message bus
//!
//! Each event goes to `<root_topic>/<equipment_id>/<event_name>` with the
//! raw `data` string as payload. Delivery is at-most-once: a failed publish
//! is logged and counted, never retried here.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::event::{Event, StreamItem};

/// Outbound message transport.
///
/// Uses `Pin<Box<dyn Future>>` return types so publishers can hold an
/// `Arc<dyn MessageBus>`.
pub trait MessageBus: Send + Sync {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Maps events to topics and hands them to the bus.
#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<dyn MessageBus>,
    root_topic: String,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn MessageBus>, root_topic: impl Into<String>) -> Self {
        let root_topic = root_topic.into().trim_end_matches('/').to_string();
        Self { bus, root_topic }
    }

    pub fn topic_for(&self, event: &Event) -> String {
        format!(
            "{}/{}/{}",
            self.root_topic, event.equipment_id, event.event_name
        )
    }

    pub async fn publish(&self, event: &Event) -> Result<()> {
        let topic = self.topic_for(event);
        match self.bus.publish(&topic, event.payload.as_bytes()).await {
            Ok(()) => {
                metrics::counter!("bridge_events_total", "outcome" => "published").increment(1);
                debug!(%topic, "event published");
                Ok(())
            }
            Err(e) => {
                metrics::counter!("bridge_events_total", "outcome" => "failed").increment(1);
                warn!(%topic, error = %e, "event publish failed");
                Err(e)
            }
        }
    }
}

/// Drain the bridge channel, publishing each event on its own task.
///
/// At most `max_in_flight` publishes run at once. A permit is acquired
/// before the next item is received, so a slow bus backpressures the bridge
/// through the bounded channel. Returns after the channel closes and every
/// in-flight publish has finished.
pub async fn run_dispatcher(
    publisher: EventPublisher,
    mut rx: mpsc::Receiver<StreamItem>,
    max_in_flight: usize,
) {
    let permits = Arc::new(Semaphore::new(max_in_flight.max(1)));
    let mut tasks = JoinSet::new();

    loop {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let Some(item) = rx.recv().await else {
            break;
        };

        match item {
            StreamItem::Event(event) => {
                let publisher = publisher.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    // Failure already logged and counted by `publish`
                    let _ = publisher.publish(&event).await;
                });
            }
            StreamItem::Disconnected(reason) => {
                info!(reason = %reason, "event stream disconnected");
            }
        }

        while tasks.try_join_next().is_some() {}
    }

    let pending = tasks.len();
    if pending > 0 {
        debug!(pending, "waiting for in-flight publishes");
    }
    while tasks.join_next().await.is_some() {}
    info!("event dispatcher stopped");
}
