//! In-memory bus that records every publish

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::publisher::MessageBus;

/// `MessageBus` double for tests and dry runs.
///
/// Optionally delays each publish (to observe concurrency) or fails every
/// publish.
#[derive(Default)]
pub struct RecordingBus {
    messages: Mutex<Vec<(String, Vec<u8>)>>,
    delay: Option<Duration>,
    fail: bool,
    attempts: AtomicUsize,
    in_flight: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Successfully published `(topic, payload)` pairs, in completion order.
    pub fn messages(&self) -> Vec<(String, Vec<u8>)> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Highest number of publishes observed running at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

impl MessageBus for RecordingBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                return Err(Error::Publish(format!("bus rejected {topic}")));
            }
            self.messages
                .lock()
                .map_err(|_| Error::Publish("recording bus poisoned".into()))?
                .push((topic.to_string(), payload.to_vec()));
            Ok(())
        })
    }
}
