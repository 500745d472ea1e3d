//! Long-lived upstream event stream
//!
//! `SseBridge::stream` opens one connection to the upstream events endpoint,
//! decodes frames into `Event`s and pushes them onto a bounded channel. When
//! the connection is lost it sends a single `StreamItem::Disconnected` and
//! returns; reconnecting is the caller's decision (see `supervisor`).
//!
//! A connection that delivers no bytes for `idle_timeout` counts as lost.
//! Upstream sends a KEEP-ALIVE frame roughly every 55 seconds, so a silent
//! half-open connection is detected within the default bound.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use homeconnect_auth::TokenManager;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONNECTION};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::event::StreamItem;
use crate::sse::SseDecoder;

/// How a single `stream` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Connection lost; a `Disconnected` item was delivered.
    Disconnected,
    /// Cancelled by the owner. Nothing was reported on the channel.
    Cancelled,
    /// The receiving side is gone.
    ChannelClosed,
}

/// Longest silence tolerated on an open stream.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Opens the upstream event stream with a bearer token from the shared
/// `TokenManager`.
pub struct SseBridge {
    client: reqwest::Client,
    events_url: String,
    tokens: Arc<TokenManager>,
    idle_timeout: Duration,
}

impl SseBridge {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        events_path: &str,
        tokens: Arc<TokenManager>,
    ) -> Self {
        Self {
            client,
            events_url: format!("{}{}", base_url.trim_end_matches('/'), events_path),
            tokens,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn events_url(&self) -> &str {
        &self.events_url
    }

    /// Run one stream connection until it is lost or `cancel` fires.
    pub async fn stream(
        &self,
        out: &mpsc::Sender<StreamItem>,
        cancel: &CancellationToken,
    ) -> StreamEnd {
        let reason = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("event stream cancelled");
                return StreamEnd::Cancelled;
            }
            reason = self.pump(out) => reason,
        };

        if matches!(reason, Error::ChannelClosed) {
            return StreamEnd::ChannelClosed;
        }

        warn!(error = %reason, url = %self.events_url, "event stream lost");
        metrics::counter!("bridge_stream_disconnects_total").increment(1);
        tokio::select! {
            _ = cancel.cancelled() => StreamEnd::Cancelled,
            sent = out.send(StreamItem::Disconnected(reason)) => match sent {
                Ok(()) => StreamEnd::Disconnected,
                Err(_) => StreamEnd::ChannelClosed,
            },
        }
    }

    /// Connect and forward events until the connection ends. Always returns
    /// the reason it stopped.
    async fn pump(&self, out: &mpsc::Sender<StreamItem>) -> Error {
        let token = match self.tokens.get_valid_token().await {
            Ok(t) => t,
            Err(e) => return Error::Token(e),
        };

        let response = match self
            .client
            .get(&self.events_url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .header(CONNECTION, "keep-alive")
            .bearer_auth(&token.access_token)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return Error::StreamDisconnected(format!("connect failed: {e}")),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Error::Upstream {
                status: status.as_u16(),
                body,
            };
        }
        info!(url = %self.events_url, "event stream connected");

        let mut decoder = SseDecoder::new();
        let mut body = response.bytes_stream();
        loop {
            let chunk = match tokio::time::timeout(self.idle_timeout, body.next()).await {
                Ok(Some(Ok(c))) => c,
                Ok(Some(Err(e))) => {
                    return Error::StreamDisconnected(format!("read failed: {e}"));
                }
                Ok(None) => break,
                Err(_) => {
                    return Error::StreamDisconnected(format!(
                        "idle timeout, no data for {:?}",
                        self.idle_timeout
                    ));
                }
            };
            for event in decoder.feed(&chunk) {
                debug!(
                    equipment_id = %event.equipment_id,
                    event_name = %event.event_name,
                    "event received"
                );
                if out.send(StreamItem::Event(event)).await.is_err() {
                    return Error::ChannelClosed;
                }
            }
        }
        Error::StreamDisconnected("end of stream".into())
    }
}
