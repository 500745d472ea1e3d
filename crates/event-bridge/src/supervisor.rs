//! Reconnect supervision for the event stream
//!
//! Pure state machine: receives events, returns (new_state, action).
//! `run_supervised` executes the I/O implied by each action.
//!
//! Every lost stream is followed by a backoff of `2^attempt` seconds, capped
//! at 60 s. A stream that stayed up for at least a minute resets the
//! attempt counter. Retries never give up; only shutdown stops the loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bridge::{SseBridge, StreamEnd};
use crate::event::StreamItem;

/// Upper bound for the reconnect delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// A stream that lasted this long counts as healthy.
pub const STABLE_STREAM: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// A stream connection is open (or being opened).
    Streaming { attempt: u32 },
    /// Waiting before the next connection.
    Backoff { attempt: u32 },
    /// Terminal state
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEvent {
    /// The stream reported a disconnect after being up for `uptime`.
    StreamEnded { uptime: Duration },
    BackoffElapsed,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeAction {
    /// Open a new stream connection
    Connect,
    Wait(Duration),
    Stop,
    /// No-op
    None,
}

/// Reconnect delay for the given attempt.
pub fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(state: BridgeState, event: BridgeEvent) -> (BridgeState, BridgeAction) {
    match (state, event) {
        (_, BridgeEvent::Shutdown) => (BridgeState::Stopped, BridgeAction::Stop),

        (BridgeState::Streaming { attempt }, BridgeEvent::StreamEnded { uptime }) => {
            let attempt = if uptime >= STABLE_STREAM { 0 } else { attempt };
            (
                BridgeState::Backoff {
                    attempt: attempt.saturating_add(1),
                },
                BridgeAction::Wait(backoff_delay(attempt)),
            )
        }

        (BridgeState::Backoff { attempt }, BridgeEvent::BackoffElapsed) => {
            (BridgeState::Streaming { attempt }, BridgeAction::Connect)
        }

        // Invalid/unhandled transition: stay in current state
        (state, _event) => (state, BridgeAction::None),
    }
}

/// Keep the event stream open until `cancel` fires, reconnecting with
/// backoff after every disconnect.
pub async fn run_supervised(
    bridge: Arc<SseBridge>,
    out: mpsc::Sender<StreamItem>,
    cancel: CancellationToken,
) {
    let mut state = BridgeState::Streaming { attempt: 0 };
    let mut action = BridgeAction::Connect;

    loop {
        let event = match action {
            BridgeAction::Connect => {
                let started = Instant::now();
                match bridge.stream(&out, &cancel).await {
                    StreamEnd::Disconnected => BridgeEvent::StreamEnded {
                        uptime: started.elapsed(),
                    },
                    StreamEnd::Cancelled | StreamEnd::ChannelClosed => BridgeEvent::Shutdown,
                }
            }
            BridgeAction::Wait(delay) => {
                info!(delay_secs = delay.as_secs(), "reconnecting event stream after backoff");
                tokio::select! {
                    _ = cancel.cancelled() => BridgeEvent::Shutdown,
                    _ = tokio::time::sleep(delay) => BridgeEvent::BackoffElapsed,
                }
            }
            BridgeAction::Stop | BridgeAction::None => break,
        };
        (state, action) = handle_event(state, event);
    }

    info!(?state, "event stream supervisor stopped");
}
