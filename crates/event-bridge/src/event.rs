//! Typed events carried from the upstream stream to the message bus

use crate::error::Error;

/// One decoded upstream event.
///
/// `payload` is the raw `data` value; it is republished as-is without being
/// parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub equipment_id: String,
    pub event_name: String,
    pub payload: String,
}

/// What travels on the bridge → publisher channel.
#[derive(Debug)]
pub enum StreamItem {
    Event(Event),
    /// Terminal notice for one stream connection. Sent at most once per
    /// `SseBridge::stream` call.
    Disconnected(Error),
}
