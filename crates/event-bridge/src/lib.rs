//! Upstream event stream → message bus
//!
//! Opens the vendor's server-sent event stream with a bearer token from the
//! shared `TokenManager`, decodes frames into typed `Event`s and republishes
//! each one to `<root_topic>/<equipment_id>/<event_name>`.
//!
//! Pipeline:
//! 1. `supervisor::run_supervised` keeps an `SseBridge` connected, with backoff
//! 2. `SseBridge::stream` pushes `StreamItem`s onto a bounded channel
//! 3. `publisher::run_dispatcher` drains the channel with bounded concurrency
//! 4. `EventPublisher` hands each event to a `MessageBus` (MQTT in production)

pub mod bridge;
pub mod error;
pub mod event;
pub mod mqtt;
pub mod publisher;
pub mod recording;
pub mod sse;
pub mod supervisor;

pub use bridge::{SseBridge, StreamEnd};
pub use error::{Error, Result};
pub use event::{Event, StreamItem};
pub use mqtt::{MqttBus, MqttSettings};
pub use publisher::{EventPublisher, MessageBus, run_dispatcher};
pub use recording::RecordingBus;
pub use sse::SseDecoder;
pub use supervisor::run_supervised;
