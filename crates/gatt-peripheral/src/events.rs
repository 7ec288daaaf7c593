//! Events published for a user interface
//!
//! Delivery is fire-and-forget: a sink never blocks the server and a
//! missing listener is not an error.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Advertiser on/off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AdvertiserState {
    /// Advertising
    On,
    /// Not advertising
    Off,
}

/// Event for the UI layer
///
/// Serialized as `{"event": "heart-rate", "payload": "72"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum UiEvent {
    /// Advertising turned on or off
    AdvertiserState(AdvertiserState),
    /// Connection log line
    ConnectionState(String),
    /// Formatted timestamp of the last Current Time notification
    CurrentTime(String),
    /// Decimal heart rate of the last measurement notification
    HeartRate(String),
    /// Raw string a central wrote to the model number
    ModelName(String),
}

impl UiEvent {
    /// Event name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            UiEvent::AdvertiserState(_) => "advertiser-state",
            UiEvent::ConnectionState(_) => "connection-state",
            UiEvent::CurrentTime(_) => "current-time",
            UiEvent::HeartRate(_) => "heart-rate",
            UiEvent::ModelName(_) => "model-name",
        }
    }
}

/// Destination for UI events
pub trait EventSink: Send {
    /// Publish an event
    fn emit(&self, event: UiEvent);
}

/// Sink fanning out to any number of `tokio::sync::broadcast` receivers
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<UiEvent>,
}

impl BroadcastSink {
    /// Create a sink buffering up to `capacity` events per receiver
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// New receiver seeing events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: UiEvent) {
        trace!("UI event: {:?}", event);
        // No receivers is fine
        let _ = self.tx.send(event);
    }
}

/// Sink that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: UiEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_string(&UiEvent::HeartRate("72".into())).unwrap();
        assert_eq!(json, r#"{"event":"heart-rate","payload":"72"}"#);

        let json = serde_json::to_string(&UiEvent::AdvertiserState(AdvertiserState::On)).unwrap();
        assert_eq!(json, r#"{"event":"advertiser-state","payload":"ON"}"#);

        let back: UiEvent =
            serde_json::from_str(r#"{"event":"model-name","payload":"Pixel"}"#).unwrap();
        assert_eq!(back, UiEvent::ModelName("Pixel".into()));
        assert_eq!(back.name(), "model-name");
    }

    #[tokio::test]
    async fn test_broadcast_sink() {
        let sink = BroadcastSink::new(8);
        // Emitting without receivers must not fail
        sink.emit(UiEvent::CurrentTime("dropped".into()));

        let mut rx = sink.subscribe();
        sink.emit(UiEvent::ConnectionState("connected to MAC: AA".into()));
        assert_eq!(
            rx.recv().await.unwrap(),
            UiEvent::ConnectionState("connected to MAC: AA".into())
        );
    }
}
