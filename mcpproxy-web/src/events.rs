//! Server-Sent-Events bus
//!
//! Components publish change events onto named channels; `/events` clients
//! receive them as `event:<channel>` / `data:<json>` frames.

use axum::response::sse::{self, Sse};
use futures_util::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Known event channels
pub mod channels {
    pub const SERVER_STATUS: &str = "server_status";
    pub const ACTIVITY: &str = "activity";
    pub const ACTIVITY_COMPLETED: &str = "activity-completed";
    pub const FLOW_ALERT: &str = "flow.alert";
    pub const OAUTH: &str = "oauth";
    pub const CONFIG: &str = "config";
}

/// One event on the bus
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Channel name
    pub channel: String,

    /// Event payload
    pub data: Value,
}

/// Broadcast bus feeding the SSE endpoint
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(512);
        Self { tx }
    }

    /// Publish an event; silently dropped when nobody listens
    pub fn publish(&self, channel: &str, data: Value) {
        let _ = self.tx.send(Event {
            channel: channel.to_string(),
            data,
        });
    }

    /// Subscribe to the raw event stream
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// SSE response streaming all events to one client
    pub fn sse_stream(
        &self,
    ) -> Sse<impl Stream<Item = Result<sse::Event, std::convert::Infallible>>> {
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(|event| {
            // Lagged receivers skip missed events rather than erroring out
            let event = event.ok()?;
            let data = serde_json::to_string(&event.data).ok()?;
            Some(Ok(sse::Event::default().event(event.channel).data(data)))
        });

        Sse::new(stream).keep_alive(sse::KeepAlive::default())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(channels::SERVER_STATUS, json!({"server": "fs", "state": "ready"}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.channel, "server_status");
        assert_eq!(event.data["server"], "fs");
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(channels::ACTIVITY, json!({}));
    }
}
