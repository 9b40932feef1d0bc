// Gateway events
//
// Everything the core announces to the downstream surface. Subscribers get
// a broadcast receiver; events dropped by slow subscribers are lost, which
// matches the best-effort nature of the protocol.

use serde::Serialize;
use tokio::sync::broadcast;

/// Capacity of the event fan-out channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    Connected {
        router: String,
    },
    Disconnected {
        router: String,
    },
    TellReceived {
        from_mud: String,
        from_user: String,
        to_user: String,
        visname: String,
        message: String,
    },
    EmotetoReceived {
        from_mud: String,
        from_user: String,
        to_user: String,
        visname: String,
        message: String,
    },
    ChannelMessage {
        channel: String,
        from_mud: String,
        from_user: String,
        visname: String,
        message: String,
    },
    ChannelEmote {
        channel: String,
        from_mud: String,
        from_user: String,
        visname: String,
        message: String,
    },
    ChannelJoin {
        channel: String,
        mud: String,
    },
    ChannelLeave {
        channel: String,
        mud: String,
    },
    WhoRequest {
        from_mud: String,
        from_user: String,
    },
    FingerRequest {
        from_mud: String,
        from_user: String,
        target_user: String,
    },
    LocateRequest {
        from_mud: String,
        from_user: String,
        target_user: String,
    },
}

/// Fan-out bus for gateway events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GatewayEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish an event; subscribers that lag simply miss it
    pub fn emit(&self, event: GatewayEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(GatewayEvent::Connected {
            router: "*i3".to_string(),
        });
        match rx.recv().await.unwrap() {
            GatewayEvent::Connected { router } => assert_eq!(router, "*i3"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.emit(GatewayEvent::Disconnected {
            router: "*i3".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = GatewayEvent::TellReceived {
            from_mud: "MudA".to_string(),
            from_user: "alice".to_string(),
            to_user: "bob".to_string(),
            visname: "Alice".to_string(),
            message: "hi".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "tell_received");
        assert_eq!(json["from_mud"], "MudA");
    }
}
