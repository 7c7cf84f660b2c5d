//! Session events and two-tier delivery
//!
//! Every observable transition is a tagged [`SessionEvent`] fanned out on a
//! broadcast channel. Application messages are additionally delivered on a
//! per-channel broadcast sender keyed by channel name, always after the
//! general `Message` emission.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::Error;

/// Events emitted by a pub/sub session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A connection was established.
    Connected,
    /// The session was closed by the caller.
    Closed,
    /// The driver reported the connection as gone.
    Ended,
    /// A `LISTEN` took effect for the channel.
    Listen(String),
    /// `UNLISTEN` took effect; carries the channels that were unlistened.
    Unlisten(Vec<String>),
    /// A reconnect cycle completed; carries the attempt count it took.
    Reconnected(u32),
    /// An application message arrived on a subscribed channel.
    Message { channel: String, payload: Value },
    /// A failure observed outside any caller's request.
    Error(Arc<Error>),
}

/// General plus per-channel event fan-out.
pub(crate) struct EventHub {
    events: broadcast::Sender<SessionEvent>,
    channels: DashMap<String, broadcast::Sender<Value>>,
    capacity: usize,
}

impl EventHub {
    pub(crate) fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            events,
            channels: DashMap::new(),
            capacity,
        }
    }

    /// Subscribe to the general event stream.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Subscribe to one channel's payload stream, creating it on demand.
    pub(crate) fn channel(&self, name: &str) -> broadcast::Receiver<Value> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Emit a general event. Fire and forget when nobody is listening.
    pub(crate) fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("no receivers for session event");
        }
    }

    pub(crate) fn emit_error(&self, error: Error) {
        self.emit(SessionEvent::Error(Arc::new(error)));
    }

    /// Deliver an application message: general emission first, then the
    /// per-channel sender.
    pub(crate) fn emit_message(&self, channel: &str, payload: Value) {
        self.emit(SessionEvent::Message {
            channel: channel.to_string(),
            payload: payload.clone(),
        });

        let gone = if let Some(sender) = self.channels.get(channel) {
            sender.send(payload).is_err() && sender.receiver_count() == 0
        } else {
            false
        };

        // Drop senders whose last receiver went away
        if gone {
            self.channels.remove(channel);
            debug!(channel, "removed idle channel emitter");
        }
    }

    /// Drop every per-channel sender. Existing receivers observe `Closed`.
    pub(crate) fn clear(&self) {
        self.channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_emit_without_receivers() {
        let hub = EventHub::new(4);
        // No receivers - should not panic
        hub.emit(SessionEvent::Connected);
        hub.emit_message("orders", json!({"id": 1}));
    }

    #[tokio::test]
    async fn test_general_then_per_channel_delivery() {
        let hub = EventHub::new(16);
        let mut events = hub.subscribe();
        let mut orders = hub.channel("orders");

        hub.emit_message("orders", json!({"id": 7}));

        match events.recv().await.unwrap() {
            SessionEvent::Message { channel, payload } => {
                assert_eq!(channel, "orders");
                assert_eq!(payload, json!({"id": 7}));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(orders.recv().await.unwrap(), json!({"id": 7}));
    }

    #[tokio::test]
    async fn test_unrelated_channel_receives_nothing() {
        let hub = EventHub::new(16);
        let mut jobs = hub.channel("jobs");

        hub.emit_message("orders", json!(1));

        assert!(matches!(
            jobs.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_idle_channel_emitter_cleanup() {
        let hub = EventHub::new(16);
        drop(hub.channel("orders"));
        assert_eq!(hub.channels.len(), 1);

        hub.emit_message("orders", json!(1));
        assert_eq!(hub.channels.len(), 0);

        // Resubscribing recreates the sender
        let _rx = hub.channel("orders");
        assert_eq!(hub.channels.len(), 1);
    }
}
