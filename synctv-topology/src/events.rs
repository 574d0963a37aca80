//! Outward notifications
//!
//! Everything the controller reports to the outside world (UI, statistics,
//! reconnection logic) goes through an [`EventSink`] as a [`Notification`]:
//! the event itself plus the transport it originated from, if any.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::session::RemoteTrack;
use crate::types::TransportKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConferenceEvent {
    ConnectionEstablished,
    ConnectionInterrupted,
    ConnectionRestored,
    ConnectionFailed,
    RemoteTrackAdded { track: RemoteTrack },
    RemoteTrackRemoved { track: RemoteTrack },
    /// The direct transport became active or stopped being active
    DirectStatusChanged { active: bool },
}

impl ConferenceEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished => "conference.connection_established",
            Self::ConnectionInterrupted => "conference.connection_interrupted",
            Self::ConnectionRestored => "conference.connection_restored",
            Self::ConnectionFailed => "conference.connection_failed",
            Self::RemoteTrackAdded { .. } => "conference.remote_track_added",
            Self::RemoteTrackRemoved { .. } => "conference.remote_track_removed",
            Self::DirectStatusChanged { .. } => "conference.direct_status_changed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Transport the event came from; `None` for controller-level events
    pub origin: Option<TransportKind>,
    pub event: ConferenceEvent,
}

impl Notification {
    #[must_use]
    pub const fn new(origin: Option<TransportKind>, event: ConferenceEvent) -> Self {
        Self { origin, event }
    }

    #[must_use]
    pub const fn from_transport(origin: TransportKind, event: ConferenceEvent) -> Self {
        Self::new(Some(origin), event)
    }
}

/// Connectivity change reported by a transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityEvent {
    Established,
    Interrupted,
    Restored,
    /// Terminal; the transport will not recover on its own
    Failed,
}

impl ConnectivityEvent {
    /// The outward event reporting this change
    #[must_use]
    pub const fn as_conference_event(self) -> ConferenceEvent {
        match self {
            Self::Established => ConferenceEvent::ConnectionEstablished,
            Self::Interrupted => ConferenceEvent::ConnectionInterrupted,
            Self::Restored => ConferenceEvent::ConnectionRestored,
            Self::Failed => ConferenceEvent::ConnectionFailed,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, notification: Notification);
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn emit(&self, notification: Notification) {
        (**self).emit(notification);
    }
}

/// Fans notifications out to any number of subscribers
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastSink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, notification: Notification) {
        let name = notification.event.name();
        // No subscribers is not an error
        if self.tx.send(notification).is_err() {
            trace!(event = name, "No subscribers for notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_sink_fan_out() {
        let sink = BroadcastSink::new(8);
        let mut a = sink.subscribe();
        let mut b = sink.subscribe();

        sink.emit(Notification::from_transport(
            TransportKind::Direct,
            ConferenceEvent::ConnectionRestored,
        ));

        assert_eq!(a.recv().await.unwrap().event, ConferenceEvent::ConnectionRestored);
        assert_eq!(b.recv().await.unwrap().origin, Some(TransportKind::Direct));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let sink = BroadcastSink::new(1);
        sink.emit(Notification::new(None, ConferenceEvent::DirectStatusChanged { active: true }));
    }

    #[test]
    fn test_event_serialization() {
        let event = ConferenceEvent::DirectStatusChanged { active: true };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "direct_status_changed");
        assert_eq!(json["active"], true);
    }
}
