//! Connection-state event filter
//!
//! Decorates the outward [`EventSink`]. While one transport is active, the
//! other one keeps running in the background and its health fluctuations
//! must not reach subscribers, so interrupted/restored notifications whose
//! origin is not the active transport are dropped here.

use tokio::sync::watch;
use tracing::debug;

use crate::controller::ControllerSnapshot;
use crate::events::{ConferenceEvent, EventSink, Notification};

pub struct EventFilter<S> {
    inner: S,
    state: watch::Receiver<ControllerSnapshot>,
}

impl<S: EventSink> EventFilter<S> {
    pub const fn new(inner: S, state: watch::Receiver<ControllerSnapshot>) -> Self {
        Self { inner, state }
    }

    fn should_suppress(&self, notification: &Notification) -> bool {
        if !matches!(
            notification.event,
            ConferenceEvent::ConnectionInterrupted | ConferenceEvent::ConnectionRestored
        ) {
            return false;
        }
        match notification.origin {
            Some(origin) => !self.state.borrow().active_transport.is(origin),
            None => false,
        }
    }
}

impl<S: EventSink> EventSink for EventFilter<S> {
    fn emit(&self, notification: Notification) {
        if self.should_suppress(&notification) {
            debug!(
                event = notification.event.name(),
                origin = ?notification.origin,
                active = ?self.state.borrow().active_transport,
                "Suppressing connection event from inactive transport"
            );
            return;
        }
        self.inner.emit(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::RemoteTrack;
    use crate::test_support::RecordingSink;
    use crate::types::{ActiveTransport, MediaKind, TransportKind};
    use std::sync::Arc;

    type Fixture = (
        EventFilter<Arc<RecordingSink>>,
        Arc<RecordingSink>,
        watch::Sender<ControllerSnapshot>,
    );

    fn filter_with(active: ActiveTransport) -> Fixture {
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = watch::channel(ControllerSnapshot {
            active_transport: active,
            ..Default::default()
        });
        (EventFilter::new(Arc::clone(&sink), rx), sink, tx)
    }

    fn relayed(event: ConferenceEvent) -> Notification {
        Notification::from_transport(TransportKind::Relayed, event)
    }

    fn direct(event: ConferenceEvent) -> Notification {
        Notification::from_transport(TransportKind::Direct, event)
    }

    #[test]
    fn test_suppresses_inactive_origin() {
        let (filter, sink, _tx) = filter_with(ActiveTransport::Direct);

        filter.emit(relayed(ConferenceEvent::ConnectionInterrupted));
        filter.emit(relayed(ConferenceEvent::ConnectionRestored));
        assert!(sink.events().is_empty());

        filter.emit(direct(ConferenceEvent::ConnectionInterrupted));
        assert_eq!(sink.events(), vec![ConferenceEvent::ConnectionInterrupted]);
    }

    #[test]
    fn test_symmetric_while_relayed() {
        let (filter, sink, _tx) = filter_with(ActiveTransport::Relayed);

        filter.emit(direct(ConferenceEvent::ConnectionInterrupted));
        assert!(sink.events().is_empty());

        filter.emit(relayed(ConferenceEvent::ConnectionInterrupted));
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn test_other_events_pass() {
        let (filter, sink, _tx) = filter_with(ActiveTransport::Direct);
        let track = RemoteTrack::new("t1", "9", MediaKind::Audio);

        filter.emit(relayed(ConferenceEvent::ConnectionFailed));
        filter.emit(relayed(ConferenceEvent::RemoteTrackRemoved { track }));
        filter.emit(Notification::new(None, ConferenceEvent::DirectStatusChanged { active: true }));
        assert_eq!(sink.events().len(), 3);
    }

    #[test]
    fn test_follows_state_changes() {
        let (filter, sink, tx) = filter_with(ActiveTransport::Relayed);

        tx.send_modify(|s| s.active_transport = ActiveTransport::Direct);
        filter.emit(relayed(ConferenceEvent::ConnectionRestored));
        assert!(sink.events().is_empty());
    }
}
