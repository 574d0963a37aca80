//! Signaling shim for direct sessions
//!
//! A direct session needs a handful of room capabilities (presence listeners
//! and the cached media presence of the remote party) plus somewhere to
//! report its connectivity. [`SignalingShim`] provides exactly that without
//! handing the session the live room object, and turns the session's events
//! into controller commands.

use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::controller::Command;
use crate::error::{Error, Result};
use crate::events::ConnectivityEvent;
use crate::room::{MediaPresence, PresenceListener, Room};
use crate::types::{MediaKind, PartyId, SessionId};

/// Events a transport session reports through its signaling layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Local description is ready to be sent
    NegotiationReady,
    ConnectionEstablished,
    ConnectionInterrupted,
    ConnectionRestored,
    ConnectionFailed,
    /// Anything else the session wants to report
    Other(String),
}

/// The room surface a transport session is allowed to see
pub trait SignalingLayer: Send + Sync {
    fn add_presence_listener(&self, name: &str, listener: PresenceListener);

    fn remove_presence_listener(&self, name: &str);

    fn media_presence(&self, party: &PartyId, kind: MediaKind) -> Option<MediaPresence>;

    fn emit(&self, event: SessionEvent);
}

pub struct SignalingShim {
    session_id: SessionId,
    room: RwLock<Option<Weak<dyn Room>>>,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl SignalingShim {
    pub(crate) fn new(
        session_id: SessionId,
        room: &Arc<dyn Room>,
        commands: mpsc::WeakUnboundedSender<Command>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            room: RwLock::new(Some(Arc::downgrade(room))),
            commands,
        })
    }

    /// Cut the shim off from the room. Later calls become logged no-ops.
    pub fn detach(&self) {
        self.room.write().take();
    }

    fn live_room(&self, op: &'static str) -> Result<Arc<dyn Room>> {
        self.room
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                error!(session_id = %self.session_id, op, "Signaling channel is gone");
                Error::Signaling(format!("{op} after the signaling channel was closed"))
            })
    }

    fn forward(&self, event: ConnectivityEvent) {
        let command = Command::DirectConnectivity {
            session_id: self.session_id.clone(),
            event,
        };
        let sent = self
            .commands
            .upgrade()
            .is_some_and(|tx| tx.send(command).is_ok());
        if !sent {
            debug!(
                session_id = %self.session_id,
                ?event,
                "Controller stopped, dropping session event"
            );
        }
    }
}

impl SignalingLayer for SignalingShim {
    fn add_presence_listener(&self, name: &str, listener: PresenceListener) {
        if let Ok(room) = self.live_room("add_presence_listener") {
            room.add_presence_listener(name, listener);
        }
    }

    fn remove_presence_listener(&self, name: &str) {
        if let Ok(room) = self.live_room("remove_presence_listener") {
            room.remove_presence_listener(name);
        }
    }

    fn media_presence(&self, party: &PartyId, kind: MediaKind) -> Option<MediaPresence> {
        self.live_room("media_presence").ok()?.media_presence(party, kind)
    }

    fn emit(&self, event: SessionEvent) {
        match event {
            SessionEvent::ConnectionEstablished => self.forward(ConnectivityEvent::Established),
            SessionEvent::ConnectionInterrupted => self.forward(ConnectivityEvent::Interrupted),
            SessionEvent::ConnectionRestored => self.forward(ConnectivityEvent::Restored),
            SessionEvent::ConnectionFailed => self.forward(ConnectivityEvent::Failed),
            other => {
                trace!(
                    session_id = %self.session_id,
                    event = ?other,
                    "Not forwarding session event"
                );
            }
        }
    }
}
