//! Room/roster contract consumed by the controller

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::session::LocalTrack;
use crate::types::{MediaKind, Party, PartyId, PartyRole};

/// Presence update delivered to a named listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub party: PartyId,
    pub payload: serde_json::Value,
}

pub type PresenceListener = Arc<dyn Fn(&PresenceUpdate) + Send + Sync>;

/// Cached media presence a party advertised for one media kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPresence {
    pub muted: bool,
    pub video_type: Option<String>,
}

pub trait Room: Send + Sync {
    fn local_id(&self) -> PartyId;

    fn local_role(&self) -> PartyRole;

    /// Every party in the room except the local one
    fn parties(&self) -> Vec<Party>;

    /// Local tracks that should be sent on whichever transport is active
    fn local_tracks(&self) -> Vec<LocalTrack>;

    fn add_presence_listener(&self, name: &str, listener: PresenceListener);

    fn remove_presence_listener(&self, name: &str);

    fn media_presence(&self, party: &PartyId, kind: MediaKind) -> Option<MediaPresence>;
}
