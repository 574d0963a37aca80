//! Transport session contract
//!
//! A transport session is one negotiated peer connection: either the relayed
//! session through the media relay or the direct session to the single other
//! party. The negotiation and ICE machinery live behind this trait; the
//! controller only drives it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;

use crate::error::Result;
use crate::shim::SignalingLayer;
use crate::types::{MediaKind, PartyId, SessionId, TrackId};

/// Negotiation progress of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationState {
    Pending,
    Active,
    Ended,
}

/// Connectivity of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceState {
    #[default]
    New,
    Connected,
    Interrupted,
    Failed,
}

impl From<RTCIceConnectionState> for IceState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => Self::Connected,
            RTCIceConnectionState::Disconnected => Self::Interrupted,
            RTCIceConnectionState::Failed | RTCIceConnectionState::Closed => Self::Failed,
            _ => Self::New,
        }
    }
}

/// Role of a direct session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    Initiator,
    Responder,
}

/// A locally captured track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTrack {
    pub id: TrackId,
    pub kind: MediaKind,
}

impl LocalTrack {
    pub fn new(id: impl Into<TrackId>, kind: MediaKind) -> Self {
        Self { id: id.into(), kind }
    }
}

/// A track received from another party over some session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub id: TrackId,
    pub owner: PartyId,
    pub kind: MediaKind,
}

impl RemoteTrack {
    pub fn new(id: impl Into<TrackId>, owner: impl Into<PartyId>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
            kind,
        }
    }
}

/// Opaque session description exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self { sdp: sdp.into() }
    }
}

/// ICE candidate for connection establishment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u32>,
}

/// Why a session is being terminated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminateReason {
    /// Short machine-readable reason, e.g. `success`, `busy`, `decline`
    pub reason: String,
    pub text: Option<String>,
}

impl TerminateReason {
    pub fn new(reason: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            text: Some(text.into()),
        }
    }

    #[must_use]
    pub fn busy() -> Self {
        Self::new("busy", "direct session already in progress")
    }

    pub fn decline(text: impl Into<String>) -> Self {
        Self::new("decline", text)
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self::new("success", text)
    }
}

/// Media engine options handed to a direct session on initialization
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    pub ice_servers: Vec<String>,
}

/// One negotiated transport session
#[async_trait]
pub trait TransportSession: Send + Sync {
    fn id(&self) -> SessionId;

    /// The remote party for a direct session
    fn peer_id(&self) -> Option<PartyId>;

    fn is_initiator(&self) -> bool;

    fn state(&self) -> NegotiationState;

    fn ice_connection_state(&self) -> IceState;

    /// Local tracks currently attached, in attach order
    fn local_tracks(&self) -> Vec<LocalTrack>;

    /// Remote tracks currently visible through this session
    fn remote_tracks(&self) -> Vec<RemoteTrack>;

    /// Prepare the session. Must not send anything to the remote side yet.
    fn initialize(
        &self,
        is_initiator: bool,
        signaling: Arc<dyn SignalingLayer>,
        options: SessionOptions,
    ) -> Result<()>;

    /// Start negotiation as initiator
    async fn invite(&self) -> Result<()>;

    /// Accept a remote offer as responder
    async fn accept_offer(&self, offer: SessionDescription) -> Result<()>;

    async fn set_answer(&self, answer: SessionDescription) -> Result<()>;

    async fn add_ice_candidates(&self, candidates: Vec<IceCandidate>) -> Result<()>;

    /// Add tracks to a session that has not negotiated yet
    async fn add_local_tracks(&self, tracks: Vec<LocalTrack>) -> Result<()>;

    /// Hook tracks back into the media engine without renegotiating
    async fn attach_local_tracks(&self, tracks: Vec<LocalTrack>) -> Result<()>;

    /// Remove tracks from the media engine without telling the remote side
    async fn detach_local_tracks(&self, tracks: Vec<LocalTrack>) -> Result<()>;

    async fn replace_track(&self, old: Option<LocalTrack>, new: Option<LocalTrack>) -> Result<()>;

    async fn add_track_as_unmute(&self, track: LocalTrack) -> Result<()>;

    async fn remove_track_as_mute(&self, track: LocalTrack) -> Result<()>;

    async fn terminate(&self, reason: TerminateReason) -> Result<()>;
}

/// Creates fresh direct sessions for the controller to initiate
pub trait SessionFactory: Send + Sync {
    /// Build a session identified by `id`, which the controller assigns so it
    /// can route signaling before negotiation starts.
    fn create_direct_session(
        &self,
        id: SessionId,
        peer: &PartyId,
    ) -> Result<Arc<dyn TransportSession>>;
}
