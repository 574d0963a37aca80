//! In-memory collaborators for driving the controller in tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::events::{ConferenceEvent, EventSink, Notification};
use crate::room::{MediaPresence, PresenceListener, Room};
use crate::session::{
    IceCandidate, IceState, LocalTrack, NegotiationState, RemoteTrack, SessionDescription,
    SessionFactory, SessionOptions, SessionRole, TerminateReason, TransportSession,
};
use crate::shim::{SessionEvent, SignalingLayer};
use crate::stats::StatsSink;
use crate::types::{MediaKind, Party, PartyId, PartyRole, SessionId, TransportKind};

pub struct FakeRoom {
    local_id: PartyId,
    role: Mutex<PartyRole>,
    parties: Mutex<Vec<Party>>,
    local_tracks: Mutex<Vec<LocalTrack>>,
    listeners: Mutex<Vec<String>>,
    presence: Mutex<HashMap<(PartyId, MediaKind), MediaPresence>>,
}

impl FakeRoom {
    pub fn new(local_id: &str, role: PartyRole) -> Self {
        Self {
            local_id: PartyId::from(local_id),
            role: Mutex::new(role),
            parties: Mutex::new(Vec::new()),
            local_tracks: Mutex::new(vec![
                LocalTrack::new("local-audio", MediaKind::Audio),
                LocalTrack::new("local-video", MediaKind::Video),
            ]),
            listeners: Mutex::new(Vec::new()),
            presence: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_role(&self, role: PartyRole) {
        *self.role.lock() = role;
    }

    pub fn add_party(&self, id: &str, role: PartyRole) {
        self.parties.lock().push(Party::new(id, role));
    }

    pub fn remove_party(&self, id: &str) {
        self.parties.lock().retain(|p| p.id.as_str() != id);
    }

    pub fn set_local_tracks(&self, tracks: Vec<LocalTrack>) {
        *self.local_tracks.lock() = tracks;
    }

    pub fn set_media_presence(&self, party: &str, kind: MediaKind, presence: MediaPresence) {
        self.presence.lock().insert((PartyId::from(party), kind), presence);
    }

    pub fn presence_listeners(&self) -> Vec<String> {
        self.listeners.lock().clone()
    }
}

impl Room for FakeRoom {
    fn local_id(&self) -> PartyId {
        self.local_id.clone()
    }

    fn local_role(&self) -> PartyRole {
        *self.role.lock()
    }

    fn parties(&self) -> Vec<Party> {
        self.parties.lock().clone()
    }

    fn local_tracks(&self) -> Vec<LocalTrack> {
        self.local_tracks.lock().clone()
    }

    fn add_presence_listener(&self, name: &str, _listener: PresenceListener) {
        self.listeners.lock().push(name.to_string());
    }

    fn remove_presence_listener(&self, name: &str) {
        self.listeners.lock().retain(|n| n != name);
    }

    fn media_presence(&self, party: &PartyId, kind: MediaKind) -> Option<MediaPresence> {
        self.presence.lock().get(&(party.clone(), kind)).cloned()
    }
}

/// Calls recorded by [`FakeSession`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    Initialize { initiator: bool },
    Invite,
    AcceptOffer(String),
    SetAnswer(String),
    AddIceCandidates(usize),
    AddLocalTracks(usize),
    AttachLocalTracks(usize),
    DetachLocalTracks(usize),
    ReplaceTrack,
    AddTrackAsUnmute,
    RemoveTrackAsMute,
    Terminate(TerminateReason),
}

pub struct FakeSession {
    id: SessionId,
    peer: Option<PartyId>,
    initiator: AtomicBool,
    state: Mutex<NegotiationState>,
    ice: Mutex<IceState>,
    local_tracks: Mutex<Vec<LocalTrack>>,
    remote_tracks: Mutex<Vec<RemoteTrack>>,
    calls: Mutex<Vec<SessionCall>>,
    signaling: Mutex<Option<Arc<dyn SignalingLayer>>>,
    options: Mutex<Option<SessionOptions>>,
    fail_track_ops: AtomicBool,
    fail_initialize: AtomicBool,
    hold: Mutex<Option<Arc<Notify>>>,
}

impl FakeSession {
    fn build(id: &str, peer: Option<PartyId>) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::from(id),
            peer,
            initiator: AtomicBool::new(false),
            state: Mutex::new(NegotiationState::Pending),
            ice: Mutex::new(IceState::New),
            local_tracks: Mutex::new(Vec::new()),
            remote_tracks: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            signaling: Mutex::new(None),
            options: Mutex::new(None),
            fail_track_ops: AtomicBool::new(false),
            fail_initialize: AtomicBool::new(false),
            hold: Mutex::new(None),
        })
    }

    pub fn relayed(id: &str) -> Arc<Self> {
        let session = Self::build(id, None);
        *session.state.lock() = NegotiationState::Active;
        session
    }

    pub fn direct(id: &str, peer: &str) -> Arc<Self> {
        Self::build(id, Some(PartyId::from(peer)))
    }

    pub fn calls(&self) -> Vec<SessionCall> {
        self.calls.lock().clone()
    }

    pub fn has_call(&self, call: &SessionCall) -> bool {
        self.calls.lock().contains(call)
    }

    /// Reason of the first terminate call, if any
    pub fn terminated_with(&self) -> Option<TerminateReason> {
        self.calls.lock().iter().find_map(|c| match c {
            SessionCall::Terminate(reason) => Some(reason.clone()),
            _ => None,
        })
    }

    pub fn options(&self) -> Option<SessionOptions> {
        self.options.lock().clone()
    }

    pub fn add_remote_track(&self, track: RemoteTrack) {
        self.remote_tracks.lock().push(track);
    }

    pub fn fail_track_ops(&self, fail: bool) {
        self.fail_track_ops.store(fail, Ordering::SeqCst);
    }

    pub fn fail_initialize(&self, fail: bool) {
        self.fail_initialize.store(fail, Ordering::SeqCst);
    }

    /// Make the next local track add/attach/detach wait until
    /// [`Self::release`] is called
    pub fn hold_track_ops(&self) {
        *self.hold.lock() = Some(Arc::new(Notify::new()));
    }

    pub fn release(&self) {
        if let Some(hold) = self.hold.lock().take() {
            hold.notify_one();
        }
    }

    pub fn mark_ended(&self) {
        *self.state.lock() = NegotiationState::Ended;
    }

    /// Report a session event through the signaling layer given on initialize
    pub fn emit(&self, event: SessionEvent) {
        match &event {
            SessionEvent::ConnectionEstablished | SessionEvent::ConnectionRestored => {
                *self.ice.lock() = IceState::Connected;
            }
            SessionEvent::ConnectionInterrupted => *self.ice.lock() = IceState::Interrupted,
            SessionEvent::ConnectionFailed => *self.ice.lock() = IceState::Failed,
            _ => {}
        }
        let signaling = self.signaling.lock().clone();
        if let Some(signaling) = signaling {
            signaling.emit(event);
        }
    }

    pub fn signaling(&self) -> Option<Arc<dyn SignalingLayer>> {
        self.signaling.lock().clone()
    }

    fn record(&self, call: SessionCall) {
        self.calls.lock().push(call);
    }

    async fn wait_if_held(&self) {
        let hold = self.hold.lock().clone();
        if let Some(hold) = hold {
            hold.notified().await;
        }
    }

    fn check_track_ops(&self) -> Result<()> {
        if self.fail_track_ops.load(Ordering::SeqCst) {
            return Err(Error::Negotiation("media engine rejected track".to_string()));
        }
        Ok(())
    }

    fn attach(&self, tracks: Vec<LocalTrack>) {
        let mut current = self.local_tracks.lock();
        for track in tracks {
            if !current.contains(&track) {
                current.push(track);
            }
        }
    }
}

#[async_trait]
impl TransportSession for FakeSession {
    fn id(&self) -> SessionId {
        self.id.clone()
    }

    fn peer_id(&self) -> Option<PartyId> {
        self.peer.clone()
    }

    fn is_initiator(&self) -> bool {
        self.initiator.load(Ordering::SeqCst)
    }

    fn state(&self) -> NegotiationState {
        *self.state.lock()
    }

    fn ice_connection_state(&self) -> IceState {
        *self.ice.lock()
    }

    fn local_tracks(&self) -> Vec<LocalTrack> {
        self.local_tracks.lock().clone()
    }

    fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.remote_tracks.lock().clone()
    }

    fn initialize(
        &self,
        is_initiator: bool,
        signaling: Arc<dyn SignalingLayer>,
        options: SessionOptions,
    ) -> Result<()> {
        self.record(SessionCall::Initialize { initiator: is_initiator });
        *self.signaling.lock() = Some(signaling);
        if self.fail_initialize.load(Ordering::SeqCst) {
            return Err(Error::Negotiation("initialization failed".to_string()));
        }
        self.initiator.store(is_initiator, Ordering::SeqCst);
        *self.options.lock() = Some(options);
        Ok(())
    }

    async fn invite(&self) -> Result<()> {
        self.record(SessionCall::Invite);
        Ok(())
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<()> {
        self.record(SessionCall::AcceptOffer(offer.sdp));
        *self.state.lock() = NegotiationState::Active;
        Ok(())
    }

    async fn set_answer(&self, answer: SessionDescription) -> Result<()> {
        self.record(SessionCall::SetAnswer(answer.sdp));
        *self.state.lock() = NegotiationState::Active;
        Ok(())
    }

    async fn add_ice_candidates(&self, candidates: Vec<IceCandidate>) -> Result<()> {
        self.record(SessionCall::AddIceCandidates(candidates.len()));
        Ok(())
    }

    async fn add_local_tracks(&self, tracks: Vec<LocalTrack>) -> Result<()> {
        self.record(SessionCall::AddLocalTracks(tracks.len()));
        self.wait_if_held().await;
        self.check_track_ops()?;
        self.attach(tracks);
        Ok(())
    }

    async fn attach_local_tracks(&self, tracks: Vec<LocalTrack>) -> Result<()> {
        self.record(SessionCall::AttachLocalTracks(tracks.len()));
        self.wait_if_held().await;
        self.check_track_ops()?;
        self.attach(tracks);
        Ok(())
    }

    async fn detach_local_tracks(&self, tracks: Vec<LocalTrack>) -> Result<()> {
        self.record(SessionCall::DetachLocalTracks(tracks.len()));
        self.wait_if_held().await;
        self.check_track_ops()?;
        self.local_tracks.lock().retain(|t| !tracks.contains(t));
        Ok(())
    }

    async fn replace_track(
        &self,
        _old: Option<LocalTrack>,
        _new: Option<LocalTrack>,
    ) -> Result<()> {
        self.record(SessionCall::ReplaceTrack);
        self.check_track_ops()
    }

    async fn add_track_as_unmute(&self, _track: LocalTrack) -> Result<()> {
        self.record(SessionCall::AddTrackAsUnmute);
        self.check_track_ops()
    }

    async fn remove_track_as_mute(&self, _track: LocalTrack) -> Result<()> {
        self.record(SessionCall::RemoveTrackAsMute);
        self.check_track_ops()
    }

    async fn terminate(&self, reason: TerminateReason) -> Result<()> {
        self.record(SessionCall::Terminate(reason));
        *self.state.lock() = NegotiationState::Ended;
        Ok(())
    }
}

/// Hands out [`FakeSession`]s under the ids the controller assigns
#[derive(Default)]
pub struct FakeFactory {
    created: Mutex<Vec<Arc<FakeSession>>>,
    fail: AtomicBool,
    fail_initialize: AtomicBool,
}

impl FakeFactory {
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Sessions created from now on fail `initialize`
    pub fn fail_initialize(&self, fail: bool) {
        self.fail_initialize.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<FakeSession>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<FakeSession>> {
        self.created.lock().last().cloned()
    }
}

impl SessionFactory for FakeFactory {
    fn create_direct_session(
        &self,
        id: SessionId,
        peer: &PartyId,
    ) -> Result<Arc<dyn TransportSession>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Negotiation("no media engine".to_string()));
        }
        let session = FakeSession::direct(id.as_str(), peer.as_str());
        session.fail_initialize(self.fail_initialize.load(Ordering::SeqCst));
        self.created.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsCall {
    Start(SessionId),
    Stop,
}

#[derive(Default)]
pub struct RecordingStats {
    calls: Mutex<Vec<StatsCall>>,
}

impl RecordingStats {
    pub fn calls(&self) -> Vec<StatsCall> {
        self.calls.lock().clone()
    }

    /// Session statistics are currently collected from
    pub fn current(&self) -> Option<SessionId> {
        match self.calls.lock().last() {
            Some(StatsCall::Start(id)) => Some(id.clone()),
            _ => None,
        }
    }
}

impl StatsSink for RecordingStats {
    fn start_remote_stats(&self, session: Arc<dyn TransportSession>) {
        self.calls.lock().push(StatsCall::Start(session.id()));
    }

    fn stop_remote_stats(&self) {
        self.calls.lock().push(StatsCall::Stop);
    }
}

#[derive(Default)]
pub struct RecordingSink {
    notifications: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    pub fn events(&self) -> Vec<ConferenceEvent> {
        self.notifications.lock().iter().map(|n| n.event.clone()).collect()
    }

    pub fn origins(&self) -> Vec<Option<TransportKind>> {
        self.notifications.lock().iter().map(|n| n.origin).collect()
    }

    pub fn clear(&self) {
        self.notifications.lock().clear();
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, notification: Notification) {
        self.notifications.lock().push(notification);
    }
}

/// Everything a controller under test talks to
pub struct Harness {
    pub room: Arc<FakeRoom>,
    pub factory: Arc<FakeFactory>,
    pub stats: Arc<RecordingStats>,
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    pub fn new(local_id: &str, role: PartyRole) -> Self {
        Self {
            room: Arc::new(FakeRoom::new(local_id, role)),
            factory: Arc::new(FakeFactory::default()),
            stats: Arc::new(RecordingStats::default()),
            sink: Arc::new(RecordingSink::default()),
        }
    }

    pub fn collaborators(&self) -> crate::controller::Collaborators {
        crate::controller::Collaborators {
            room: self.room.clone(),
            sessions: self.factory.clone(),
            stats: self.stats.clone(),
            events: self.sink.clone(),
        }
    }
}

/// Let spawned session operations run and the controller drain their results
pub async fn settle(handle: &crate::handle::ControllerHandle) {
    for _ in 0..8 {
        tokio::task::yield_now().await;
        let _ = handle.flush().await;
    }
}

/// Role a direct session was initialized with, from its recorded calls
pub fn initialized_as(session: &FakeSession) -> Option<SessionRole> {
    session.calls().iter().find_map(|c| match c {
        SessionCall::Initialize { initiator: true } => Some(SessionRole::Initiator),
        SessionCall::Initialize { initiator: false } => Some(SessionRole::Responder),
        _ => None,
    })
}
