//! Connection-mode controller
//!
//! Owns the decision of which transport carries media. All state lives in a
//! single task draining one command queue, so transitions never interleave.
//! Anything asynchronous (track migration, negotiation, termination) runs in
//! a spawned task; when a later step depends on it, the task posts a command
//! back to the queue and the step is taken there, after re-checking that the
//! session it belongs to still exists.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{MigrationFailurePolicy, TopologyConfig};
use crate::error::{Error, Result};
use crate::events::{ConferenceEvent, ConnectivityEvent, EventSink, Notification};
use crate::filter::EventFilter;
use crate::handle::ControllerHandle;
use crate::migrator::{LocalTrackOp, TrackMigrator};
use crate::room::Room;
use crate::session::{
    IceCandidate, LocalTrack, NegotiationState, RemoteTrack, SessionDescription, SessionFactory,
    SessionOptions, SessionRole, TerminateReason, TransportSession,
};
use crate::shim::SignalingShim;
use crate::stats::StatsSink;
use crate::types::{ActiveTransport, Party, PartyId, SessionId, TransportKind};

/// Observable controller state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerSnapshot {
    pub active_transport: ActiveTransport,
    pub direct_session: Option<SessionId>,
    pub direct_role: Option<SessionRole>,
    pub direct_established: bool,
    pub direct_interrupted: bool,
    pub invite_sent: bool,
    pub fallback_pending: bool,
    pub relayed_started: bool,
    pub relayed_interrupted: bool,
}

/// Collaborators injected into the controller
pub struct Collaborators {
    pub room: Arc<dyn Room>,
    pub sessions: Arc<dyn SessionFactory>,
    pub stats: Arc<dyn StatsSink>,
    /// Outward channel; wrapped in an [`EventFilter`] by the controller
    pub events: Arc<dyn EventSink>,
}

pub(crate) enum Command {
    MemberJoined(PartyId),
    MemberLeft(PartyId),
    RoleChanged,
    RelayedStarted(Arc<dyn TransportSession>),
    RelayedEnded,
    RelayedConnectivity(ConnectivityEvent),
    IncomingDirect {
        session: Arc<dyn TransportSession>,
        offer: SessionDescription,
    },
    DirectConnectivity {
        session_id: SessionId,
        event: ConnectivityEvent,
    },
    DirectTerminated {
        session_id: SessionId,
        reason: Option<String>,
    },
    DirectAnswer {
        session_id: SessionId,
        answer: SessionDescription,
        reply: oneshot::Sender<Result<()>>,
    },
    DirectIceCandidates {
        session_id: SessionId,
        candidates: Vec<IceCandidate>,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoteTrackAdded {
        transport: TransportKind,
        track: RemoteTrack,
    },
    RemoteTrackRemoved {
        transport: TransportKind,
        track: RemoteTrack,
    },
    LocalTrack(LocalTrackOp),
    LocalTracksAdded {
        session_id: SessionId,
        result: Result<()>,
    },
    FallbackFired {
        generation: u64,
    },
    StartDirect {
        reply: oneshot::Sender<Result<()>>,
    },
    StopDirect {
        reply: oneshot::Sender<Result<()>>,
    },
    Barrier(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

struct RelayedSession {
    session: Arc<dyn TransportSession>,
    /// Local tracks detached because direct is carrying media
    suspended: bool,
    interrupted: bool,
    /// Last queued local track move; the next one starts after it
    migration: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy)]
enum TrackMove {
    Attach,
    Detach,
}

impl RelayedSession {
    fn new(session: Arc<dyn TransportSession>) -> Self {
        Self {
            session,
            suspended: false,
            interrupted: false,
            migration: None,
        }
    }

    /// Move local tracks on or off this session, after any move still running
    fn queue_move(&mut self, direction: TrackMove, tracks: Vec<LocalTrack>) {
        let previous = self.migration.take();
        let session = Arc::clone(&self.session);
        self.migration = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(e) = previous.await {
                    warn!(error = %e, "Previous local track move did not finish");
                }
            }
            let _ = match direction {
                TrackMove::Attach => TrackMigrator::attach_local_tracks(session, tracks).await,
                TrackMove::Detach => TrackMigrator::detach_local_tracks(session, tracks).await,
            };
        }));
    }
}

struct DirectSession {
    session: Arc<dyn TransportSession>,
    role: SessionRole,
    shim: Arc<SignalingShim>,
    /// Offer to accept once local tracks are in place (responder only)
    pending_offer: Option<SessionDescription>,
    established: bool,
    interrupted: bool,
    invite_sent: bool,
}

struct PendingFallback {
    generation: u64,
    cancel: CancellationToken,
}

pub struct ModeController {
    config: TopologyConfig,
    room: Arc<dyn Room>,
    sessions: Arc<dyn SessionFactory>,
    stats: Arc<dyn StatsSink>,
    events: Arc<dyn EventSink>,
    migrator: TrackMigrator,
    commands: mpsc::WeakUnboundedSender<Command>,
    state: watch::Sender<ControllerSnapshot>,
    active: ActiveTransport,
    relayed: Option<RelayedSession>,
    direct: Option<DirectSession>,
    fallback: Option<PendingFallback>,
    fallback_generation: u64,
}

impl ModeController {
    /// Start the controller task and return a handle to it.
    ///
    /// Must be called within a tokio runtime. The task stops when every
    /// handle is dropped or [`ControllerHandle::shutdown`] is called.
    pub fn spawn(config: TopologyConfig, collaborators: Collaborators) -> ControllerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ControllerSnapshot::default());
        let events: Arc<dyn EventSink> =
            Arc::new(EventFilter::new(collaborators.events, state_rx.clone()));

        info!(
            enabled = config.enabled,
            manual = config.manual,
            fallback_delay_secs = config.fallback_delay_secs,
            local_id = %collaborators.room.local_id(),
            "Connection-mode controller starting"
        );

        let controller = Self {
            config,
            room: collaborators.room,
            sessions: collaborators.sessions,
            stats: collaborators.stats,
            migrator: TrackMigrator::new(Arc::clone(&events)),
            events,
            commands: tx.downgrade(),
            state: state_tx,
            active: ActiveTransport::None,
            relayed: None,
            direct: None,
            fallback: None,
            fallback_generation: 0,
        };
        tokio::spawn(controller.run(rx));

        ControllerHandle::new(tx, state_rx)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            if let Command::Shutdown(reply) = command {
                self.shutdown();
                let _ = reply.send(());
                return;
            }
            self.handle(command);
        }
        debug!("All controller handles dropped");
        self.shutdown();
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::MemberJoined(party) => {
                debug!(party = %party, "Party joined");
                self.maybe_start_or_stop(false);
            }
            Command::MemberLeft(party) => {
                debug!(party = %party, "Party left");
                self.maybe_start_or_stop(true);
            }
            Command::RoleChanged => self.maybe_start_or_stop(false),
            Command::RelayedStarted(session) => self.on_relayed_started(session),
            Command::RelayedEnded => self.on_relayed_ended(),
            Command::RelayedConnectivity(event) => self.on_relayed_connectivity(event),
            Command::IncomingDirect { session, offer } => {
                // Rejections are logged where they happen
                let _ = self.accept_incoming(session, offer);
            }
            Command::DirectConnectivity { session_id, event } => {
                self.on_direct_connectivity(&session_id, event);
            }
            Command::DirectTerminated { session_id, reason } => {
                self.on_direct_terminated(&session_id, reason);
            }
            Command::DirectAnswer {
                session_id,
                answer,
                reply,
            } => {
                let result = self.direct_for(&session_id).map(|session| {
                    spawn_op("set_answer", session_id, async move {
                        session.set_answer(answer).await
                    });
                });
                let _ = reply.send(result);
            }
            Command::DirectIceCandidates {
                session_id,
                candidates,
                reply,
            } => {
                let result = self.direct_for(&session_id).map(|session| {
                    spawn_op("add_ice_candidates", session_id, async move {
                        session.add_ice_candidates(candidates).await
                    });
                });
                let _ = reply.send(result);
            }
            Command::RemoteTrackAdded { transport, track } => {
                self.on_remote_track(transport, ConferenceEvent::RemoteTrackAdded { track });
            }
            Command::RemoteTrackRemoved { transport, track } => {
                self.on_remote_track(transport, ConferenceEvent::RemoteTrackRemoved { track });
            }
            Command::LocalTrack(op) => self.on_local_track_op(op),
            Command::LocalTracksAdded { session_id, result } => {
                self.on_local_tracks_added(&session_id, result);
            }
            Command::FallbackFired { generation } => self.on_fallback_fired(generation),
            Command::StartDirect { reply } => {
                let _ = reply.send(self.manual_start());
            }
            Command::StopDirect { reply } => {
                let reason = TerminateReason::success("direct session stopped");
                let _ = reply.send(self.stop_direct(reason));
            }
            Command::Barrier(reply) => {
                let _ = reply.send(());
            }
            Command::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn shutdown(&mut self) {
        self.cancel_fallback("controller shutting down");
        if self.direct.is_some() {
            let _ = self.stop_direct(TerminateReason::success("conference left"));
        }
        info!("Connection-mode controller stopped");
    }

    // ---- eligibility -------------------------------------------------------

    /// Re-evaluate whether the room should be in direct mode.
    ///
    /// `user_left` marks a departure; becoming eligible because of one defers
    /// the switch instead of starting right away.
    fn maybe_start_or_stop(&mut self, user_left: bool) {
        if !self.config.enabled || self.config.manual {
            return;
        }

        let peers = self.room.parties();
        if peers.len() != 1 {
            self.cancel_fallback("room is no longer direct-eligible");
            if self.direct.is_some() {
                info!(parties = peers.len(), "Party count changed, leaving direct mode");
                let _ = self.stop_direct(TerminateReason::success("party count changed"));
            }
            return;
        }

        if self.direct.is_some() {
            return;
        }

        let peer = &peers[0];
        if !self.should_initiate(peer) {
            debug!(peer = %peer.id, "Waiting for the other party to initiate direct mode");
            return;
        }

        if user_left {
            self.arm_fallback();
        } else if self.fallback.is_some() {
            debug!("Deferred direct start already pending");
        } else {
            let _ = self.start_direct(&peer.id);
        }
    }

    fn should_initiate(&self, peer: &Party) -> bool {
        let local_privileged =
            !self.config.require_moderator || self.room.local_role().is_moderator();
        if !local_privileged {
            return false;
        }
        let peer_privileged = !self.config.require_moderator || peer.role.is_moderator();
        if !peer_privileged {
            return true;
        }
        // Lower identifier refrains and waits for the other side
        self.room.local_id().tie_break_cmp(&peer.id).is_gt()
    }

    fn arm_fallback(&mut self) {
        if self.fallback.is_some() {
            error!("Deferred direct start has been armed already");
            return;
        }

        self.fallback_generation += 1;
        let generation = self.fallback_generation;
        let cancel = CancellationToken::new();
        let delay = self.config.fallback_delay();
        let commands = self.commands.clone();
        let token = cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    post(&commands, Command::FallbackFired { generation });
                }
            }
        });

        self.fallback = Some(PendingFallback { generation, cancel });
        self.publish();
        info!(
            delay_secs = self.config.fallback_delay_secs,
            generation,
            "Party left, deferring switch to direct mode"
        );
    }

    fn cancel_fallback(&mut self, why: &'static str) {
        if let Some(pending) = self.fallback.take() {
            pending.cancel.cancel();
            self.publish();
            info!(generation = pending.generation, reason = why, "Cancelled deferred direct start");
        }
    }

    fn on_fallback_fired(&mut self, generation: u64) {
        match &self.fallback {
            Some(pending) if pending.generation == generation => {
                self.fallback = None;
                self.publish();
                debug!(generation, "Deferred direct start fired");
                self.maybe_start_or_stop(false);
            }
            _ => debug!(generation, "Ignoring stale deferred direct start"),
        }
    }

    // ---- direct session lifecycle -----------------------------------------

    fn manual_start(&mut self) -> Result<()> {
        if !self.config.enabled {
            warn!("Direct mode is disabled, not starting");
            return Err(Error::Disabled);
        }
        if let Some(direct) = &self.direct {
            warn!(session_id = %direct.session.id(), "Direct session already exists");
            return Err(Error::DirectSessionExists(direct.session.id()));
        }
        let peers = self.room.parties();
        match peers.as_slice() {
            [peer] => self.start_direct(&peer.id),
            _ => {
                error!(parties = peers.len(), "Direct mode needs exactly one other party");
                Err(Error::NotEligible(format!("{} other parties", peers.len())))
            }
        }
    }

    fn start_direct(&mut self, peer: &PartyId) -> Result<()> {
        if let Some(direct) = &self.direct {
            warn!(
                session_id = %direct.session.id(),
                "Direct session already exists, not initiating"
            );
            return Err(Error::DirectSessionExists(direct.session.id()));
        }
        self.cancel_fallback("starting direct session");

        let session_id = SessionId::generate();
        let session = self
            .sessions
            .create_direct_session(session_id.clone(), peer)
            .map_err(|e| {
                error!(
                    session_id = %session_id,
                    peer = %peer,
                    error = %e,
                    "Failed to create direct session"
                );
                e
            })?;
        let shim = SignalingShim::new(session.id(), &self.room, self.commands.clone());
        if let Err(e) = session.initialize(true, shim.clone(), self.session_options()) {
            error!(session_id = %session.id(), error = %e, "Failed to initialize direct session");
            shim.detach();
            return Err(e);
        }

        info!(session_id = %session.id(), peer = %peer, "Starting direct session as initiator");
        self.adopt_direct(session, SessionRole::Initiator, shim, None);
        Ok(())
    }

    fn accept_incoming(
        &mut self,
        session: Arc<dyn TransportSession>,
        offer: SessionDescription,
    ) -> Result<()> {
        let session_id = session.id();

        let rejection = if !self.config.enabled {
            Some((TerminateReason::decline("direct mode disabled"), Error::Disabled))
        } else if self.config.require_moderator && !self.room.local_role().is_moderator() {
            Some((
                TerminateReason::decline("only moderators accept direct sessions"),
                Error::NotEligible("local party is not a moderator".to_string()),
            ))
        } else if let Some(existing) = &self.direct {
            Some((TerminateReason::busy(), Error::DirectSessionExists(existing.session.id())))
        } else if !self.config.manual && self.room.parties().len() != 1 {
            Some((
                TerminateReason::decline("direct mode requirements not met"),
                Error::NotEligible("room is not direct-eligible".to_string()),
            ))
        } else {
            None
        };

        if let Some((reason, err)) = rejection {
            warn!(
                session_id = %session_id,
                reason = %reason.reason,
                error = %err,
                "Rejecting incoming direct session"
            );
            spawn_op("terminate", session_id, async move { session.terminate(reason).await });
            return Err(err);
        }

        let shim = SignalingShim::new(session_id.clone(), &self.room, self.commands.clone());
        if let Err(e) = session.initialize(false, shim.clone(), self.session_options()) {
            error!(
                session_id = %session_id,
                error = %e,
                "Failed to initialize incoming direct session"
            );
            shim.detach();
            let reason = TerminateReason::new("general-error", "initialization failed");
            spawn_op("terminate", session_id, async move { session.terminate(reason).await });
            return Err(e);
        }

        self.cancel_fallback("accepting incoming direct session");
        info!(
            session_id = %session_id,
            peer = ?session.peer_id(),
            "Accepting incoming direct session"
        );
        self.adopt_direct(session, SessionRole::Responder, shim, Some(offer));
        Ok(())
    }

    /// Record a freshly initialized direct session and start moving local
    /// tracks onto it. Negotiation continues in [`Self::on_local_tracks_added`].
    fn adopt_direct(
        &mut self,
        session: Arc<dyn TransportSession>,
        role: SessionRole,
        shim: Arc<SignalingShim>,
        pending_offer: Option<SessionDescription>,
    ) {
        self.direct = Some(DirectSession {
            session: Arc::clone(&session),
            role,
            shim,
            pending_offer,
            established: false,
            interrupted: false,
            invite_sent: false,
        });
        self.publish();

        let tracks = self.room.local_tracks();
        let session_id = session.id();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = TrackMigrator::add_local_tracks(session, tracks).await;
            post(&commands, Command::LocalTracksAdded { session_id, result });
        });
    }

    fn on_local_tracks_added(&mut self, session_id: &SessionId, result: Result<()>) {
        let Some(direct) = self.direct.as_mut().filter(|d| d.session.id() == *session_id) else {
            debug!(session_id = %session_id, "Local tracks added to a session that is gone");
            return;
        };

        if let Err(e) = result {
            match self.config.migration_failure {
                MigrationFailurePolicy::Continue => {
                    warn!(
                        session_id = %session_id,
                        error = %e,
                        "Local track migration failed, continuing"
                    );
                }
                MigrationFailurePolicy::Abort => {
                    warn!(
                        session_id = %session_id,
                        error = %e,
                        "Local track migration failed, aborting direct session"
                    );
                    let reason =
                        TerminateReason::new("general-error", "local track migration failed");
                    let _ = self.stop_direct(reason);
                    return;
                }
            }
        }

        let session = Arc::clone(&direct.session);
        match direct.role {
            SessionRole::Initiator => {
                if direct.invite_sent {
                    error!(session_id = %session_id, "Invite already sent");
                    return;
                }
                direct.invite_sent = true;
                self.publish();
                info!(session_id = %session_id, "Sending direct session invite");
                spawn_op("invite", session_id.clone(), async move { session.invite().await });
            }
            SessionRole::Responder => {
                let Some(offer) = direct.pending_offer.take() else {
                    error!(session_id = %session_id, "No offer to accept");
                    return;
                };
                info!(session_id = %session_id, "Accepting direct session offer");
                spawn_op("accept_offer", session_id.clone(), async move {
                    session.accept_offer(offer).await
                });
            }
        }
    }

    fn on_direct_connectivity(&mut self, session_id: &SessionId, event: ConnectivityEvent) {
        let Some(direct) = self.direct.as_mut().filter(|d| d.session.id() == *session_id) else {
            debug!(
                session_id = %session_id,
                ?event,
                "Connectivity event for a session that is gone"
            );
            return;
        };

        match event {
            ConnectivityEvent::Established if !direct.established => self.on_direct_established(),
            ConnectivityEvent::Established | ConnectivityEvent::Restored => {
                if direct.interrupted {
                    direct.interrupted = false;
                    self.publish();
                    info!(session_id = %session_id, "Direct connection restored");
                    self.emit(Some(TransportKind::Direct), ConferenceEvent::ConnectionRestored);
                } else {
                    debug!(session_id = %session_id, ?event, "Direct connection already healthy");
                }
            }
            ConnectivityEvent::Interrupted => {
                direct.interrupted = true;
                self.publish();
                info!(session_id = %session_id, "Direct connection interrupted");
                self.emit(Some(TransportKind::Direct), ConferenceEvent::ConnectionInterrupted);
            }
            ConnectivityEvent::Failed => {
                warn!(
                    session_id = %session_id,
                    "Direct connection failed, falling back to relayed"
                );
                let reason = TerminateReason::new("connectivity-error", "ICE connection failed");
                let _ = self.stop_direct(reason);
            }
        }
    }

    fn on_direct_established(&mut self) {
        let Some(direct) = self.direct.as_mut() else {
            return;
        };
        direct.established = true;
        direct.interrupted = false;
        let session = Arc::clone(&direct.session);
        info!(session_id = %session.id(), "Direct connection established, switching media");

        self.set_active(ActiveTransport::Direct);

        if let Some(relayed) = &self.relayed {
            self.migrator.withdraw_remote_tracks(TransportKind::Relayed, relayed.session.as_ref());
        }
        self.migrator.project_remote_tracks(TransportKind::Direct, session.as_ref());

        let relayed_interrupted = self.suspend_relayed();

        self.stats.stop_remote_stats();
        self.stats.start_remote_stats(Arc::clone(&session));

        self.emit(None, ConferenceEvent::DirectStatusChanged { active: true });
        if relayed_interrupted {
            self.emit(Some(TransportKind::Direct), ConferenceEvent::ConnectionRestored);
        }
    }

    /// Detach local tracks from the relayed session. Returns whether it is
    /// currently interrupted.
    fn suspend_relayed(&mut self) -> bool {
        let Some(relayed) = self.relayed.as_mut() else {
            return false;
        };
        if !relayed.suspended {
            relayed.suspended = true;
            relayed.queue_move(TrackMove::Detach, self.room.local_tracks());
        }
        relayed.interrupted
    }

    fn on_direct_terminated(&mut self, session_id: &SessionId, reason: Option<String>) {
        if self.direct.as_ref().is_some_and(|d| d.session.id() == *session_id) {
            info!(
                session_id = %session_id,
                reason = ?reason,
                "Direct session terminated by remote party"
            );
            self.teardown_direct(None);
        } else {
            debug!(session_id = %session_id, "Termination for a session that is gone");
        }
    }

    fn stop_direct(&mut self, reason: TerminateReason) -> Result<()> {
        if self.direct.is_none() {
            error!("No direct session to stop");
            return Err(Error::NoDirectSession);
        }
        self.teardown_direct(Some(reason));
        Ok(())
    }

    /// Tear the direct session down and resume the relayed one. `reason` is
    /// sent to the remote side unless the session already ended.
    fn teardown_direct(&mut self, reason: Option<TerminateReason>) {
        let Some(direct) = self.direct.take() else {
            return;
        };
        let was_established = direct.established;
        let session_id = direct.session.id();
        info!(session_id = %session_id, established = was_established, "Stopping direct session");

        let mut relayed_interrupted = false;
        if let Some(relayed) = self.relayed.as_mut() {
            relayed_interrupted = relayed.interrupted;
            if relayed.suspended {
                relayed.suspended = false;
                relayed.queue_move(TrackMove::Attach, self.room.local_tracks());
            }
        }

        if was_established {
            self.migrator.withdraw_remote_tracks(TransportKind::Direct, direct.session.as_ref());
        }

        let next = if self.relayed.is_some() {
            ActiveTransport::Relayed
        } else {
            ActiveTransport::None
        };
        self.set_active(next);

        if was_established {
            if let Some(relayed) = &self.relayed {
                self.migrator
                    .project_remote_tracks(TransportKind::Relayed, relayed.session.as_ref());
            }
            self.stats.stop_remote_stats();
        }

        direct.shim.detach();
        if let Some(reason) = reason {
            if direct.session.state() == NegotiationState::Ended {
                debug!(session_id = %session_id, "Direct session already ended");
            } else {
                let session = direct.session;
                spawn_op("terminate", session_id, async move { session.terminate(reason).await });
            }
        }

        self.emit(None, ConferenceEvent::DirectStatusChanged { active: false });
        if was_established {
            if let Some(relayed) = &self.relayed {
                self.stats.start_remote_stats(Arc::clone(&relayed.session));
            }
            if relayed_interrupted {
                self.emit(Some(TransportKind::Relayed), ConferenceEvent::ConnectionInterrupted);
            } else if direct.interrupted && self.relayed.is_some() {
                self.emit(Some(TransportKind::Relayed), ConferenceEvent::ConnectionRestored);
            }
        }
    }

    fn direct_for(&self, session_id: &SessionId) -> Result<Arc<dyn TransportSession>> {
        match &self.direct {
            Some(direct) if direct.session.id() == *session_id => Ok(Arc::clone(&direct.session)),
            _ => {
                error!(session_id = %session_id, "Signaling for an unknown direct session");
                Err(Error::UnknownSession(session_id.clone()))
            }
        }
    }

    // ---- relayed session ---------------------------------------------------

    fn on_relayed_started(&mut self, session: Arc<dyn TransportSession>) {
        if let Some(previous) = &self.relayed {
            warn!(
                previous = %previous.session.id(),
                session_id = %session.id(),
                "Replacing relayed session"
            );
        }
        let direct_active = self.direct.as_ref().is_some_and(|d| d.established);
        info!(session_id = %session.id(), direct_active, "Relayed session started");

        self.relayed = Some(RelayedSession::new(Arc::clone(&session)));

        if direct_active {
            self.suspend_relayed();
            self.publish();
        } else {
            self.set_active(ActiveTransport::Relayed);
            self.stats.start_remote_stats(session);
        }
    }

    fn on_relayed_ended(&mut self) {
        let Some(relayed) = self.relayed.take() else {
            warn!("Relayed session ended but none was started");
            return;
        };
        info!(session_id = %relayed.session.id(), "Relayed session ended");
        if self.active == ActiveTransport::Relayed {
            self.stats.stop_remote_stats();
            self.set_active(ActiveTransport::None);
        } else {
            self.publish();
        }
    }

    fn on_relayed_connectivity(&mut self, event: ConnectivityEvent) {
        let Some(relayed) = self.relayed.as_mut() else {
            warn!(?event, "Relayed connectivity event without a relayed session");
            return;
        };
        match event {
            ConnectivityEvent::Interrupted => relayed.interrupted = true,
            ConnectivityEvent::Established | ConnectivityEvent::Restored => {
                relayed.interrupted = false;
            }
            ConnectivityEvent::Failed => {}
        }
        self.publish();
        self.emit(Some(TransportKind::Relayed), event.as_conference_event());
    }

    // ---- tracks ------------------------------------------------------------

    fn on_remote_track(&self, transport: TransportKind, event: ConferenceEvent) {
        if !self.active.is(transport) {
            info!(
                %transport,
                active = ?self.active,
                event = event.name(),
                "Dropping remote track notification from inactive transport"
            );
            return;
        }
        self.emit(Some(transport), event);
    }

    fn on_local_track_op(&self, op: LocalTrackOp) {
        let ops: Vec<_> = self
            .relayed
            .iter()
            .map(|r| Arc::clone(&r.session))
            .chain(self.direct.iter().map(|d| Arc::clone(&d.session)))
            .map(|session| TrackMigrator::apply(session, op.clone()))
            .collect();
        if ops.is_empty() {
            debug!(?op, "No session to apply local track operation to");
            return;
        }
        tokio::spawn(async move {
            join_all(ops).await;
        });
    }

    // ---- helpers -----------------------------------------------------------

    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            ice_servers: if self.config.use_stun_turn {
                self.config.ice_servers.clone()
            } else {
                Vec::new()
            },
        }
    }

    fn set_active(&mut self, active: ActiveTransport) {
        if self.active != active {
            debug!(from = ?self.active, to = ?active, "Active transport changed");
        }
        self.active = active;
        self.publish();
    }

    fn publish(&self) {
        debug_assert!(
            self.active != ActiveTransport::Direct
                || self.direct.as_ref().is_some_and(|d| d.established),
            "direct transport active without an established direct session"
        );
        let direct = self.direct.as_ref();
        let relayed = self.relayed.as_ref();
        self.state.send_replace(ControllerSnapshot {
            active_transport: self.active,
            direct_session: direct.map(|d| d.session.id()),
            direct_role: direct.map(|d| d.role),
            direct_established: direct.is_some_and(|d| d.established),
            direct_interrupted: direct.is_some_and(|d| d.interrupted),
            invite_sent: direct.is_some_and(|d| d.invite_sent),
            fallback_pending: self.fallback.is_some(),
            relayed_started: relayed.is_some(),
            relayed_interrupted: relayed.is_some_and(|r| r.interrupted),
        });
    }

    fn emit(&self, origin: Option<TransportKind>, event: ConferenceEvent) {
        self.events.emit(Notification::new(origin, event));
    }
}

fn post(commands: &mpsc::WeakUnboundedSender<Command>, command: Command) {
    match commands.upgrade() {
        Some(tx) => {
            let _ = tx.send(command);
        }
        None => debug!("Controller stopped, dropping internal command"),
    }
}

fn spawn_op<F>(op: &'static str, session_id: SessionId, fut: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            error!(session_id = %session_id, op, error = %e, "Session operation failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::MediaPresence;
    use crate::session::SessionRole;
    use crate::shim::{SessionEvent, SignalingLayer};
    use crate::test_support::{
        initialized_as, settle, FakeSession, Harness, SessionCall, StatsCall,
    };
    use crate::types::{MediaKind, PartyRole};
    use std::time::Duration;

    fn spawn(harness: &Harness, config: TopologyConfig) -> ControllerHandle {
        ModeController::spawn(config, harness.collaborators())
    }

    async fn join(harness: &Harness, handle: &ControllerHandle, id: &str, role: PartyRole) {
        harness.room.add_party(id, role);
        handle.member_joined(id).unwrap();
        settle(handle).await;
    }

    #[tokio::test]
    async fn test_higher_moderator_initiates() {
        let harness = Harness::new("9", PartyRole::Moderator);
        let handle = spawn(&harness, TopologyConfig::default());

        join(&harness, &handle, "5", PartyRole::Moderator).await;

        let direct = harness.factory.last().expect("direct session created");
        assert_eq!(initialized_as(&direct), Some(SessionRole::Initiator));
        assert!(direct.has_call(&SessionCall::AddLocalTracks(2)));
        assert!(direct.has_call(&SessionCall::Invite));

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.direct_session, Some(direct.id()));
        assert_eq!(snapshot.direct_role, Some(SessionRole::Initiator));
        assert!(snapshot.invite_sent);
        assert!(!snapshot.direct_established);
    }

    #[tokio::test]
    async fn test_lower_moderator_waits() {
        let harness = Harness::new("5", PartyRole::Moderator);
        let handle = spawn(&harness, TopologyConfig::default());

        join(&harness, &handle, "9", PartyRole::Moderator).await;

        assert!(harness.factory.created().is_empty());
        assert_eq!(handle.snapshot().direct_session, None);
    }

    #[tokio::test]
    async fn test_moderator_initiates_towards_participant() {
        let harness = Harness::new("5", PartyRole::Moderator);
        let handle = spawn(&harness, TopologyConfig::default());

        join(&harness, &handle, "9", PartyRole::Participant).await;

        assert_eq!(harness.factory.created().len(), 1);
    }

    #[tokio::test]
    async fn test_participant_never_initiates() {
        let harness = Harness::new("9", PartyRole::Participant);
        let handle = spawn(&harness, TopologyConfig::default());

        join(&harness, &handle, "5", PartyRole::Moderator).await;

        assert!(harness.factory.created().is_empty());
    }

    #[tokio::test]
    async fn test_role_change_triggers_evaluation() {
        let harness = Harness::new("9", PartyRole::Participant);
        let handle = spawn(&harness, TopologyConfig::default());
        join(&harness, &handle, "5", PartyRole::Participant).await;
        assert!(harness.factory.created().is_empty());

        harness.room.set_role(PartyRole::Moderator);
        handle.role_changed().unwrap();
        settle(&handle).await;

        assert_eq!(harness.factory.created().len(), 1);
    }

    #[tokio::test]
    async fn test_without_moderator_requirement_id_decides() {
        let config = TopologyConfig {
            require_moderator: false,
            ..Default::default()
        };

        let low = Harness::new("5", PartyRole::Participant);
        let low_handle = spawn(&low, config.clone());
        join(&low, &low_handle, "9", PartyRole::Participant).await;
        assert!(low.factory.created().is_empty());

        let high = Harness::new("9", PartyRole::Participant);
        let high_handle = spawn(&high, config);
        join(&high, &high_handle, "5", PartyRole::Participant).await;
        assert_eq!(high.factory.created().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_does_nothing() {
        let harness = Harness::new("9", PartyRole::Moderator);
        let handle = spawn(
            &harness,
            TopologyConfig {
                enabled: false,
                ..Default::default()
            },
        );

        join(&harness, &handle, "5", PartyRole::Moderator).await;

        assert!(harness.factory.created().is_empty());
        assert!(matches!(handle.start_direct().await, Err(Error::Disabled)));
    }

    #[tokio::test]
    async fn test_stale_fallback_is_ignored() {
        let harness = Harness::new("9", PartyRole::Moderator);
        let handle = spawn(&harness, TopologyConfig::default());
        harness.room.add_party("5", PartyRole::Moderator);

        handle
            .send_command(Command::FallbackFired { generation: 42 })
            .unwrap();
        settle(&handle).await;

        assert!(harness.factory.created().is_empty());
    }

    #[tokio::test]
    async fn test_factory_failure_leaves_no_session() {
        let harness = Harness::new("9", PartyRole::Moderator);
        harness.factory.fail(true);
        let handle = spawn(
            &harness,
            TopologyConfig {
                manual: true,
                ..Default::default()
            },
        );
        harness.room.add_party("5", PartyRole::Moderator);

        assert!(matches!(handle.start_direct().await, Err(Error::Negotiation(_))));
        assert_eq!(handle.snapshot().direct_session, None);
    }

    #[tokio::test]
    async fn test_direct_session_gets_generated_id() {
        let harness = Harness::new("9", PartyRole::Moderator);
        let handle = spawn(&harness, TopologyConfig::default());

        join(&harness, &handle, "5", PartyRole::Moderator).await;

        let direct = harness.factory.last().expect("direct session created");
        assert_eq!(direct.id().as_str().len(), 12);
        assert_eq!(handle.snapshot().direct_session, Some(direct.id()));
    }

    #[tokio::test]
    async fn test_initiator_initialize_failure_detaches_signaling() {
        let harness = Harness::new("9", PartyRole::Moderator);
        harness.factory.fail_initialize(true);
        let handle = spawn(
            &harness,
            TopologyConfig {
                manual: true,
                ..Default::default()
            },
        );
        harness.room.add_party("5", PartyRole::Moderator);
        let mic = MediaPresence {
            muted: false,
            video_type: None,
        };
        harness.room.set_media_presence("5", MediaKind::Audio, mic);

        assert!(matches!(handle.start_direct().await, Err(Error::Negotiation(_))));
        settle(&handle).await;

        let direct = harness.factory.last().expect("direct session created");
        assert!(!direct.has_call(&SessionCall::AddLocalTracks(2)));
        let signaling = direct.signaling().expect("signaling handed to session");
        assert!(signaling.media_presence(&PartyId::from("5"), MediaKind::Audio).is_none());
        assert_eq!(handle.snapshot().direct_session, None);
    }

    #[tokio::test]
    async fn test_responder_initialize_failure_terminates_offer() {
        let harness = Harness::new("5", PartyRole::Moderator);
        let handle = spawn(&harness, TopologyConfig::default());
        join(&harness, &handle, "9", PartyRole::Moderator).await;

        let incoming = FakeSession::direct("remote-1", "9");
        incoming.fail_initialize(true);
        handle
            .incoming_direct_session(incoming.clone(), SessionDescription::new("offer"))
            .unwrap();
        settle(&handle).await;

        assert_eq!(incoming.terminated_with().unwrap().reason, "general-error");
        assert!(!incoming.has_call(&SessionCall::AddLocalTracks(2)));
        assert_eq!(handle.snapshot().direct_session, None);
    }

    #[tokio::test]
    async fn test_outgoing_wins_over_crossing_offer() {
        let harness = Harness::new("9", PartyRole::Moderator);
        let handle = spawn(&harness, TopologyConfig::default());
        join(&harness, &handle, "5", PartyRole::Moderator).await;
        let outgoing = harness.factory.last().expect("direct session created");

        let incoming = FakeSession::direct("remote-1", "5");
        handle
            .incoming_direct_session(incoming.clone(), SessionDescription::new("offer"))
            .unwrap();
        settle(&handle).await;

        assert_eq!(incoming.terminated_with().unwrap().reason, "busy");
        assert!(incoming.calls().iter().all(|c| matches!(c, SessionCall::Terminate(_))));
        assert_eq!(harness.factory.created().len(), 1);
        assert!(outgoing.terminated_with().is_none());

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.direct_session, Some(outgoing.id()));
        assert_eq!(snapshot.direct_role, Some(SessionRole::Initiator));
        assert!(snapshot.invite_sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_departure_keeps_first_deadline() {
        let harness = Harness::new("9", PartyRole::Moderator);
        let handle = spawn(&harness, TopologyConfig::default());
        join(&harness, &handle, "5", PartyRole::Moderator).await;
        join(&harness, &handle, "7", PartyRole::Participant).await;
        let first = harness.factory.last().expect("direct session created");
        assert!(first.terminated_with().is_some());

        harness.room.remove_party("7");
        handle.member_left("7").unwrap();
        settle(&handle).await;
        assert!(handle.snapshot().fallback_pending);

        tokio::time::sleep(Duration::from_secs(3)).await;
        handle.member_left("7").unwrap();
        settle(&handle).await;
        assert!(handle.snapshot().fallback_pending);
        assert_eq!(harness.factory.created().len(), 1);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        settle(&handle).await;

        assert_eq!(harness.factory.created().len(), 2);
        let snapshot = handle.snapshot();
        assert!(!snapshot.fallback_pending);
        assert_eq!(snapshot.direct_session, harness.factory.last().map(|s| s.id()));
    }

    #[tokio::test]
    async fn test_established_moves_stats() {
        let harness = Harness::new("9", PartyRole::Moderator);
        let handle = spawn(&harness, TopologyConfig::default());
        let relayed = crate::test_support::FakeSession::relayed("jvb");
        handle.relayed_session_started(relayed.clone()).unwrap();
        join(&harness, &handle, "5", PartyRole::Moderator).await;

        let direct = harness.factory.last().unwrap();
        direct.emit(SessionEvent::ConnectionEstablished);
        settle(&handle).await;

        assert_eq!(
            harness.stats.calls(),
            vec![
                StatsCall::Start(SessionId::from("jvb")),
                StatsCall::Stop,
                StatsCall::Start(direct.id()),
            ]
        );
        assert_eq!(handle.snapshot().active_transport, ActiveTransport::Direct);
    }

    #[tokio::test]
    async fn test_ice_servers_follow_config() {
        let harness = Harness::new("9", PartyRole::Moderator);
        let handle = spawn(
            &harness,
            TopologyConfig {
                use_stun_turn: false,
                ..Default::default()
            },
        );

        join(&harness, &handle, "5", PartyRole::Moderator).await;

        let options = harness.factory.last().unwrap().options().unwrap();
        assert!(options.ice_servers.is_empty());
    }

    #[tokio::test]
    async fn test_dropping_handles_stops_controller() {
        let harness = Harness::new("9", PartyRole::Moderator);
        let handle = spawn(&harness, TopologyConfig::default());
        let mut state = handle.subscribe();
        drop(handle);

        // The sender side goes away with the controller task
        assert!(state.changed().await.is_err());
    }
}
