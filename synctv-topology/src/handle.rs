//! Cloneable front door to a running [`ModeController`](crate::ModeController)

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

use crate::controller::{Command, ControllerSnapshot};
use crate::error::{Error, Result};
use crate::events::ConnectivityEvent;
use crate::migrator::LocalTrackOp;
use crate::session::{
    IceCandidate, LocalTrack, RemoteTrack, SessionDescription, TransportSession,
};
use crate::types::{PartyId, SessionId, TransportKind};

/// Feeds room and session events into the controller.
///
/// Every method only enqueues; the controller processes commands strictly in
/// the order they were sent. Methods fail with [`Error::ControllerClosed`]
/// once the controller task has stopped.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ControllerSnapshot>,
}

impl ControllerHandle {
    pub(crate) const fn new(
        commands: mpsc::UnboundedSender<Command>,
        state: watch::Receiver<ControllerSnapshot>,
    ) -> Self {
        Self { commands, state }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::ControllerClosed)
    }

    #[cfg(test)]
    pub(crate) fn send_command(&self, command: Command) -> Result<()> {
        self.send(command)
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx))?;
        rx.await.map_err(|_| Error::ControllerClosed)
    }

    pub fn member_joined(&self, party: impl Into<PartyId>) -> Result<()> {
        self.send(Command::MemberJoined(party.into()))
    }

    pub fn member_left(&self, party: impl Into<PartyId>) -> Result<()> {
        self.send(Command::MemberLeft(party.into()))
    }

    /// The local or a remote party's role changed
    pub fn role_changed(&self) -> Result<()> {
        self.send(Command::RoleChanged)
    }

    pub fn relayed_session_started(&self, session: Arc<dyn TransportSession>) -> Result<()> {
        self.send(Command::RelayedStarted(session))
    }

    pub fn relayed_session_ended(&self) -> Result<()> {
        self.send(Command::RelayedEnded)
    }

    pub fn relayed_connectivity(&self, event: ConnectivityEvent) -> Result<()> {
        self.send(Command::RelayedConnectivity(event))
    }

    /// The remote party offered a direct session
    pub fn incoming_direct_session(
        &self,
        session: Arc<dyn TransportSession>,
        offer: SessionDescription,
    ) -> Result<()> {
        self.send(Command::IncomingDirect { session, offer })
    }

    /// The remote party terminated a direct session
    pub fn direct_session_terminated(
        &self,
        session_id: SessionId,
        reason: Option<String>,
    ) -> Result<()> {
        self.send(Command::DirectTerminated { session_id, reason })
    }

    /// Route a remote answer to the current direct session.
    ///
    /// Fails with [`Error::UnknownSession`] if `session_id` is not current.
    pub async fn direct_answer(
        &self,
        session_id: SessionId,
        answer: SessionDescription,
    ) -> Result<()> {
        self.request(|reply| Command::DirectAnswer {
            session_id,
            answer,
            reply,
        })
        .await?
    }

    pub async fn direct_ice_candidates(
        &self,
        session_id: SessionId,
        candidates: Vec<IceCandidate>,
    ) -> Result<()> {
        self.request(|reply| Command::DirectIceCandidates {
            session_id,
            candidates,
            reply,
        })
        .await?
    }

    pub fn remote_track_added(&self, transport: TransportKind, track: RemoteTrack) -> Result<()> {
        self.send(Command::RemoteTrackAdded { transport, track })
    }

    pub fn remote_track_removed(&self, transport: TransportKind, track: RemoteTrack) -> Result<()> {
        self.send(Command::RemoteTrackRemoved { transport, track })
    }

    pub fn replace_local_track(
        &self,
        old: Option<LocalTrack>,
        new: Option<LocalTrack>,
    ) -> Result<()> {
        self.send(Command::LocalTrack(LocalTrackOp::Replace { old, new }))
    }

    pub fn mute_local_track(&self, track: LocalTrack) -> Result<()> {
        self.send(Command::LocalTrack(LocalTrackOp::Mute(track)))
    }

    pub fn unmute_local_track(&self, track: LocalTrack) -> Result<()> {
        self.send(Command::LocalTrack(LocalTrackOp::Unmute(track)))
    }

    /// Start a direct session now, regardless of the automatic policy
    pub async fn start_direct(&self) -> Result<()> {
        self.request(|reply| Command::StartDirect { reply }).await?
    }

    pub async fn stop_direct(&self) -> Result<()> {
        self.request(|reply| Command::StopDirect { reply }).await?
    }

    /// Resolves once every command sent before it has been processed
    pub async fn flush(&self) -> Result<()> {
        self.request(Command::Barrier).await
    }

    /// Stop the controller, terminating any direct session
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }

    #[must_use]
    pub fn snapshot(&self) -> ControllerSnapshot {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ControllerSnapshot> {
        self.state.clone()
    }
}
