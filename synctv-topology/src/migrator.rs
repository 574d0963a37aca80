//! Track migration between the relayed and direct sessions
//!
//! Local tracks move by attaching/detaching them from a session's media
//! engine; the remote party is never renegotiated and simply sees a silent
//! track while it is detached. Remote tracks move by synthesizing added and
//! removed notifications for everything a session currently knows about.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::events::{ConferenceEvent, EventSink, Notification};
use crate::session::{LocalTrack, TransportSession};
use crate::types::TransportKind;

/// Local track operation fanned out to every live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalTrackOp {
    Replace {
        old: Option<LocalTrack>,
        new: Option<LocalTrack>,
    },
    Mute(LocalTrack),
    Unmute(LocalTrack),
}

#[derive(Clone)]
pub struct TrackMigrator {
    events: Arc<dyn EventSink>,
}

impl TrackMigrator {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self { events }
    }

    /// Add tracks to a session that has not negotiated yet
    pub async fn add_local_tracks(
        session: Arc<dyn TransportSession>,
        tracks: Vec<LocalTrack>,
    ) -> Result<()> {
        if tracks.is_empty() {
            return Ok(());
        }
        let count = tracks.len();
        session.add_local_tracks(tracks).await.map_err(|e| {
            warn!(session_id = %session.id(), error = %e, "Failed to add local tracks");
            Error::TrackMigration(e.to_string())
        })?;
        debug!(session_id = %session.id(), count, "Added local tracks");
        Ok(())
    }

    pub async fn attach_local_tracks(
        session: Arc<dyn TransportSession>,
        tracks: Vec<LocalTrack>,
    ) -> Result<()> {
        if tracks.is_empty() {
            return Ok(());
        }
        let count = tracks.len();
        session.attach_local_tracks(tracks).await.map_err(|e| {
            warn!(session_id = %session.id(), error = %e, "Failed to attach local tracks");
            Error::TrackMigration(e.to_string())
        })?;
        debug!(session_id = %session.id(), count, "Attached local tracks");
        Ok(())
    }

    pub async fn detach_local_tracks(
        session: Arc<dyn TransportSession>,
        tracks: Vec<LocalTrack>,
    ) -> Result<()> {
        if tracks.is_empty() {
            return Ok(());
        }
        let count = tracks.len();
        session.detach_local_tracks(tracks).await.map_err(|e| {
            warn!(session_id = %session.id(), error = %e, "Failed to detach local tracks");
            Error::TrackMigration(e.to_string())
        })?;
        debug!(session_id = %session.id(), count, "Detached local tracks");
        Ok(())
    }

    pub async fn apply(session: Arc<dyn TransportSession>, op: LocalTrackOp) -> Result<()> {
        let result = match op {
            LocalTrackOp::Replace { old, new } => session.replace_track(old, new).await,
            LocalTrackOp::Mute(track) => session.remove_track_as_mute(track).await,
            LocalTrackOp::Unmute(track) => session.add_track_as_unmute(track).await,
        };
        result.map_err(|e| {
            warn!(session_id = %session.id(), error = %e, "Local track operation failed");
            Error::TrackMigration(e.to_string())
        })
    }

    /// Announce every remote track of `session` as added. Returns the count.
    pub fn project_remote_tracks(
        &self,
        transport: TransportKind,
        session: &dyn TransportSession,
    ) -> usize {
        let tracks = session.remote_tracks();
        let count = tracks.len();
        for track in tracks {
            self.events.emit(Notification::from_transport(
                transport,
                ConferenceEvent::RemoteTrackAdded { track },
            ));
        }
        debug!(session_id = %session.id(), %transport, count, "Projected remote tracks");
        count
    }

    /// Announce every remote track of `session` as removed. Returns the count.
    pub fn withdraw_remote_tracks(
        &self,
        transport: TransportKind,
        session: &dyn TransportSession,
    ) -> usize {
        let tracks = session.remote_tracks();
        let count = tracks.len();
        for track in tracks {
            self.events.emit(Notification::from_transport(
                transport,
                ConferenceEvent::RemoteTrackRemoved { track },
            ));
        }
        debug!(session_id = %session.id(), %transport, count, "Withdrew remote tracks");
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::RemoteTrack;
    use crate::test_support::{FakeSession, RecordingSink, SessionCall};
    use crate::types::MediaKind;

    fn tracks() -> Vec<LocalTrack> {
        vec![
            LocalTrack::new("mic", MediaKind::Audio),
            LocalTrack::new("cam", MediaKind::Video),
        ]
    }

    #[tokio::test]
    async fn test_attach_and_detach() {
        let session = FakeSession::relayed("jvb");
        TrackMigrator::detach_local_tracks(session.clone(), tracks()).await.unwrap();
        assert!(session.local_tracks().is_empty());

        TrackMigrator::attach_local_tracks(session.clone(), tracks()).await.unwrap();
        assert_eq!(session.local_tracks(), tracks());
        assert_eq!(
            session.calls(),
            vec![SessionCall::DetachLocalTracks(2), SessionCall::AttachLocalTracks(2)]
        );
    }

    #[tokio::test]
    async fn test_empty_track_list_skips_session() {
        let session = FakeSession::relayed("jvb");
        TrackMigrator::attach_local_tracks(session.clone(), Vec::new()).await.unwrap();
        assert!(session.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_reported() {
        let session = FakeSession::relayed("jvb");
        session.fail_track_ops(true);
        let err = TrackMigrator::detach_local_tracks(session.clone(), tracks()).await.unwrap_err();
        assert!(matches!(err, Error::TrackMigration(_)));
    }

    #[tokio::test]
    async fn test_apply_routes_operations() {
        let session = FakeSession::relayed("jvb");
        let mic = LocalTrack::new("mic", MediaKind::Audio);

        TrackMigrator::apply(session.clone(), LocalTrackOp::Mute(mic.clone())).await.unwrap();
        TrackMigrator::apply(session.clone(), LocalTrackOp::Unmute(mic.clone())).await.unwrap();
        TrackMigrator::apply(session.clone(), LocalTrackOp::Replace { old: Some(mic), new: None })
            .await
            .unwrap();

        assert_eq!(
            session.calls(),
            vec![
                SessionCall::RemoveTrackAsMute,
                SessionCall::AddTrackAsUnmute,
                SessionCall::ReplaceTrack,
            ]
        );
    }

    #[test]
    fn test_project_and_withdraw() {
        let sink = Arc::new(RecordingSink::default());
        let migrator = TrackMigrator::new(sink.clone());
        let session = FakeSession::relayed("jvb");
        let audio = RemoteTrack::new("a9", "9", MediaKind::Audio);
        let video = RemoteTrack::new("v9", "9", MediaKind::Video);
        session.add_remote_track(audio.clone());
        session.add_remote_track(video.clone());

        assert_eq!(migrator.withdraw_remote_tracks(TransportKind::Relayed, session.as_ref()), 2);
        assert_eq!(migrator.project_remote_tracks(TransportKind::Relayed, session.as_ref()), 2);

        assert_eq!(
            sink.events(),
            vec![
                ConferenceEvent::RemoteTrackRemoved { track: audio.clone() },
                ConferenceEvent::RemoteTrackRemoved { track: video.clone() },
                ConferenceEvent::RemoteTrackAdded { track: audio },
                ConferenceEvent::RemoteTrackAdded { track: video },
            ]
        );
        assert!(sink.origins().iter().all(|o| *o == Some(TransportKind::Relayed)));
    }
}
