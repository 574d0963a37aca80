//! `SyncTV` topology controller
//!
//! Decides, per conference, whether media flows through the relayed session
//! (via the media relay) or through a direct session between the only two
//! parties in the room, and moves media between them without renegotiating
//! the session that is being left.
//!
//! ## Architecture
//!
//! - **`ModeController`**: Single-task state machine owning both sessions
//! - **`ControllerHandle`**: Cloneable entry point feeding it room and session events
//! - **`SignalingShim`**: The narrow room surface handed to a direct session
//! - **`TrackMigrator`**: Moves local tracks and re-announces remote ones
//! - **`EventFilter`**: Hides connection noise from the inactive transport
//!
//! ## Policy
//!
//! - Direct mode when exactly one other party is present
//! - Only moderators initiate; with two moderators the higher id does
//! - After a departure the switch is deferred, a join switches immediately
//! - A third party tears the direct session down at once
//!
//! ## Usage
//!
//! ```rust,ignore
//! use synctv_topology::{logging, Collaborators, Config, ModeController};
//!
//! let config = Config::load(Some("topology.toml"))?;
//! logging::init_logging(&config.logging)?;
//!
//! let handle = ModeController::spawn(config.topology, Collaborators {
//!     room,
//!     sessions,
//!     stats,
//!     events,
//! });
//!
//! handle.relayed_session_started(relayed)?;
//! handle.member_joined("9")?;
//! ```

pub mod config;
mod controller;
pub mod error;
pub mod events;
mod filter;
mod handle;
pub mod logging;
mod migrator;
pub mod room;
pub mod session;
mod shim;
pub mod stats;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use config::{Config, LoggingConfig, MigrationFailurePolicy, TopologyConfig};
pub use controller::{Collaborators, ControllerSnapshot, ModeController};
pub use error::{Error, Result};
pub use events::{BroadcastSink, ConferenceEvent, ConnectivityEvent, EventSink, Notification};
pub use filter::EventFilter;
pub use handle::ControllerHandle;
pub use migrator::{LocalTrackOp, TrackMigrator};
pub use room::{MediaPresence, PresenceListener, PresenceUpdate, Room};
pub use session::{
    IceCandidate, IceState, LocalTrack, NegotiationState, RemoteTrack, SessionDescription,
    SessionFactory, SessionOptions, SessionRole, TerminateReason, TransportSession,
};
pub use shim::{SessionEvent, SignalingLayer, SignalingShim};
pub use stats::{NoopStats, StatsSink};
pub use types::{
    ActiveTransport, MediaKind, Party, PartyId, PartyRole, SessionId, TrackId, TransportKind,
};
