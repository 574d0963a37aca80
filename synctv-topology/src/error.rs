use thiserror::Error;

use crate::types::SessionId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Direct session already exists: {0}")]
    DirectSessionExists(SessionId),

    #[error("No direct session")]
    NoDirectSession,

    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("Not eligible for direct mode: {0}")]
    NotEligible(String),

    #[error("Direct mode disabled")]
    Disabled,

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Track migration error: {0}")]
    TrackMigration(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Controller closed")]
    ControllerClosed,

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Misuse of the controller API. Logged and ignored, never fatal.
    #[must_use]
    pub const fn is_protocol_misuse(&self) -> bool {
        matches!(
            self,
            Self::DirectSessionExists(_) | Self::NoDirectSession | Self::UnknownSession(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_misuse() {
        assert!(Error::NoDirectSession.is_protocol_misuse());
        assert!(Error::DirectSessionExists(SessionId::from("s1")).is_protocol_misuse());
        assert!(!Error::Negotiation("rejected".to_string()).is_protocol_misuse());
        assert!(!Error::ControllerClosed.is_protocol_misuse());
    }

    #[test]
    fn test_display() {
        let err = Error::UnknownSession(SessionId::from("abc"));
        assert_eq!(err.to_string(), "Unknown session: abc");
    }
}
