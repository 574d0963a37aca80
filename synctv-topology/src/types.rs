//! Common types used throughout the topology controller

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

/// Stable identifier of a party in the room.
///
/// Identifiers are short hex strings handed out by the room. The tie-break
/// between two equally privileged parties compares their numeric value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartyId(String);

impl PartyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value of the identifier, if it parses as hex
    #[must_use]
    pub fn numeric(&self) -> Option<u64> {
        u64::from_str_radix(&self.0, 16).ok()
    }

    /// Total order used by the initiation tie-break.
    ///
    /// Numeric identifiers compare by value; if either side does not parse,
    /// the raw strings are compared instead so both ends still agree.
    #[must_use]
    pub fn tie_break_cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.0.cmp(&other.0),
        }
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PartyId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PartyId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a media track
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackId(String);

impl TrackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TrackId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a transport session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new random session ID
    #[must_use]
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(12))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Which of the two transport sessions something belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Relayed,
    Direct,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relayed => f.write_str("relayed"),
            Self::Direct => f.write_str("direct"),
        }
    }
}

/// The transport currently carrying media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveTransport {
    /// Neither session is usable yet
    #[default]
    None,
    Relayed,
    Direct,
}

impl ActiveTransport {
    #[must_use]
    pub const fn is(self, kind: TransportKind) -> bool {
        matches!(
            (self, kind),
            (Self::Relayed, TransportKind::Relayed) | (Self::Direct, TransportKind::Direct)
        )
    }

    #[must_use]
    pub const fn kind(self) -> Option<TransportKind> {
        match self {
            Self::None => None,
            Self::Relayed => Some(TransportKind::Relayed),
            Self::Direct => Some(TransportKind::Direct),
        }
    }
}

impl From<TransportKind> for ActiveTransport {
    fn from(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Relayed => Self::Relayed,
            TransportKind::Direct => Self::Direct,
        }
    }
}

/// Media kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for MediaKind {
    fn from(codec_type: RTPCodecType) -> Self {
        match codec_type {
            RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

/// Privilege a party holds in the room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartyRole {
    Moderator,
    #[default]
    Participant,
}

impl PartyRole {
    #[must_use]
    pub const fn is_moderator(self) -> bool {
        matches!(self, Self::Moderator)
    }
}

/// Another party present in the room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub id: PartyId,
    pub role: PartyRole,
}

impl Party {
    pub fn new(id: impl Into<PartyId>, role: PartyRole) -> Self {
        Self { id: id.into(), role }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tie_break_numeric() {
        let five = PartyId::from("5");
        let nine = PartyId::from("9");
        assert_eq!(five.tie_break_cmp(&nine), Ordering::Less);
        assert_eq!(nine.tie_break_cmp(&five), Ordering::Greater);

        // Hex, not decimal: "a" (10) sorts above "9"
        assert_eq!(PartyId::from("a").tie_break_cmp(&nine), Ordering::Greater);
        // Numeric order differs from string order here
        assert_eq!(PartyId::from("ff").tie_break_cmp(&PartyId::from("100")), Ordering::Less);
    }

    #[test]
    fn test_tie_break_fallback() {
        let a = PartyId::from("user-b");
        let b = PartyId::from("5");
        assert_eq!(a.tie_break_cmp(&b), "user-b".cmp("5"));
        assert_eq!(b.tie_break_cmp(&a), "5".cmp("user-b"));
    }

    #[test]
    fn test_active_transport() {
        assert!(ActiveTransport::Direct.is(TransportKind::Direct));
        assert!(!ActiveTransport::Relayed.is(TransportKind::Direct));
        assert!(!ActiveTransport::None.is(TransportKind::Relayed));
        assert_eq!(ActiveTransport::None.kind(), None);
        assert_eq!(ActiveTransport::from(TransportKind::Relayed), ActiveTransport::Relayed);
    }

    #[test]
    fn test_media_kind_from_codec() {
        assert_eq!(MediaKind::from(RTPCodecType::Audio), MediaKind::Audio);
        assert_eq!(MediaKind::from(RTPCodecType::Video), MediaKind::Video);
    }
}
