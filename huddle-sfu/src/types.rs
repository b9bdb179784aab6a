//! Common types used throughout the signaling layer

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SignalError;

/// Longest room name accepted on JOIN
pub const MAX_ROOM_NAME_LEN: usize = 128;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier assigned to every inbound connection
    PeerId
);
string_id!(
    /// Media-engine router identifier
    RouterId
);
string_id!(
    /// Media-engine WebRTC transport identifier
    TransportId
);
string_id!(
    /// Media-engine producer identifier
    ProducerId
);
string_id!(
    /// Media-engine consumer identifier
    ConsumerId
);

/// Name of a conferencing room, as supplied by clients on JOIN
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomName(String);

impl RoomName {
    /// Validate a client-supplied room name.
    ///
    /// Surrounding whitespace is trimmed; empty or overlong names are rejected.
    pub fn parse(raw: &str) -> Result<Self, SignalError> {
        let name = raw.trim();
        if name.is_empty() {
            return Err(SignalError::Protocol("roomName must not be empty".to_string()));
        }
        if name.chars().count() > MAX_ROOM_NAME_LEN {
            return Err(SignalError::Protocol(format!(
                "roomName exceeds {MAX_ROOM_NAME_LEN} characters"
            )));
        }
        Ok(Self(name.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Media kind of a producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a WebRTC transport, seen from the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    /// Carries the peer's producers to the engine
    Send,
    /// Carries one remote producer's media to the peer
    Recv,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => f.write_str("send"),
            Self::Recv => f.write_str("recv"),
        }
    }
}
