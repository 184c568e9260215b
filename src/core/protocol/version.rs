// src/core/protocol/version.rs

//! The LLRP protocol version carried in every frame header.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A negotiated LLRP protocol version.
///
/// The numeric value is the 3-bit version field of the frame header. All
/// spontaneous messages a session emits are tagged with the session's
/// current version, which can change mid-session through version negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ProtocolVersion {
    /// LLRP 1.0.1, wire value 1.
    V1_0_1,
    /// LLRP 1.1, wire value 2.
    V1_1,
}

impl ProtocolVersion {
    /// The highest version this server implements.
    pub const MAX_SUPPORTED: ProtocolVersion = ProtocolVersion::V1_1;

    pub fn as_u8(self) -> u8 {
        match self {
            ProtocolVersion::V1_0_1 => 1,
            ProtocolVersion::V1_1 => 2,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(ProtocolVersion::V1_0_1),
            2 => Some(ProtocolVersion::V1_1),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::V1_0_1 => write!(f, "1.0.1"),
            ProtocolVersion::V1_1 => write!(f, "1.1"),
        }
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = String;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        ProtocolVersion::from_u8(raw).ok_or_else(|| format!("unsupported protocol version {raw}"))
    }
}

impl From<ProtocolVersion> for u8 {
    fn from(v: ProtocolVersion) -> u8 {
        v.as_u8()
    }
}
