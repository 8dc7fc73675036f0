//! Session-description interface types.
//!
//! Text encoding and decoding of descriptions is a signaling-layer
//! collaborator concern; the engine consumes and produces the structured
//! transport parameters only. The types serialize with serde so embedders
//! can ship them over their signaling channel as-is.

use serde::{Deserialize, Serialize};

use shared::error::{Error, Result};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

impl DescriptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DescriptionKind::Offer => "offer",
            DescriptionKind::Pranswer => "pranswer",
            DescriptionKind::Answer => "answer",
            DescriptionKind::Rollback => "rollback",
        }
    }
}

impl std::fmt::Display for DescriptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DescriptionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "offer" => Ok(DescriptionKind::Offer),
            "pranswer" => Ok(DescriptionKind::Pranswer),
            "answer" => Ok(DescriptionKind::Answer),
            "rollback" => Ok(DescriptionKind::Rollback),
            _ => Err(Error::ErrInvalidDescriptionKind),
        }
    }
}

/// Role taken during the secure-transport handshake, from the
/// description's setup attribute.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupRole {
    /// Offerer default: accept either role
    #[default]
    Auto,
    /// Initiates the handshake
    Active,
    /// Awaits the handshake
    Passive,
}

/// One connectivity candidate in the collaborator's text form, with the
/// media-line identifier it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInit {
    pub candidate: String,
    pub mid: String,
}

/// Transport parameters the engine needs from a description: everything
/// else in the text body is opaque to the core.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportParams {
    pub setup: SetupRole,
    pub max_message_size: u32,
    /// Non-trickled candidates carried inside the description
    #[serde(default)]
    pub candidates: Vec<CandidateInit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    /// Opaque text body owned by the signaling codec; the engine passes
    /// it through untouched
    #[serde(default)]
    pub content: String,
    pub transport: TransportParams,
}

impl SessionDescription {
    pub fn offer(transport: TransportParams) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            content: String::new(),
            transport,
        }
    }

    pub fn answer(transport: TransportParams) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            content: String::new(),
            transport,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_string_round_trip() {
        for kind in [
            DescriptionKind::Offer,
            DescriptionKind::Pranswer,
            DescriptionKind::Answer,
            DescriptionKind::Rollback,
        ] {
            assert_eq!(kind.as_str().parse::<DescriptionKind>().unwrap(), kind);
        }
        assert!("bogus".parse::<DescriptionKind>().is_err());
    }

    #[test]
    fn test_description_serde_round_trip() {
        let desc = SessionDescription::offer(TransportParams {
            setup: SetupRole::Auto,
            max_message_size: 65536,
            candidates: vec![CandidateInit {
                candidate: "192.0.2.1:40000".into(),
                mid: "0".into(),
            }],
        });
        let json = serde_json::to_string(&desc).unwrap();
        let back: SessionDescription = serde_json::from_str(&json).unwrap();
        assert_eq!(back, desc);
    }
}
