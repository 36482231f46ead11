//! Signaling envelope exchanged over the room's pub/sub topic.
//!
//! The wire shape is a flat JSON object keyed by `type`; decoding turns it into
//! the closed [`Signal`] enum and rejects any message whose body does not match
//! its type.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::peer::PeerId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// The ICE username fragment (`a=ice-ufrag:`) of the first media section.
    pub fn ice_ufrag(&self) -> Option<&str> {
        self.sdp
            .split_whitespace()
            .find_map(|token| token.strip_prefix("a=ice-ufrag:"))
            .filter(|ufrag| !ufrag.is_empty())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Whether the candidate may belong to a description with `ufrag`.
    /// Only two known fragments that differ rule it out.
    pub fn matches_ufrag(&self, ufrag: Option<&str>) -> bool {
        match (self.username_fragment.as_deref(), ufrag) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<i64>,
}

impl Participant {
    pub fn new(id: impl Into<PeerId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            joined_at: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Join,
    Leave,
    Offer,
    Answer,
    Ice,
}

impl SignalKind {
    pub fn is_unicast(self) -> bool {
        matches!(self, SignalKind::Offer | SignalKind::Answer | SignalKind::Ice)
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalKind::Join => "join",
            SignalKind::Leave => "leave",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Ice => "ice",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    Join { existing: Vec<Participant> },
    Leave,
    Offer {
        description: SessionDescription,
        ice_restart: bool,
    },
    Answer { description: SessionDescription },
    Ice { candidate: IceCandidate },
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Join { .. } => SignalKind::Join,
            Signal::Leave => SignalKind::Leave,
            Signal::Offer { .. } => SignalKind::Offer,
            Signal::Answer { .. } => SignalKind::Answer,
            Signal::Ice { .. } => SignalKind::Ice,
        }
    }
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("malformed signaling message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{0} message has no body")]
    MissingBody(SignalKind),
    #[error("{0} message has no recipient")]
    MissingRecipient(SignalKind),
    #[error("{kind} message carries a description of type {found:?}")]
    DescriptionMismatch { kind: SignalKind, found: SdpKind },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub room: String,
    pub from: PeerId,
    pub to: Option<PeerId>,
    pub signal: Signal,
    pub timestamp: Option<i64>,
}

impl Envelope {
    pub fn broadcast(room: impl Into<String>, from: PeerId, signal: Signal) -> Self {
        Self {
            room: room.into(),
            from,
            to: None,
            signal,
            timestamp: Some(now_millis()),
        }
    }

    pub fn unicast(room: impl Into<String>, from: PeerId, to: PeerId, signal: Signal) -> Self {
        Self {
            room: room.into(),
            from,
            to: Some(to),
            signal,
            timestamp: Some(now_millis()),
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.signal.kind()
    }

    pub fn encode(&self) -> Result<Vec<u8>, SignalError> {
        Ok(serde_json::to_vec(&WireMessage::from(self))?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SignalError> {
        let wire: WireMessage = serde_json::from_slice(bytes)?;
        Self::try_from(wire)
    }
}

fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    room_id: String,
    from_user_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to_user_id: Option<PeerId>,
    #[serde(rename = "type")]
    kind: SignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    answer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidate: Option<IceCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    existing_participants: Option<Vec<Participant>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ice_restart: Option<bool>,
}

impl From<&Envelope> for WireMessage {
    fn from(envelope: &Envelope) -> Self {
        let mut wire = WireMessage {
            room_id: envelope.room.clone(),
            from_user_id: envelope.from.clone(),
            to_user_id: envelope.to.clone(),
            kind: envelope.kind(),
            offer: None,
            answer: None,
            candidate: None,
            existing_participants: None,
            timestamp: envelope.timestamp,
            ice_restart: None,
        };
        match &envelope.signal {
            Signal::Join { existing } => {
                if !existing.is_empty() {
                    wire.existing_participants = Some(existing.clone());
                }
            }
            Signal::Leave => {}
            Signal::Offer {
                description,
                ice_restart,
            } => {
                wire.offer = Some(description.clone());
                wire.ice_restart = ice_restart.then_some(true);
            }
            Signal::Answer { description } => wire.answer = Some(description.clone()),
            Signal::Ice { candidate } => wire.candidate = Some(candidate.clone()),
        }
        wire
    }
}

impl TryFrom<WireMessage> for Envelope {
    type Error = SignalError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let kind = wire.kind;
        if kind.is_unicast() && wire.to_user_id.is_none() {
            return Err(SignalError::MissingRecipient(kind));
        }
        let signal = match kind {
            SignalKind::Join => Signal::Join {
                existing: wire.existing_participants.unwrap_or_default(),
            },
            SignalKind::Leave => Signal::Leave,
            SignalKind::Offer => {
                let description = wire.offer.ok_or(SignalError::MissingBody(kind))?;
                if description.kind != SdpKind::Offer {
                    return Err(SignalError::DescriptionMismatch {
                        kind,
                        found: description.kind,
                    });
                }
                Signal::Offer {
                    description,
                    ice_restart: wire.ice_restart.unwrap_or(false),
                }
            }
            SignalKind::Answer => {
                let description = wire.answer.ok_or(SignalError::MissingBody(kind))?;
                if description.kind != SdpKind::Answer {
                    return Err(SignalError::DescriptionMismatch {
                        kind,
                        found: description.kind,
                    });
                }
                Signal::Answer { description }
            }
            SignalKind::Ice => Signal::Ice {
                candidate: wire.candidate.ok_or(SignalError::MissingBody(kind))?,
            },
        };
        Ok(Envelope {
            room: wire.room_id,
            from: wire.from_user_id,
            to: wire.to_user_id,
            signal,
            timestamp: wire.timestamp,
        })
    }
}
