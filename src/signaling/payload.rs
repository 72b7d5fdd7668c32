use crate::error::SignalParseError;
use crate::peer::types::{IceCandidate, SdpKind, SessionDescription};
use crate::store::Role;
use serde::{Deserialize, Serialize};

/// Содержимое `signalingData`: одно сообщение за раз
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidate, from: Role },
}

impl SignalPayload {
    /// Разбор с проверкой; пустые sdp/candidate считаются битым сообщением
    pub fn parse(value: &serde_json::Value) -> Result<Self, SignalParseError> {
        let payload: Self = serde_json::from_value(value.clone())?;
        match &payload {
            Self::Offer { sdp } | Self::Answer { sdp } if sdp.trim().is_empty() => {
                Err(SignalParseError::EmptySdp)
            }
            Self::IceCandidate { candidate, .. } if candidate.candidate.trim().is_empty() => {
                Err(SignalParseError::EmptyCandidate)
            }
            _ => Ok(payload),
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value, SignalParseError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Автор сообщения: offer шлёт инициатор, answer вторая сторона
    pub fn author(&self, started_by: Role) -> Role {
        match self {
            Self::Offer { .. } => started_by,
            Self::Answer { .. } => started_by.opposite(),
            Self::IceCandidate { from, .. } => *from,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
        }
    }
}

impl From<SessionDescription> for SignalPayload {
    fn from(desc: SessionDescription) -> Self {
        match desc.kind {
            SdpKind::Offer => Self::Offer { sdp: desc.sdp },
            SdpKind::Answer => Self::Answer { sdp: desc.sdp },
        }
    }
}
