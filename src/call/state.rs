use crate::peer::media::{LocalStream, RemoteStream};
use crate::store::CallSession;
use serde::Serialize;

/// Фаза звонка одного участника
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallPhase {
    Idle,
    Connecting,
    Connected,
    /// Транзитное состояние: после разборки попытки сразу Idle
    Failed,
    Ended,
}

impl CallPhase {
    pub fn can_transition_to(&self, next: CallPhase) -> bool {
        use CallPhase::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Ended, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Ended)
                | (Connected, Failed)
                | (Connected, Ended)
                | (Failed, Idle)
        )
    }

    pub fn is_in_call(&self) -> bool {
        matches!(self, CallPhase::Connecting | CallPhase::Connected)
    }

    /// Грубая метка для экрана
    pub fn status_label(&self) -> StatusLabel {
        match self {
            CallPhase::Idle | CallPhase::Failed => StatusLabel::Waiting,
            CallPhase::Connecting => StatusLabel::Connecting,
            CallPhase::Connected => StatusLabel::Connected,
            CallPhase::Ended => StatusLabel::Ended,
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StatusLabel {
    Waiting,
    Connecting,
    Connected,
    Ended,
}

/// Инициатор создал строку, присоединившийся отвечает на его offer
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Initiator,
    Joiner,
}

/// Наблюдаемое состояние звонка
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub phase: CallPhase,
    pub participant: Option<ParticipantRole>,
    pub call: Option<CallSession>,
    pub local_stream: Option<LocalStream>,
    pub remote_stream: Option<RemoteStream>,
    pub video_enabled: bool,
    pub audio_enabled: bool,
    pub last_error: Option<String>,
    pub attempt: u64,
}
