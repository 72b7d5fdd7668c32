use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

/// Явное состояние обёртки над peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Соединение ещё не создано
    Uninitialized,
    /// Peer connection создан, треков нет
    Initialized,
    /// Локальные треки добавлены
    TracksAttached,
    /// Offer/answer обменяны, идёт ICE
    Negotiating,
    Connected,
    Failed,
    /// После cleanup(); конечное состояние
    Closed,
}

impl TransportState {
    /// Можно ли создать offer без переинициализации
    pub fn can_offer(&self, signaling: RTCSignalingState) -> bool {
        matches!(self, Self::Initialized | Self::TracksAttached)
            && signaling == RTCSignalingState::Stable
    }

    /// Можно ли принять удалённый offer
    pub fn can_answer(&self) -> bool {
        matches!(self, Self::Initialized | Self::TracksAttached)
    }

    /// Можно ли применить answer на ранее отправленный offer
    pub fn can_apply_answer(&self, signaling: RTCSignalingState) -> bool {
        matches!(self, Self::Negotiating) && signaling == RTCSignalingState::HaveLocalOffer
    }

    /// Переход по событию peer connection; `None` если состояние не меняется
    pub fn on_connection_state(&self, st: RTCPeerConnectionState) -> Option<Self> {
        if *self == Self::Closed {
            return None;
        }
        match st {
            RTCPeerConnectionState::Connected => Some(Self::Connected),
            RTCPeerConnectionState::Failed => Some(Self::Failed),
            _ => None,
        }
    }
}
