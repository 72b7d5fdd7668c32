use crate::config::CallConfig;
use crate::error::TransportError;
use crate::peer::connection::WebRtcTransport;
use crate::peer::events::{CandidateHandler, ErrorHandler, RemoteStreamHandler};
use crate::peer::ice::validate_ice_servers;
use crate::peer::media::{LocalStream, MediaDevices};
use crate::peer::state::TransportState;
use crate::peer::types::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;

/// Обёртка над peer connection: всё, что трогает устройства и сеть
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Захватывает камеру/микрофон и добавляет треки в соединение
    async fn acquire_local_media(
        &self,
        video: bool,
        audio: bool,
    ) -> Result<LocalStream, TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(
        &self,
        remote: SessionDescription,
    ) -> Result<SessionDescription, TransportError>;

    async fn apply_answer(&self, remote: SessionDescription) -> Result<(), TransportError>;

    /// Ошибки только логируются
    async fn add_remote_candidate(&self, candidate: IceCandidate);

    fn set_video_enabled(&self, enabled: bool);

    fn set_audio_enabled(&self, enabled: bool);

    fn on_remote_stream(&self, handler: RemoteStreamHandler);

    fn on_local_ice_candidate(&self, handler: CandidateHandler);

    fn on_error(&self, handler: ErrorHandler);

    fn state(&self) -> TransportState;

    /// Идемпотентно: эффект только у первого вызова
    async fn cleanup(&self);
}

/// Новый транспорт на каждую попытку звонка
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Arc<dyn MediaTransport>;
}

pub struct WebRtcTransportFactory {
    devices: Arc<dyn MediaDevices>,
    config: CallConfig,
}

impl WebRtcTransportFactory {
    /// Свои ICE-серверы проверяются здесь, до первого peer connection
    pub fn new(devices: Arc<dyn MediaDevices>, config: CallConfig) -> Result<Self, TransportError> {
        if let Some(servers) = &config.ice_servers {
            validate_ice_servers(servers)?;
        }
        Ok(Self { devices, config })
    }
}

impl TransportFactory for WebRtcTransportFactory {
    fn create(&self) -> Arc<dyn MediaTransport> {
        Arc::new(WebRtcTransport::new(self.devices.clone(), self.config.clone()))
    }
}
