//! Локальные и удалённые медиапотоки, граница с устройствами захвата.
//!
//! Камера и микрофон живут вне крейта: приложение реализует [`MediaDevices`]
//! или берёт [`SampleDevices`] и пишет закодированные кадры в выданные треки
//! через [`LocalTrack::write_sample`].

use crate::config::{AudioConstraints, CallConfig, VideoConstraints};
use crate::error::{MediaAccessError, MediaAccessReason, TransportError};
use crate::utils::random_id;
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub(crate) fn codec_type(&self) -> RTPCodecType {
        match self {
            Self::Audio => RTPCodecType::Audio,
            Self::Video => RTPCodecType::Video,
        }
    }

    pub(crate) fn from_codec_type(t: RTPCodecType) -> Option<Self> {
        match t {
            RTPCodecType::Audio => Some(Self::Audio),
            RTPCodecType::Video => Some(Self::Video),
            _ => None,
        }
    }

    fn codec(&self) -> RTCRtpCodecCapability {
        match self {
            Self::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            Self::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        }
    }
}

/// Ограничения захвата, передаются устройству как есть
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: Option<VideoConstraints>,
    pub audio: Option<AudioConstraints>,
}

impl MediaConstraints {
    pub fn from_config(config: &CallConfig, video: bool, audio: bool) -> Self {
        Self {
            video: video.then(|| config.video.clone()),
            audio: audio.then(|| config.audio.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }
}

struct LocalTrackInner {
    kind: MediaKind,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

/// Локальный трек захвата. Клоны разделяют одно состояние.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<LocalTrackInner>,
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id())
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

impl LocalTrack {
    pub fn new(kind: MediaKind, stream_id: &str) -> Self {
        let id = format!("{}-{}", kind_label(kind), random_id());
        let rtc = Arc::new(TrackLocalStaticSample::new(
            kind.codec(),
            id,
            stream_id.to_owned(),
        ));
        Self {
            inner: Arc::new(LocalTrackInner {
                kind,
                rtc,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        self.inner.rtc.id()
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        !self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Останавливает трек; `true` только при первом вызове
    pub fn stop(&self) -> bool {
        let first = !self.inner.stopped.swap(true, Ordering::SeqCst);
        if first {
            debug!("Stopped local {} track {}", kind_label(self.kind()), self.id());
        }
        first
    }

    pub(crate) fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.inner.rtc.clone()
    }

    /// Отправка закодированного кадра; выключенный или остановленный трек кадр отбрасывает
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<bool, TransportError> {
        if !self.is_live() || !self.is_enabled() {
            return Ok(false);
        }
        self.inner
            .rtc
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("write sample: {e}")))?;
        Ok(true)
    }
}

fn kind_label(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Audio => "audio",
        MediaKind::Video => "video",
    }
}

/// Локальный поток: принадлежит оркестратору, останавливается на любом выходе
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn set_enabled(&self, kind: MediaKind, enabled: bool) {
        for track in self.tracks_of(kind) {
            track.set_enabled(enabled);
        }
    }

    /// Останавливает все треки, возвращает число реально остановленных
    pub fn stop(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }
}

/// Удалённый поток: получен, а не создан, поэтому не останавливается локально
#[derive(Clone)]
pub struct RemoteStream {
    id: String,
    tracks: Vec<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

impl RemoteStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<TrackRemote>] {
        &self.tracks
    }

    pub(crate) fn push(&mut self, track: Arc<TrackRemote>) {
        self.tracks.push(track);
    }
}

/// Доступ к камере и микрофону
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, MediaAccessError>;
}

/// Состояние одного устройства для [`SampleDevices`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceStatus {
    Available,
    /// Отказ платформы с её именем ошибки, например `NotAllowedError`
    Refused(String),
}

/// Устройства, выдающие треки, которые наполняются через `write_sample`
pub struct SampleDevices {
    camera: DeviceStatus,
    microphone: DeviceStatus,
    issued: Mutex<Vec<LocalStream>>,
}

impl Default for SampleDevices {
    fn default() -> Self {
        Self::new(DeviceStatus::Available, DeviceStatus::Available)
    }
}

impl SampleDevices {
    pub fn new(camera: DeviceStatus, microphone: DeviceStatus) -> Self {
        Self {
            camera,
            microphone,
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Все выданные потоки, в порядке выдачи
    pub fn issued_streams(&self) -> Vec<LocalStream> {
        self.issued
            .lock()
            .map(|issued| issued.clone())
            .unwrap_or_default()
    }

    fn check(status: &DeviceStatus) -> Result<(), MediaAccessError> {
        match status {
            DeviceStatus::Available => Ok(()),
            DeviceStatus::Refused(name) => Err(MediaAccessError::new(
                MediaAccessReason::from_platform(name),
            )),
        }
    }
}

#[async_trait]
impl MediaDevices for SampleDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, MediaAccessError> {
        if constraints.is_empty() {
            return Err(MediaAccessError::new(MediaAccessReason::Unsupported));
        }
        if constraints.video.is_some() {
            Self::check(&self.camera)?;
        }
        if constraints.audio.is_some() {
            Self::check(&self.microphone)?;
        }

        let stream_id = format!("stream-{}", random_id());
        let mut tracks = Vec::new();
        if constraints.audio.is_some() {
            tracks.push(LocalTrack::new(MediaKind::Audio, &stream_id));
        }
        if constraints.video.is_some() {
            tracks.push(LocalTrack::new(MediaKind::Video, &stream_id));
        }
        let stream = LocalStream::new(stream_id, tracks);

        if let Ok(mut issued) = self.issued.lock() {
            issued.push(stream.clone());
        }
        Ok(stream)
    }
}
