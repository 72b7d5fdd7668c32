use crate::config::CallConfig;
use crate::error::TransportError;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::events::{CandidateHandler, ErrorHandler, Observers, RemoteStreamHandler};
use crate::peer::ice::{apply_candidate, apply_pending_candidates, rtc_config, PendingCandidates};
use crate::peer::media::{LocalStream, MediaConstraints, MediaDevices, MediaKind, RemoteStream};
use crate::peer::state::TransportState;
use crate::peer::transport::MediaTransport;
use crate::peer::types::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

/// Период ожидания восстановления после Disconnected
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Состояние, разделяемое с обработчиками peer connection
#[derive(Default)]
struct Shared {
    state: StdMutex<Option<TransportState>>,
    /// Поколение peer connection; обработчики старых соединений молчат
    generation: AtomicU64,
    observers: Observers,
    pending: PendingCandidates,
    local: StdMutex<Option<LocalStream>>,
    remote: StdMutex<HashMap<String, RemoteStream>>,
    disconnect_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn state(&self) -> TransportState {
        self.state
            .lock()
            .ok()
            .and_then(|st| *st)
            .unwrap_or(TransportState::Uninitialized)
    }

    fn set_state(&self, next: TransportState) {
        if let Ok(mut st) = self.state.lock() {
            if *st == Some(TransportState::Closed) {
                return;
            }
            if *st != Some(next) {
                debug!("Transport state {:?} -> {:?}", st.unwrap_or(TransportState::Uninitialized), next);
            }
            *st = Some(next);
        }
    }

    fn is_current(&self, gen: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == gen
    }

    fn abort_disconnect_task(&self) {
        if let Some(handle) = self.disconnect_task.lock().ok().and_then(|mut t| t.take()) {
            debug!("Aborting pending disconnect task");
            handle.abort();
        }
    }
}

struct Conn {
    pc: Option<Arc<RTCPeerConnection>>,
    senders: Vec<Arc<RTCRtpSender>>,
}

/// WebRTC-реализация транспорта: один peer connection, один локальный поток
pub struct WebRtcTransport {
    devices: Arc<dyn MediaDevices>,
    config: CallConfig,
    conn: Mutex<Conn>,
    shared: Arc<Shared>,
}

fn sig(what: &str) -> impl FnOnce(webrtc::Error) -> TransportError + '_ {
    move |e| TransportError::Signaling(format!("{what}: {e}"))
}

impl WebRtcTransport {
    pub fn new(devices: Arc<dyn MediaDevices>, config: CallConfig) -> Self {
        Self {
            devices,
            config,
            conn: Mutex::new(Conn {
                pc: None,
                senders: Vec::new(),
            }),
            shared: Arc::new(Shared::default()),
        }
    }

    /// Текущий peer connection, для диагностики
    pub async fn peer_connection(&self) -> Option<Arc<RTCPeerConnection>> {
        self.conn.lock().await.pc.clone()
    }

    pub fn pending_candidates(&self) -> usize {
        self.shared.pending.len()
    }

    /// создаём Peer со всеми обработчиками, привязанными к поколению `gen`
    async fn new_peer(&self, gen: u64) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(sig("register codecs"))?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(sig("register interceptors"))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = rtc_config(self.config.ice_servers.as_deref());
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(sig("create peer connection"))?,
        );

        let shared = self.shared.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let shared = shared.clone();
            Box::pin(async move {
                if !shared.is_current(gen) {
                    return;
                }
                match cand {
                    Some(c) => match c.to_json() {
                        Ok(init) => {
                            let candidate = IceCandidate::from(init);
                            dump_candidate("LOCAL", &candidate);
                            shared.observers.emit_local_candidate(&candidate);
                        }
                        Err(e) => warn!("Failed to serialize local candidate: {:?}", e),
                    },
                    // cand == None означает конец сбора
                    None => debug!("ICE candidate gathering completed"),
                }
            })
        }));

        pc.on_ice_gathering_state_change(Box::new(move |state| {
            debug!("ICE gathering state changed to: {:?}", state);
            Box::pin(async {})
        }));

        let shared = self.shared.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let shared = shared.clone();
                Box::pin(async move {
                    if !shared.is_current(gen) {
                        return;
                    }
                    let stream_id = track.stream_id().to_string();
                    info!("Remote {} track arrived on stream {}", track.kind(), stream_id);
                    let stream = match shared.remote.lock() {
                        Ok(mut remote) => {
                            let entry = remote
                                .entry(stream_id.clone())
                                .or_insert_with(|| RemoteStream::new(stream_id));
                            entry.push(track);
                            entry.clone()
                        }
                        Err(_) => return,
                    };
                    shared.observers.emit_remote_stream(&stream);
                })
            },
        ));

        let shared = self.shared.clone();
        let pc_weak = Arc::downgrade(&pc);
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            info!("Peer connection state changed to: {:?}", st);
            if !shared.is_current(gen) {
                return Box::pin(async {});
            }
            if let Some(next) = shared.state().on_connection_state(st) {
                shared.set_state(next);
            }

            match st {
                RTCPeerConnectionState::Connected => shared.abort_disconnect_task(),
                RTCPeerConnectionState::Disconnected => {
                    start_grace_period(&shared, pc_weak.clone(), gen);
                }
                RTCPeerConnectionState::Failed => {
                    shared.abort_disconnect_task();
                    if let Some(pc) = pc_weak.upgrade() {
                        tokio::spawn(async move {
                            dump_selected_pair(&pc, "BEFORE-FAIL").await;
                        });
                    }
                    shared.observers.emit_error(&TransportError::ConnectionFailed(
                        "peer connection failed".into(),
                    ));
                }
                _ => {}
            }
            Box::pin(async {})
        }));

        Ok(pc)
    }

    async fn ensure_connection(
        &self,
        conn: &mut Conn,
    ) -> Result<Arc<RTCPeerConnection>, TransportError> {
        if self.shared.state() == TransportState::Closed {
            return Err(TransportError::Signaling("transport is closed".into()));
        }
        if let Some(pc) = &conn.pc {
            return Ok(pc.clone());
        }
        let gen = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let pc = self.new_peer(gen).await?;
        conn.pc = Some(pc.clone());
        self.shared.set_state(TransportState::Initialized);
        Ok(pc)
    }

    async fn attach_tracks(
        &self,
        pc: &Arc<RTCPeerConnection>,
        conn: &mut Conn,
        stream: &LocalStream,
    ) -> Result<(), TransportError> {
        for track in stream.tracks().iter().filter(|t| t.is_live()) {
            let sender = pc
                .add_track(track.rtc_track())
                .await
                .map_err(sig("add local track"))?;

            // RTCP надо вычитывать, иначе интерсепторы встанут
            let reader = sender.clone();
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while reader.read(&mut rtcp_buf).await.is_ok() {}
            });
            conn.senders.push(sender);
        }
        self.shared.set_state(TransportState::TracksAttached);
        Ok(())
    }

    /// Явный переход "пересоздать соединение": новый peer, старые треки заново
    async fn reinitialize(&self, conn: &mut Conn) -> Result<Arc<RTCPeerConnection>, TransportError> {
        warn!("Re-initializing peer connection before offer");
        self.shared.abort_disconnect_task();
        let gen = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        conn.senders.clear();
        if let Some(old) = conn.pc.take() {
            if let Err(e) = old.close().await {
                warn!("Failed to close stale peer connection: {:?}", e);
            }
        }
        self.shared.pending.drain();

        let pc = self.new_peer(gen).await?;
        conn.pc = Some(pc.clone());
        self.shared.set_state(TransportState::Initialized);

        let local = self.shared.local.lock().ok().and_then(|l| l.clone());
        if let Some(stream) = local {
            self.attach_tracks(&pc, conn, &stream).await?;
        }
        Ok(pc)
    }

    /// Offer должен запрашивать и звук, и видео
    async fn ensure_receive_transceivers(
        &self,
        pc: &RTCPeerConnection,
    ) -> Result<(), TransportError> {
        let transceivers = pc.get_transceivers().await;
        for kind in [MediaKind::Audio, MediaKind::Video] {
            let present = transceivers.iter().any(|t| t.kind() == kind.codec_type());
            if !present {
                pc.add_transceiver_from_kind(
                    kind.codec_type(),
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(sig("add receive transceiver"))?;
            }
        }
        Ok(())
    }

    async fn offer_on(&self, pc: &Arc<RTCPeerConnection>) -> Result<SessionDescription, TransportError> {
        self.ensure_receive_transceivers(pc).await?;
        let offer = pc.create_offer(None).await.map_err(sig("create offer"))?;
        pc.set_local_description(offer)
            .await
            .map_err(sig("set local offer"))?;
        let local = pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Signaling("local offer missing".into()))?;
        self.shared.set_state(TransportState::Negotiating);
        SessionDescription::from_rtc(&local)
    }

    fn offer_ready(&self, pc: &RTCPeerConnection) -> bool {
        let st = pc.connection_state();
        self.shared.state().can_offer(pc.signaling_state())
            && st != RTCPeerConnectionState::Closed
            && st != RTCPeerConnectionState::Failed
    }
}

fn start_grace_period(shared: &Arc<Shared>, pc: Weak<RTCPeerConnection>, gen: u64) {
    let Ok(mut task) = shared.disconnect_task.lock() else {
        return;
    };
    // уже ожидаем? – ничего не делаем
    if task.is_some() {
        return;
    }
    let watcher = shared.clone();
    *task = Some(tokio::spawn(async move {
        info!("Grace period started, waiting {} s", GRACE_PERIOD.as_secs());
        sleep(GRACE_PERIOD).await;
        if let Ok(mut t) = watcher.disconnect_task.lock() {
            t.take();
        }
        if !watcher.is_current(gen) {
            return;
        }
        let recovered = pc
            .upgrade()
            .map(|pc| pc.connection_state() == RTCPeerConnectionState::Connected)
            .unwrap_or(false);
        if recovered {
            info!("Connection recovered during grace period");
        } else {
            watcher.set_state(TransportState::Failed);
            watcher.observers.emit_error(&TransportError::ConnectionFailed(
                "connection lost and did not recover".into(),
            ));
        }
    }));
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    async fn acquire_local_media(
        &self,
        video: bool,
        audio: bool,
    ) -> Result<LocalStream, TransportError> {
        let mut conn = self.conn.lock().await;
        let pc = self.ensure_connection(&mut conn).await?;

        // повторный захват: старый поток останавливаем и снимаем с соединения
        let previous = self.shared.local.lock().ok().and_then(|mut l| l.take());
        if let Some(old) = previous {
            let stopped = old.stop();
            debug!("Released previous local stream ({stopped} tracks stopped)");
            for sender in conn.senders.drain(..) {
                if let Err(e) = pc.remove_track(&sender).await {
                    warn!("Failed to remove previous track: {:?}", e);
                }
            }
        }

        let constraints = MediaConstraints::from_config(&self.config, video, audio);
        let stream = self.devices.get_user_media(&constraints).await.map_err(|e| {
            warn!("Media access refused: {}", e.reason);
            TransportError::MediaAccess(e)
        })?;

        if let Err(e) = self.attach_tracks(&pc, &mut conn, &stream).await {
            stream.stop();
            return Err(e);
        }
        if let Ok(mut local) = self.shared.local.lock() {
            *local = Some(stream.clone());
        }
        info!(
            "Local stream {} attached with {} tracks",
            stream.id(),
            stream.tracks().len()
        );
        Ok(stream)
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let mut conn = self.conn.lock().await;
        if self.shared.state() == TransportState::Closed {
            return Err(TransportError::Signaling("transport is closed".into()));
        }

        let mut healed = false;
        let mut pc = match conn.pc.clone() {
            Some(pc) if self.offer_ready(&pc) => pc,
            _ => {
                healed = true;
                self.reinitialize(&mut conn).await?
            }
        };

        loop {
            match self.offer_on(&pc).await {
                Ok(offer) => return Ok(offer),
                Err(e) if !healed => {
                    warn!("Offer failed ({e}), retrying on a fresh connection");
                    healed = true;
                    pc = self.reinitialize(&mut conn).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn create_answer(
        &self,
        remote: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        if remote.kind != SdpKind::Offer {
            return Err(TransportError::Signaling("expected a remote offer".into()));
        }
        let mut conn = self.conn.lock().await;
        let pc = self.ensure_connection(&mut conn).await?;
        let state = self.shared.state();
        if !state.can_answer() {
            return Err(TransportError::Signaling(format!(
                "cannot answer in state {state:?}"
            )));
        }

        pc.set_remote_description(remote.to_rtc()?)
            .await
            .map_err(sig("set remote offer"))?;
        apply_pending_candidates(&pc, &self.shared.pending).await;

        let answer = pc.create_answer(None).await.map_err(sig("create answer"))?;
        pc.set_local_description(answer)
            .await
            .map_err(sig("set local answer"))?;
        let local = pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Signaling("local answer missing".into()))?;
        self.shared.set_state(TransportState::Negotiating);
        SessionDescription::from_rtc(&local)
    }

    async fn apply_answer(&self, remote: SessionDescription) -> Result<(), TransportError> {
        if remote.kind != SdpKind::Answer {
            return Err(TransportError::Signaling("expected a remote answer".into()));
        }
        let conn = self.conn.lock().await;
        let pc = conn
            .pc
            .clone()
            .ok_or_else(|| TransportError::Signaling("no peer connection".into()))?;
        let state = self.shared.state();
        if !state.can_apply_answer(pc.signaling_state()) {
            return Err(TransportError::Signaling(format!(
                "cannot apply answer in state {state:?} / {:?}",
                pc.signaling_state()
            )));
        }

        pc.set_remote_description(remote.to_rtc()?)
            .await
            .map_err(sig("set remote answer"))?;
        info!("Remote answer applied");
        apply_pending_candidates(&pc, &self.shared.pending).await;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) {
        dump_candidate("REMOTE", &candidate);
        let pc = self.conn.lock().await.pc.clone();
        let ready = match &pc {
            Some(pc) => pc.remote_description().await.is_some(),
            None => false,
        };
        match pc {
            Some(pc) if ready => {
                apply_candidate(&pc, candidate).await;
            }
            _ if self.shared.state() == TransportState::Closed => {
                debug!("Transport closed, dropping remote candidate");
            }
            _ => {
                debug!("Remote description not set yet, queuing candidate");
                self.shared.pending.push(candidate);
            }
        }
    }

    fn set_video_enabled(&self, enabled: bool) {
        if let Some(stream) = self.shared.local.lock().ok().and_then(|l| l.clone()) {
            stream.set_enabled(MediaKind::Video, enabled);
        }
    }

    fn set_audio_enabled(&self, enabled: bool) {
        if let Some(stream) = self.shared.local.lock().ok().and_then(|l| l.clone()) {
            stream.set_enabled(MediaKind::Audio, enabled);
        }
    }

    fn on_remote_stream(&self, handler: RemoteStreamHandler) {
        self.shared.observers.on_remote_stream(handler);
    }

    fn on_local_ice_candidate(&self, handler: CandidateHandler) {
        self.shared.observers.on_local_candidate(handler);
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.shared.observers.on_error(handler);
    }

    fn state(&self) -> TransportState {
        self.shared.state()
    }

    async fn cleanup(&self) {
        let previous = match self.shared.state.lock() {
            Ok(mut st) => st.replace(TransportState::Closed),
            Err(_) => return,
        };
        if previous == Some(TransportState::Closed) {
            return;
        }

        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.abort_disconnect_task();
        self.shared.observers.clear();
        self.shared.pending.drain();
        if let Ok(mut remote) = self.shared.remote.lock() {
            remote.clear();
        }
        let stopped = self
            .shared
            .local
            .lock()
            .ok()
            .and_then(|mut l| l.take())
            .map(|s| s.stop())
            .unwrap_or(0);

        let pc = {
            let mut conn = self.conn.lock().await;
            conn.senders.clear();
            conn.pc.take()
        };
        if let Some(pc) = pc {
            if let Err(e) = pc.close().await {
                warn!("Failed to close peer connection: {:?}", e);
            }
        }
        info!("Transport cleaned up, {stopped} local tracks stopped");
    }
}
