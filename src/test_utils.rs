//! Тестовые двойники транспорта и хранилища строк.

use crate::config::CallConfig;
use crate::error::{StoreError, TransportError};
use crate::peer::events::{CandidateHandler, ErrorHandler, Observers, RemoteStreamHandler};
use crate::peer::media::{
    DeviceStatus, LocalStream, MediaConstraints, MediaDevices, MediaKind, RemoteStream,
    SampleDevices,
};
use crate::peer::state::TransportState;
use crate::peer::transport::{MediaTransport, TransportFactory};
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::store::{
    CallFilter, CallPatch, CallSession, CallStatus, CallStore, MemoryStore, NewCall, RowChange,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Общий журнал операций, чтобы проверять порядок между store и транспортом
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| e.as_str() == entry).count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockCalls {
    pub acquired: usize,
    pub offers: usize,
    pub answers: usize,
    pub applied_answers: usize,
    pub remote_candidates: Vec<IceCandidate>,
    pub rejected_candidates: usize,
    pub cleanups: usize,
    pub video_enabled: Option<bool>,
    pub audio_enabled: Option<bool>,
}

/// Транспорт без сети: считает вызовы и отдаёт события по команде теста.
///
/// Обработчики переживают `cleanup`, чтобы можно было имитировать
/// запоздавшие колбэки старой попытки.
pub struct MockTransport {
    index: usize,
    devices: Arc<SampleDevices>,
    config: CallConfig,
    journal: Journal,
    observers: Observers,
    state: Mutex<TransportState>,
    calls: Mutex<MockCalls>,
    local: Mutex<Option<LocalStream>>,
    fail_offer: AtomicBool,
    reject_candidates: AtomicBool,
}

impl MockTransport {
    pub fn calls(&self) -> MockCalls {
        self.calls.lock().unwrap().clone()
    }

    pub fn local_stream(&self) -> Option<LocalStream> {
        self.local.lock().unwrap().clone()
    }

    pub fn fail_offers(&self) {
        self.fail_offer.store(true, Ordering::SeqCst);
    }

    /// Кандидаты отклоняются, как это делает ICE-агент на мусорную строку
    pub fn reject_candidates(&self) {
        self.reject_candidates.store(true, Ordering::SeqCst);
    }

    pub fn emit_remote_stream(&self, id: &str) {
        self.observers.emit_remote_stream(&RemoteStream::new(id));
    }

    pub fn emit_local_candidate(&self, candidate: &str) {
        self.observers.emit_local_candidate(&candidate_line(candidate));
    }

    pub fn emit_error(&self, err: TransportError) {
        self.observers.emit_error(&err);
    }

    fn set_state(&self, next: TransportState) {
        *self.state.lock().unwrap() = next;
    }
}

pub fn candidate_line(candidate: &str) -> IceCandidate {
    IceCandidate {
        candidate: candidate.into(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    async fn acquire_local_media(
        &self,
        video: bool,
        audio: bool,
    ) -> Result<LocalStream, TransportError> {
        self.calls.lock().unwrap().acquired += 1;
        let constraints = MediaConstraints::from_config(&self.config, video, audio);
        let stream = self.devices.get_user_media(&constraints).await?;
        *self.local.lock().unwrap() = Some(stream.clone());
        self.set_state(TransportState::TracksAttached);
        Ok(stream)
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.offers += 1;
            calls.offers
        };
        if self.fail_offer.load(Ordering::SeqCst) {
            return Err(TransportError::Signaling("offer rejected".into()));
        }
        self.set_state(TransportState::Negotiating);
        Ok(SessionDescription::offer(format!("mock-offer-{}-{n}", self.index)))
    }

    async fn create_answer(
        &self,
        remote: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        self.calls.lock().unwrap().answers += 1;
        self.set_state(TransportState::Negotiating);
        Ok(SessionDescription::answer(format!("answer-to-{}", remote.sdp)))
    }

    async fn apply_answer(&self, _remote: SessionDescription) -> Result<(), TransportError> {
        self.calls.lock().unwrap().applied_answers += 1;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) {
        if self.reject_candidates.load(Ordering::SeqCst) {
            log::warn!("Mock transport rejected candidate {}", candidate.candidate);
            self.calls.lock().unwrap().rejected_candidates += 1;
            return;
        }
        self.calls.lock().unwrap().remote_candidates.push(candidate);
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.calls.lock().unwrap().video_enabled = Some(enabled);
        if let Some(stream) = self.local.lock().unwrap().as_ref() {
            stream.set_enabled(MediaKind::Video, enabled);
        }
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.calls.lock().unwrap().audio_enabled = Some(enabled);
        if let Some(stream) = self.local.lock().unwrap().as_ref() {
            stream.set_enabled(MediaKind::Audio, enabled);
        }
    }

    fn on_remote_stream(&self, handler: RemoteStreamHandler) {
        self.observers.on_remote_stream(handler);
    }

    fn on_local_ice_candidate(&self, handler: CandidateHandler) {
        self.observers.on_local_candidate(handler);
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.observers.on_error(handler);
    }

    fn state(&self) -> TransportState {
        *self.state.lock().unwrap()
    }

    async fn cleanup(&self) {
        self.calls.lock().unwrap().cleanups += 1;
        if self.state() == TransportState::Closed {
            return;
        }
        self.set_state(TransportState::Closed);
        if let Some(stream) = self.local.lock().unwrap().take() {
            stream.stop();
        }
        self.journal.record("transport:cleanup");
    }
}

/// Фабрика, которая запоминает все выданные транспорты
pub struct MockFactory {
    devices: Arc<SampleDevices>,
    config: CallConfig,
    journal: Journal,
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockFactory {
    pub fn new(journal: Journal) -> Self {
        Self::with_devices(SampleDevices::default(), journal)
    }

    pub fn with_devices(devices: SampleDevices, journal: Journal) -> Self {
        Self {
            devices: Arc::new(devices),
            config: CallConfig::default(),
            journal,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn denied_camera(journal: Journal) -> Self {
        Self::with_devices(
            SampleDevices::new(
                DeviceStatus::Refused("NotAllowedError".into()),
                DeviceStatus::Available,
            ),
            journal,
        )
    }

    pub fn created(&self) -> Vec<Arc<MockTransport>> {
        self.created.lock().unwrap().clone()
    }

    pub fn last(&self) -> Arc<MockTransport> {
        self.created().last().cloned().expect("no transport created yet")
    }

    pub fn devices(&self) -> &SampleDevices {
        &self.devices
    }
}

impl TransportFactory for MockFactory {
    fn create(&self) -> Arc<dyn MediaTransport> {
        let mut created = self.created.lock().unwrap();
        let transport = Arc::new(MockTransport {
            index: created.len(),
            devices: self.devices.clone(),
            config: self.config.clone(),
            journal: self.journal.clone(),
            observers: Observers::default(),
            state: Mutex::new(TransportState::Initialized),
            calls: Mutex::new(MockCalls::default()),
            local: Mutex::new(None),
            fail_offer: AtomicBool::new(false),
            reject_candidates: AtomicBool::new(false),
        });
        created.push(transport.clone());
        transport
    }
}

/// MemoryStore с журналом записей и внедряемыми отказами
pub struct TestStore {
    inner: MemoryStore,
    journal: Journal,
    signals: Mutex<Vec<serde_json::Value>>,
    fail_inserts: AtomicBool,
    fail_signaling: AtomicBool,
}

impl TestStore {
    pub fn new(journal: Journal) -> Self {
        Self {
            inner: MemoryStore::new(),
            journal,
            signals: Mutex::new(Vec::new()),
            fail_inserts: AtomicBool::new(false),
            fail_signaling: AtomicBool::new(false),
        }
    }

    pub fn fail_inserts(&self, on: bool) {
        self.fail_inserts.store(on, Ordering::SeqCst);
    }

    pub fn fail_signaling(&self, on: bool) {
        self.fail_signaling.store(on, Ordering::SeqCst);
    }

    /// Все записанные `signalingData`, по порядку
    pub fn signals(&self) -> Vec<serde_json::Value> {
        self.signals.lock().unwrap().clone()
    }

    pub fn signals_of(&self, kind: &str) -> Vec<serde_json::Value> {
        self.signals()
            .into_iter()
            .filter(|v| v["type"] == kind)
            .collect()
    }
}

#[async_trait]
impl CallStore for TestStore {
    async fn insert_call(&self, new: NewCall) -> Result<CallSession, StoreError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("insert refused".into()));
        }
        self.journal.record("store:insert");
        self.inner.insert_call(new).await
    }

    async fn update_call(&self, id: &str, patch: CallPatch) -> Result<CallSession, StoreError> {
        if let Some(status) = patch.status {
            let label = match status {
                CallStatus::Waiting => "waiting",
                CallStatus::Active => "active",
                CallStatus::Ended => "ended",
            };
            self.journal.record(format!("store:status:{label}"));
        }
        self.inner.update_call(id, patch).await
    }

    async fn update_signaling_data(
        &self,
        id: &str,
        data: serde_json::Value,
    ) -> Result<(), StoreError> {
        if self.fail_signaling.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("signaling update refused".into()));
        }
        self.signals.lock().unwrap().push(data.clone());
        self.inner.update_signaling_data(id, data).await
    }

    async fn fetch_call(&self, id: &str) -> Result<Option<CallSession>, StoreError> {
        self.inner.fetch_call(id).await
    }

    async fn select_calls(&self, filter: CallFilter) -> Result<Vec<CallSession>, StoreError> {
        self.inner.select_calls(filter).await
    }

    fn subscribe(&self) -> broadcast::Receiver<RowChange> {
        self.inner.subscribe()
    }
}
