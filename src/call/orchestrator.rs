use crate::call::state::{CallPhase, CallSnapshot, ParticipantRole};
use crate::call::view::{side_labels, CallView, Notice};
use crate::config::CallConfig;
use crate::error::{CallError, RelayError, StoreError, TransportError};
use crate::peer::media::{LocalStream, RemoteStream};
use crate::peer::transport::{MediaTransport, TransportFactory};
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::session::SessionContext;
use crate::signaling::{RelayAdapter, RelayEvent, SignalPayload};
use crate::store::{CallSession, CallStatus, CallStore, Role};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

const NOTICE_BUFFER: usize = 32;

/// Событие с номером попытки, которая его породила
type Tagged = (u64, CallEvent);

#[derive(Debug)]
enum CallEvent {
    Relay(RelayEvent),
    RemoteStream(RemoteStream),
    LocalCandidate(IceCandidate),
    TransportFailed(TransportError),
    OfferDue,
}

#[derive(Default)]
struct Negotiation {
    offered: bool,
    /// Свой шаг сделан: answer опубликован (joiner) или применён (initiator)
    negotiated: bool,
    outbound: Vec<IceCandidate>,
}

struct CallState {
    phase: CallPhase,
    participant: Option<ParticipantRole>,
    call: Option<CallSession>,
    local_stream: Option<LocalStream>,
    remote_stream: Option<RemoteStream>,
    video_enabled: bool,
    audio_enabled: bool,
    last_error: Option<String>,
    attempt: u64,
    transport: Option<Arc<dyn MediaTransport>>,
    relay_task: Option<JoinHandle<()>>,
    offer_task: Option<JoinHandle<()>>,
    negotiation: Negotiation,
}

impl CallState {
    fn new() -> Self {
        Self {
            phase: CallPhase::Idle,
            participant: None,
            call: None,
            local_stream: None,
            remote_stream: None,
            video_enabled: true,
            audio_enabled: true,
            last_error: None,
            attempt: 0,
            transport: None,
            relay_task: None,
            offer_task: None,
            negotiation: Negotiation::default(),
        }
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            phase: self.phase,
            participant: self.participant,
            call: self.call.clone(),
            local_stream: self.local_stream.clone(),
            remote_stream: self.remote_stream.clone(),
            video_enabled: self.video_enabled,
            audio_enabled: self.audio_enabled,
            last_error: self.last_error.clone(),
            attempt: self.attempt,
        }
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.attempt == attempt && self.phase.is_in_call()
    }
}

struct Inner {
    role: Role,
    session: SessionContext,
    relay: RelayAdapter,
    factory: Arc<dyn TransportFactory>,
    config: CallConfig,
    state: Mutex<CallState>,
    events: mpsc::UnboundedSender<Tagged>,
    view: watch::Sender<CallView>,
    notices: broadcast::Sender<Notice>,
}

/// Жизненный цикл звонка одной стороны: инициатор или присоединившийся.
///
/// События транспорта и ретранслятора идут в один канал и обрабатываются
/// по очереди фоновой задачей; события чужой попытки игнорируются.
pub struct CallOrchestrator {
    inner: Arc<Inner>,
    driver: JoinHandle<()>,
}

impl CallOrchestrator {
    /// Роль берётся из сессии; админская сессия должна быть действующей
    pub fn new(
        session: SessionContext,
        store: Arc<dyn CallStore>,
        factory: Arc<dyn TransportFactory>,
        config: CallConfig,
    ) -> Result<Self, CallError> {
        let role = session.role();
        session.guard(role, Utc::now())?;

        let state = CallState::new();
        let (view, _) = watch::channel(CallView::from_snapshot(
            &state.snapshot(),
            role,
            &config.labels,
        ));
        let (notices, _) = broadcast::channel(NOTICE_BUFFER);
        let (events, rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            role,
            session,
            relay: RelayAdapter::new(store, role),
            factory,
            config,
            state: Mutex::new(state),
            events,
            view,
            notices,
        });
        let driver = tokio::spawn(drive(inner.clone(), rx));
        info!("Call orchestrator ready for {role}");
        Ok(Self { inner, driver })
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Создаёт строку звонка и через `settle_delay` публикует offer
    pub async fn start_call(&self) -> Result<CallSession, CallError> {
        let inner = &self.inner;
        inner.authorize()?;
        let mut st = inner.state.lock().await;
        let (attempt, transport) = inner.begin_attempt(&mut st, ParticipantRole::Initiator)?;
        info!("{} starting call, attempt {attempt}", inner.role);

        match inner.prepare_initiator(&mut st, attempt, transport).await {
            Ok(row) => {
                let (_, remote) = side_labels(inner.role, &inner.config.labels);
                inner.notify(Notice::info(
                    "Call Started",
                    format!("Waiting for {remote} to join..."),
                ));
                Ok(row)
            }
            Err(e) => {
                inner.fail(&mut st, &e, "Failed to start call").await;
                Err(e)
            }
        }
    }

    /// Присоединяется к чужому звонку и отвечает на его offer
    pub async fn join_call(&self, call: &CallSession) -> Result<CallSession, CallError> {
        let inner = &self.inner;
        inner.authorize()?;
        if call.started_by == inner.role {
            return Err(CallError::InvalidState(format!(
                "call {} was started by this side",
                call.room_id
            )));
        }
        if !call.is_open() {
            return Err(CallError::InvalidState(format!(
                "call {} has already ended",
                call.room_id
            )));
        }

        let mut st = inner.state.lock().await;
        let (attempt, transport) = inner.begin_attempt(&mut st, ParticipantRole::Joiner)?;
        info!("{} joining {}, attempt {attempt}", inner.role, call.room_id);

        match inner.prepare_joiner(&mut st, attempt, transport, call).await {
            Ok(row) => {
                let (_, remote) = side_labels(inner.role, &inner.config.labels);
                inner.notify(Notice::info(
                    "Joined Call",
                    format!("Connecting to {remote}..."),
                ));
                Ok(row)
            }
            Err(e) => {
                inner.fail(&mut st, &e, "Failed to join call").await;
                Err(e)
            }
        }
    }

    /// Порядок: строка `ended`, затем cleanup транспорта, затем `Ended`
    pub async fn end_call(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        let mut st = inner.state.lock().await;
        if !st.phase.is_in_call() {
            return Err(CallError::InvalidState("no call in progress".into()));
        }

        if let Some(call_id) = st.call.as_ref().map(|c| c.id.clone()) {
            if let Err(e) = inner.relay.mark_ended(&call_id).await {
                warn!("Could not mark call {call_id} ended: {e}");
            }
        }
        inner.teardown(&mut st).await;
        inner.transition(&mut st, CallPhase::Ended);
        inner.publish_view(&st);
        inner.notify(Notice::info("Call Ended", "The video call has been ended"));
        info!("{} ended the call", inner.role);
        Ok(())
    }

    pub async fn toggle_video(&self) -> bool {
        let mut st = self.inner.state.lock().await;
        st.video_enabled = !st.video_enabled;
        let enabled = st.video_enabled;
        if st.phase.is_in_call() {
            if let Some(transport) = &st.transport {
                transport.set_video_enabled(enabled);
            }
        }
        self.inner.publish_view(&st);
        enabled
    }

    pub async fn toggle_audio(&self) -> bool {
        let mut st = self.inner.state.lock().await;
        st.audio_enabled = !st.audio_enabled;
        let enabled = st.audio_enabled;
        if st.phase.is_in_call() {
            if let Some(transport) = &st.transport {
                transport.set_audio_enabled(enabled);
            }
        }
        self.inner.publish_view(&st);
        enabled
    }

    pub async fn snapshot(&self) -> CallSnapshot {
        self.inner.state.lock().await.snapshot()
    }

    pub fn view(&self) -> watch::Receiver<CallView> {
        self.inner.view.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.notices.subscribe()
    }

    pub async fn list_open_calls(&self) -> Result<Vec<CallSession>, CallError> {
        self.inner.authorize()?;
        Ok(self.inner.relay.list_open_calls().await?)
    }
}

impl Drop for CallOrchestrator {
    fn drop(&mut self) {
        self.driver.abort();
        let inner = self.inner.clone();
        // мьютекс может держать только driver, который уже отменён
        let released = match inner.state.try_lock() {
            Ok(mut st) if st.phase.is_in_call() => {
                let call_id = st.call.as_ref().map(|c| c.id.clone());
                let transport = release(&mut st);
                st.phase = CallPhase::Ended;
                Some((call_id, transport))
            }
            Ok(_) => return,
            Err(_) => None,
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("{} orchestrator dropped outside a runtime, transport not closed", inner.role);
            return;
        };
        info!("{} orchestrator dropped, closing the call", inner.role);
        runtime.spawn(async move {
            let (call_id, transport) = match released {
                Some(released) => released,
                None => {
                    let mut st = inner.state.lock().await;
                    if !st.phase.is_in_call() {
                        return;
                    }
                    st.phase = CallPhase::Ended;
                    let call_id = st.call.as_ref().map(|c| c.id.clone());
                    (call_id, release(&mut st))
                }
            };
            if let Some(call_id) = call_id {
                if let Err(e) = inner.relay.mark_ended(&call_id).await {
                    warn!("Could not mark call {call_id} ended: {e}");
                }
            }
            if let Some(transport) = transport {
                transport.cleanup().await;
            }
        });
    }
}

async fn drive(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<Tagged>) {
    while let Some((attempt, event)) = rx.recv().await {
        inner.handle(attempt, event).await;
    }
}

impl Inner {
    fn authorize(&self) -> Result<(), CallError> {
        self.session.guard(self.role, Utc::now())?;
        Ok(())
    }

    fn publish_view(&self, st: &CallState) {
        self.view.send_replace(CallView::from_snapshot(
            &st.snapshot(),
            self.role,
            &self.config.labels,
        ));
    }

    fn notify(&self, notice: Notice) {
        // нет слушателей, это не ошибка
        let _ = self.notices.send(notice);
    }

    fn transition(&self, st: &mut CallState, next: CallPhase) -> bool {
        if !st.phase.can_transition_to(next) {
            warn!(
                "Ignoring phase change {:?} -> {:?} (attempt {})",
                st.phase, next, st.attempt
            );
            return false;
        }
        debug!("Phase {:?} -> {:?} (attempt {})", st.phase, next, st.attempt);
        st.phase = next;
        true
    }

    fn begin_attempt(
        &self,
        st: &mut CallState,
        participant: ParticipantRole,
    ) -> Result<(u64, Arc<dyn MediaTransport>), CallError> {
        if st.phase.is_in_call() {
            return Err(CallError::InvalidState("a call is already in progress".into()));
        }
        if !self.transition(st, CallPhase::Connecting) {
            return Err(CallError::InvalidState(format!(
                "cannot start a call from {:?}",
                st.phase
            )));
        }
        st.attempt += 1;
        st.participant = Some(participant);
        st.last_error = None;
        st.call = None;
        st.negotiation = Negotiation::default();

        let transport = self.factory.create();
        self.wire(&transport, st.attempt);
        st.transport = Some(transport.clone());
        self.publish_view(st);
        Ok((st.attempt, transport))
    }

    /// Обработчики транспорта только кладут событие в канал
    fn wire(&self, transport: &Arc<dyn MediaTransport>, attempt: u64) {
        let tx = self.events.clone();
        transport.on_remote_stream(Box::new(move |stream| {
            let _ = tx.send((attempt, CallEvent::RemoteStream(stream)));
        }));
        let tx = self.events.clone();
        transport.on_local_ice_candidate(Box::new(move |candidate| {
            let _ = tx.send((attempt, CallEvent::LocalCandidate(candidate)));
        }));
        let tx = self.events.clone();
        transport.on_error(Box::new(move |err| {
            let _ = tx.send((attempt, CallEvent::TransportFailed(err)));
        }));
    }

    async fn acquire(
        &self,
        st: &mut CallState,
        transport: &Arc<dyn MediaTransport>,
    ) -> Result<(), CallError> {
        let stream = transport
            .acquire_local_media(st.video_enabled, st.audio_enabled)
            .await?;
        debug!("Local stream {} acquired", stream.id());
        st.local_stream = Some(stream);
        self.publish_view(st);
        Ok(())
    }

    fn listen(&self, st: &mut CallState, call: &CallSession, attempt: u64) {
        let mut subscription = self.relay.subscribe(call);
        let tx = self.events.clone();
        st.relay_task = Some(tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                if tx.send((attempt, CallEvent::Relay(event))).is_err() {
                    break;
                }
            }
        }));
    }

    async fn prepare_initiator(
        &self,
        st: &mut CallState,
        attempt: u64,
        transport: Arc<dyn MediaTransport>,
    ) -> Result<CallSession, CallError> {
        self.acquire(st, &transport).await?;
        let row = self.relay.create_call_row().await?;
        st.call = Some(row.clone());
        self.listen(st, &row, attempt);

        let tx = self.events.clone();
        let delay = self.config.settle_delay;
        st.offer_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send((attempt, CallEvent::OfferDue));
        }));
        self.publish_view(st);
        Ok(row)
    }

    async fn prepare_joiner(
        &self,
        st: &mut CallState,
        attempt: u64,
        transport: Arc<dyn MediaTransport>,
        call: &CallSession,
    ) -> Result<CallSession, CallError> {
        self.acquire(st, &transport).await?;
        st.call = Some(call.clone());
        self.relay.mark_active(&call.id).await?;
        self.listen(st, call, attempt);

        // offer мог быть записан до подписки
        let current = self
            .relay
            .fetch_call(&call.id)
            .await?
            .ok_or_else(|| RelayError(StoreError::NotFound(call.id.clone())))?;
        if current.status == CallStatus::Ended {
            return Err(CallError::InvalidState(format!(
                "call {} has already ended",
                current.room_id
            )));
        }
        st.call = Some(current.clone());

        if let Some(value) = &current.signaling_data {
            match SignalPayload::parse(value) {
                Ok(payload) if payload.author(current.started_by) != self.role => {
                    self.on_signal(st, payload).await?;
                }
                Ok(_) => {}
                Err(e) => warn!("Ignoring signaling data on {}: {e}", current.room_id),
            }
        }
        self.publish_view(st);
        Ok(current)
    }

    async fn handle(&self, attempt: u64, event: CallEvent) {
        let mut st = self.state.lock().await;
        if !st.is_current(attempt) {
            debug!(
                "Dropping {event:?} from attempt {attempt} (current {}, {:?})",
                st.attempt, st.phase
            );
            return;
        }

        let result = match event {
            CallEvent::Relay(RelayEvent::Signal(payload)) => self.on_signal(&mut st, payload).await,
            CallEvent::Relay(RelayEvent::Ended) => {
                self.remote_hangup(&mut st).await;
                Ok(())
            }
            CallEvent::RemoteStream(stream) => {
                self.on_remote_stream(&mut st, stream);
                Ok(())
            }
            CallEvent::LocalCandidate(candidate) => {
                self.on_local_candidate(&mut st, candidate).await
            }
            CallEvent::TransportFailed(err) => Err(err.into()),
            CallEvent::OfferDue => self.on_offer_due(&mut st).await,
        };

        if let Err(e) = result {
            self.fail(&mut st, &e, "Call failed").await;
        }
    }

    async fn on_offer_due(&self, st: &mut CallState) -> Result<(), CallError> {
        if st.participant != Some(ParticipantRole::Initiator) || st.negotiation.offered {
            return Ok(());
        }
        let (Some(transport), Some(call_id)) =
            (st.transport.clone(), st.call.as_ref().map(|c| c.id.clone()))
        else {
            return Ok(());
        };
        st.negotiation.offered = true;

        let offer = transport.create_offer().await?;
        self.relay
            .publish_signal(&call_id, &SignalPayload::from(offer))
            .await?;
        self.relay.mark_active(&call_id).await?;
        if let Some(call) = st.call.as_mut() {
            call.status = CallStatus::Active;
        }
        info!("Offer published on {call_id}");
        Ok(())
    }

    async fn on_signal(&self, st: &mut CallState, payload: SignalPayload) -> Result<(), CallError> {
        let (Some(transport), Some(call_id)) =
            (st.transport.clone(), st.call.as_ref().map(|c| c.id.clone()))
        else {
            return Ok(());
        };

        match (payload, st.participant) {
            (SignalPayload::Offer { sdp }, Some(ParticipantRole::Joiner)) => {
                if st.negotiation.negotiated {
                    debug!("Offer on {call_id} already answered");
                    return Ok(());
                }
                st.negotiation.negotiated = true;
                let answer = transport
                    .create_answer(SessionDescription::offer(sdp))
                    .await?;
                self.relay
                    .publish_signal(&call_id, &SignalPayload::from(answer))
                    .await?;
                info!("Answer published on {call_id}");
                self.flush_candidates(st, &call_id).await
            }
            (SignalPayload::Answer { sdp }, Some(ParticipantRole::Initiator)) => {
                if !st.negotiation.offered || st.negotiation.negotiated {
                    debug!("Unexpected answer on {call_id}, ignored");
                    return Ok(());
                }
                st.negotiation.negotiated = true;
                transport
                    .apply_answer(SessionDescription::answer(sdp))
                    .await?;
                info!("Answer applied on {call_id}");
                self.flush_candidates(st, &call_id).await
            }
            (SignalPayload::IceCandidate { candidate, from }, _) if from != self.role => {
                transport.add_remote_candidate(candidate).await;
                Ok(())
            }
            (other, participant) => {
                debug!("Ignoring {} as {participant:?}", other.kind());
                Ok(())
            }
        }
    }

    async fn on_local_candidate(
        &self,
        st: &mut CallState,
        candidate: IceCandidate,
    ) -> Result<(), CallError> {
        if !st.negotiation.negotiated {
            st.negotiation.outbound.push(candidate);
            return Ok(());
        }
        let Some(call_id) = st.call.as_ref().map(|c| c.id.clone()) else {
            return Ok(());
        };
        self.send_candidate(&call_id, candidate).await
    }

    async fn flush_candidates(&self, st: &mut CallState, call_id: &str) -> Result<(), CallError> {
        let queued = std::mem::take(&mut st.negotiation.outbound);
        if !queued.is_empty() {
            debug!("Relaying {} queued local candidates", queued.len());
        }
        for candidate in queued {
            self.send_candidate(call_id, candidate).await?;
        }
        Ok(())
    }

    async fn send_candidate(&self, call_id: &str, candidate: IceCandidate) -> Result<(), CallError> {
        let payload = SignalPayload::IceCandidate {
            candidate,
            from: self.role,
        };
        self.relay.publish_signal(call_id, &payload).await?;
        Ok(())
    }

    fn on_remote_stream(&self, st: &mut CallState, stream: RemoteStream) {
        debug!("Remote stream {} arrived", stream.id());
        st.remote_stream = Some(stream);
        st.last_error = None;
        if st.phase == CallPhase::Connecting && self.transition(st, CallPhase::Connected) {
            info!("Call connected (attempt {})", st.attempt);
        }
        self.publish_view(st);
    }

    async fn remote_hangup(&self, st: &mut CallState) {
        info!("Remote side ended the call");
        self.teardown(st).await;
        self.transition(st, CallPhase::Ended);
        self.publish_view(st);
        self.notify(Notice::info("Call Ended", "The other side ended the call"));
    }

    /// Освобождает всё, что принадлежит текущей попытке
    async fn teardown(&self, st: &mut CallState) {
        if let Some(transport) = release(st) {
            transport.cleanup().await;
        }
    }

    async fn fail(&self, st: &mut CallState, err: &CallError, context: &str) {
        let message = err.to_string();
        error!("{context}: {message}");
        let call_id = st.call.as_ref().map(|c| c.id.clone());

        if st.phase.is_in_call() {
            self.transition(st, CallPhase::Failed);
        }
        st.last_error = Some(message.clone());
        self.teardown(st).await;
        if let Some(call_id) = call_id {
            if let Err(e) = self.relay.mark_ended(&call_id).await {
                warn!("Could not mark failed call {call_id} ended: {e}");
            }
        }
        if st.phase == CallPhase::Failed {
            self.transition(st, CallPhase::Idle);
        }
        self.publish_view(st);
        self.notify(Notice::error(format!("{context}: {message}")));
    }
}

/// Синхронная часть teardown: задачи остановлены, треки погашены.
/// Транспорт возвращается, его `cleanup` остаётся вызывающему.
fn release(st: &mut CallState) -> Option<Arc<dyn MediaTransport>> {
    if let Some(task) = st.offer_task.take() {
        task.abort();
    }
    if let Some(task) = st.relay_task.take() {
        task.abort();
    }
    if let Some(stream) = st.local_stream.take() {
        stream.stop();
    }
    st.remote_stream = None;
    st.call = None;
    st.participant = None;
    st.negotiation = Negotiation::default();
    st.transport.take()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::state::StatusLabel;
    use crate::call::view::NoticeLevel;
    use crate::config::AdminCredentials;
    use crate::error::{AuthError, MediaAccessReason};
    use crate::peer::media::MediaKind;
    use crate::test_utils::{candidate_line, Journal, MockFactory, TestStore};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        orch: CallOrchestrator,
        factory: Arc<MockFactory>,
        store: Arc<TestStore>,
        journal: Journal,
    }

    impl Harness {
        fn new(session: SessionContext) -> Self {
            let journal = Journal::default();
            Self::with_factory(session, MockFactory::new(journal.clone()), journal)
        }

        fn with_factory(session: SessionContext, factory: MockFactory, journal: Journal) -> Self {
            let factory = Arc::new(factory);
            let store = Arc::new(TestStore::new(journal.clone()));
            let orch = CallOrchestrator::new(
                session,
                store.clone(),
                factory.clone(),
                CallConfig::default(),
            )
            .unwrap();
            Self {
                orch,
                factory,
                store,
                journal,
            }
        }

        fn other_side(&self, role: Role) -> RelayAdapter {
            RelayAdapter::new(self.store.clone(), role)
        }

        async fn phase(&self) -> CallPhase {
            self.orch.snapshot().await.phase
        }
    }

    fn admin_session() -> SessionContext {
        let creds = AdminCredentials {
            email: "care@clinic.example".into(),
            password: "letmein".into(),
        };
        SessionContext::admin_login(
            "care@clinic.example",
            "letmein",
            &creds,
            Duration::from_secs(3600),
        )
        .unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    async fn past_settle_delay() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    /// Пациент начал звонок, offer ушёл, админ ответил
    async fn negotiated_patient_call(h: &Harness) -> CallSession {
        let row = h.orch.start_call().await.unwrap();
        past_settle_delay().await;
        h.other_side(Role::Admin)
            .publish_signal(&row.id, &SignalPayload::Answer { sdp: "a1".into() })
            .await
            .unwrap();
        settle().await;
        row
    }

    #[tokio::test(start_paused = true)]
    async fn initiator_sends_exactly_one_offer_within_a_second() {
        let h = Harness::new(SessionContext::patient());
        let row = h.orch.start_call().await.unwrap();
        assert!(row.room_id.starts_with("patient-call-"));
        assert_eq!(h.phase().await, CallPhase::Connecting);
        assert!(h.store.signals().is_empty());

        past_settle_delay().await;

        assert_eq!(h.factory.last().calls().offers, 1);
        assert_eq!(h.store.signals_of("offer").len(), 1);
        let stored = h.store.fetch_call(&row.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Active);
        assert!(stored.started_at.is_some());
        assert_eq!(stored.signaling_data.unwrap()["type"], "offer");
        assert_eq!(h.orch.view().borrow().call_status, StatusLabel::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn joiner_answers_exactly_once() {
        let h = Harness::new(admin_session());
        let patient = h.other_side(Role::Patient);
        let row = patient.create_call_row().await.unwrap();
        patient
            .publish_signal(&row.id, &SignalPayload::Offer { sdp: "offer-1".into() })
            .await
            .unwrap();

        let listed = h.orch.list_open_calls().await.unwrap();
        assert_eq!(listed.len(), 1);
        h.orch.join_call(&listed[0]).await.unwrap();
        settle().await;

        let transport = h.factory.last();
        assert_eq!(transport.calls().answers, 1);
        let answers = h.store.signals_of("answer");
        assert_eq!(answers, vec![json!({"type": "answer", "sdp": "answer-to-offer-1"})]);

        patient
            .publish_signal(&row.id, &SignalPayload::Offer { sdp: "offer-2".into() })
            .await
            .unwrap();
        settle().await;
        assert_eq!(transport.calls().answers, 1);
        assert_eq!(h.store.signals_of("answer").len(), 1);

        let stored = h.store.fetch_call(&row.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn joiner_picks_up_offer_written_before_it_subscribed() {
        let h = Harness::new(admin_session());
        let patient = h.other_side(Role::Patient);
        patient.create_call_row().await.unwrap();
        // список получен до того, как пациент записал offer
        let stale = h.orch.list_open_calls().await.unwrap().remove(0);
        patient
            .publish_signal(&stale.id, &SignalPayload::Offer { sdp: "early".into() })
            .await
            .unwrap();

        h.orch.join_call(&stale).await.unwrap();
        settle().await;

        assert_eq!(h.factory.last().calls().answers, 1);
        assert_eq!(h.store.signals_of("answer").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn joiner_answers_offer_arriving_after_join() {
        let h = Harness::new(admin_session());
        let patient = h.other_side(Role::Patient);
        let row = patient.create_call_row().await.unwrap();
        h.orch.join_call(&row).await.unwrap();
        settle().await;
        assert_eq!(h.factory.last().calls().answers, 0);

        patient
            .publish_signal(&row.id, &SignalPayload::Offer { sdp: "late".into() })
            .await
            .unwrap();
        settle().await;
        assert_eq!(h.factory.last().calls().answers, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn initiator_applies_answer_once() {
        let h = Harness::new(SessionContext::patient());
        let row = negotiated_patient_call(&h).await;
        let transport = h.factory.last();
        assert_eq!(transport.calls().applied_answers, 1);

        h.other_side(Role::Admin)
            .publish_signal(&row.id, &SignalPayload::Answer { sdp: "a2".into() })
            .await
            .unwrap();
        settle().await;
        assert_eq!(transport.calls().applied_answers, 1);
        assert_eq!(h.phase().await, CallPhase::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn local_candidates_wait_for_the_answer() {
        let h = Harness::new(SessionContext::patient());
        let row = h.orch.start_call().await.unwrap();
        past_settle_delay().await;
        let transport = h.factory.last();

        transport.emit_local_candidate("candidate:1 1 udp 1 10.0.0.1 5000 typ host");
        settle().await;
        assert!(h.store.signals_of("ice-candidate").is_empty());

        h.other_side(Role::Admin)
            .publish_signal(&row.id, &SignalPayload::Answer { sdp: "a1".into() })
            .await
            .unwrap();
        settle().await;
        let sent = h.store.signals_of("ice-candidate");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["from"], "patient");

        transport.emit_local_candidate("candidate:2 1 udp 1 10.0.0.1 5001 typ host");
        settle().await;
        assert_eq!(h.store.signals_of("ice-candidate").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_candidates_reach_the_transport() {
        let h = Harness::new(SessionContext::patient());
        let row = negotiated_patient_call(&h).await;

        h.other_side(Role::Admin)
            .publish_signal(
                &row.id,
                &SignalPayload::IceCandidate {
                    candidate: candidate_line("candidate:9 1 udp 1 10.0.0.9 6000 typ host"),
                    from: Role::Admin,
                },
            )
            .await
            .unwrap();
        settle().await;

        let received = h.factory.last().calls().remote_candidates;
        assert_eq!(received.len(), 1);
        assert!(received[0].candidate.starts_with("candidate:9"));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_remote_candidate_keeps_the_call_going() {
        let h = Harness::new(SessionContext::patient());
        let row = negotiated_patient_call(&h).await;
        let transport = h.factory.last();
        transport.reject_candidates();

        h.other_side(Role::Admin)
            .publish_signal(
                &row.id,
                &SignalPayload::IceCandidate {
                    candidate: candidate_line("candidate:garbage"),
                    from: Role::Admin,
                },
            )
            .await
            .unwrap();
        settle().await;

        assert_eq!(transport.calls().rejected_candidates, 1);
        let snap = h.orch.snapshot().await;
        assert_eq!(snap.phase, CallPhase::Connecting);
        assert!(snap.last_error.is_none());
        assert_eq!(transport.calls().cleanups, 0);

        transport.emit_remote_stream("remote-1");
        settle().await;
        assert_eq!(h.phase().await, CallPhase::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_mid_call_releases_media_and_ends_the_row() {
        let Harness {
            orch,
            factory,
            store,
            ..
        } = Harness::new(SessionContext::patient());
        let row = orch.start_call().await.unwrap();
        past_settle_delay().await;
        assert_eq!(
            store.fetch_call(&row.id).await.unwrap().unwrap().status,
            CallStatus::Active
        );

        drop(orch);
        assert!(factory
            .devices()
            .issued_streams()
            .iter()
            .all(|s| s.live_tracks() == 0));
        settle().await;

        assert_eq!(factory.last().calls().cleanups, 1);
        let stored = store.fetch_call(&row.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn connected_only_on_remote_stream_and_never_regresses() {
        let h = Harness::new(SessionContext::patient());
        let row = negotiated_patient_call(&h).await;
        assert_eq!(h.phase().await, CallPhase::Connecting);

        h.factory.last().emit_remote_stream("remote-1");
        settle().await;
        let snap = h.orch.snapshot().await;
        assert_eq!(snap.phase, CallPhase::Connected);
        assert_eq!(snap.remote_stream.unwrap().id(), "remote-1");
        assert_eq!(h.orch.view().borrow().call_status, StatusLabel::Connected);

        h.other_side(Role::Admin)
            .publish_signal(&row.id, &SignalPayload::Offer { sdp: "bogus".into() })
            .await
            .unwrap();
        settle().await;
        assert_eq!(h.phase().await, CallPhase::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payload_changes_nothing() {
        let h = Harness::new(SessionContext::patient());
        let row = h.orch.start_call().await.unwrap();
        settle().await;

        h.store
            .update_signaling_data(&row.id, json!({"type": "answer", "sdp": ""}))
            .await
            .unwrap();
        h.store
            .update_signaling_data(&row.id, json!({"kind": "nonsense"}))
            .await
            .unwrap();
        settle().await;

        let snap = h.orch.snapshot().await;
        assert_eq!(snap.phase, CallPhase::Connecting);
        assert!(snap.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn denied_camera_fails_without_a_row() {
        let journal = Journal::default();
        let h = Harness::with_factory(
            SessionContext::patient(),
            MockFactory::denied_camera(journal.clone()),
            journal,
        );
        let mut notices = h.orch.notices();

        let err = h.orch.start_call().await.unwrap_err();
        match err {
            CallError::Transport(TransportError::MediaAccess(e)) => {
                assert_eq!(e.reason, MediaAccessReason::PermissionDenied)
            }
            other => panic!("unexpected error {other:?}"),
        }

        let snap = h.orch.snapshot().await;
        assert_eq!(snap.phase, CallPhase::Idle);
        assert!(snap.local_stream.is_none());
        assert!(snap.last_error.unwrap().contains("permission-denied"));
        assert!(h.factory.last().local_stream().is_none());
        assert_eq!(h.factory.last().calls().cleanups, 1);
        assert_eq!(h.journal.count("store:insert"), 0);
        assert_eq!(notices.try_recv().unwrap().level, NoticeLevel::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn ending_marks_row_before_cleanup_and_ignores_late_events() {
        let h = Harness::new(SessionContext::patient());
        let row = negotiated_patient_call(&h).await;
        let transport = h.factory.last();
        transport.emit_remote_stream("remote");
        settle().await;
        assert_eq!(h.phase().await, CallPhase::Connected);

        h.orch.end_call().await.unwrap();

        let entries = h.journal.entries();
        let marked = entries.iter().position(|e| e == "store:status:ended").unwrap();
        let cleaned = entries.iter().position(|e| e == "transport:cleanup").unwrap();
        assert!(marked < cleaned);

        let snap = h.orch.snapshot().await;
        assert_eq!(snap.phase, CallPhase::Ended);
        assert!(snap.local_stream.is_none());
        assert!(snap.remote_stream.is_none());
        assert!(h
            .factory
            .devices()
            .issued_streams()
            .iter()
            .all(|s| s.live_tracks() == 0));

        let before = transport.calls();
        let patient_candidates = |h: &Harness| {
            h.store
                .signals_of("ice-candidate")
                .into_iter()
                .filter(|v| v["from"] == "patient")
                .count()
        };
        let sent_before = patient_candidates(&h);
        transport.emit_local_candidate("candidate:late 1 udp 1 10.0.0.1 5002 typ host");
        h.other_side(Role::Admin)
            .publish_signal(
                &row.id,
                &SignalPayload::IceCandidate {
                    candidate: candidate_line("candidate:late-remote"),
                    from: Role::Admin,
                },
            )
            .await
            .unwrap();
        settle().await;

        let after = transport.calls();
        assert_eq!(after.remote_candidates.len(), before.remote_candidates.len());
        assert_eq!(after.applied_answers, before.applied_answers);
        assert_eq!(patient_candidates(&h), sent_before);
        assert_eq!(h.journal.count("store:status:ended"), 1);
        assert_eq!(h.phase().await, CallPhase::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_hangup_tears_down_without_marking_again() {
        let h = Harness::new(SessionContext::patient());
        let row = negotiated_patient_call(&h).await;
        let mut notices = h.orch.notices();

        h.other_side(Role::Admin).mark_ended(&row.id).await.unwrap();
        settle().await;

        assert_eq!(h.phase().await, CallPhase::Ended);
        assert_eq!(h.factory.last().calls().cleanups, 1);
        assert_eq!(h.journal.count("store:status:ended"), 1);
        assert_eq!(notices.try_recv().unwrap().title, "Call Ended");
    }

    #[tokio::test(start_paused = true)]
    async fn second_attempt_ignores_first_transport() {
        let h = Harness::new(SessionContext::patient());
        h.orch.start_call().await.unwrap();
        past_settle_delay().await;
        h.orch.end_call().await.unwrap();
        h.orch.start_call().await.unwrap();
        settle().await;

        let created = h.factory.created();
        assert_eq!(created.len(), 2);
        assert_eq!(h.orch.snapshot().await.attempt, 2);

        created[0].emit_remote_stream("stale");
        created[0].emit_error(TransportError::ConnectionFailed("old".into()));
        settle().await;
        let snap = h.orch.snapshot().await;
        assert_eq!(snap.phase, CallPhase::Connecting);
        assert!(snap.last_error.is_none());

        created[1].emit_remote_stream("fresh");
        settle().await;
        let snap = h.orch.snapshot().await;
        assert_eq!(snap.phase, CallPhase::Connected);
        assert_eq!(snap.remote_stream.unwrap().id(), "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_fails_and_resets_to_idle() {
        let h = Harness::new(SessionContext::patient());
        let row = negotiated_patient_call(&h).await;

        h.factory
            .last()
            .emit_error(TransportError::ConnectionFailed("ice failed".into()));
        settle().await;

        let snap = h.orch.snapshot().await;
        assert_eq!(snap.phase, CallPhase::Idle);
        assert!(snap.last_error.unwrap().contains("ice failed"));
        assert_eq!(h.factory.last().calls().cleanups, 1);
        let stored = h.store.fetch_call(&row.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Ended);
        assert_eq!(h.orch.view().borrow().call_status, StatusLabel::Waiting);
        assert!(h.orch.view().borrow().error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_offer_fails_the_attempt() {
        let h = Harness::new(SessionContext::patient());
        let row = h.orch.start_call().await.unwrap();
        h.factory.last().fail_offers();
        past_settle_delay().await;

        let snap = h.orch.snapshot().await;
        assert_eq!(snap.phase, CallPhase::Idle);
        assert!(snap.last_error.unwrap().contains("offer rejected"));
        assert!(h.store.signals_of("offer").is_empty());
        let stored = h.store.fetch_call(&row.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn relay_failure_fails_the_attempt() {
        let h = Harness::new(SessionContext::patient());
        h.store.fail_signaling(true);
        let row = h.orch.start_call().await.unwrap();
        past_settle_delay().await;

        let snap = h.orch.snapshot().await;
        assert_eq!(snap.phase, CallPhase::Idle);
        assert!(snap.last_error.unwrap().contains("signaling update refused"));
        let stored = h.store.fetch_call(&row.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn insert_failure_releases_local_media() {
        let h = Harness::new(SessionContext::patient());
        h.store.fail_inserts(true);

        let err = h.orch.start_call().await.unwrap_err();
        assert!(matches!(err, CallError::Relay(_)));
        assert_eq!(h.phase().await, CallPhase::Idle);
        assert_eq!(h.factory.last().calls().cleanups, 1);
        assert!(h
            .factory
            .devices()
            .issued_streams()
            .iter()
            .all(|s| s.live_tracks() == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn operations_outside_their_phase_are_rejected() {
        let h = Harness::new(SessionContext::patient());
        assert!(matches!(
            h.orch.end_call().await,
            Err(CallError::InvalidState(_))
        ));

        h.orch.start_call().await.unwrap();
        assert!(matches!(
            h.orch.start_call().await,
            Err(CallError::InvalidState(_))
        ));
        assert_eq!(h.factory.created().len(), 1);

        let own = h.other_side(Role::Patient).create_call_row().await.unwrap();
        assert!(matches!(
            h.orch.join_call(&own).await,
            Err(CallError::InvalidState(_))
        ));
        assert_eq!(h.phase().await, CallPhase::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn toggles_apply_to_next_call_or_to_the_live_transport() {
        let h = Harness::new(SessionContext::patient());
        assert!(!h.orch.toggle_video().await);
        assert!(!h.orch.snapshot().await.video_enabled);

        h.orch.start_call().await.unwrap();
        let local = h.orch.snapshot().await.local_stream.unwrap();
        assert_eq!(local.tracks_of(MediaKind::Video).count(), 0);
        assert_eq!(local.tracks_of(MediaKind::Audio).count(), 1);

        assert!(!h.orch.toggle_audio().await);
        assert_eq!(h.factory.last().calls().audio_enabled, Some(false));
        assert!(!h.orch.view().borrow().audio_enabled);
        assert_eq!(h.factory.last().calls().offers, 0);
    }

    #[tokio::test]
    async fn expired_admin_session_cannot_build_orchestrator() {
        let creds = AdminCredentials {
            email: "care@clinic.example".into(),
            password: "letmein".into(),
        };
        let expired =
            SessionContext::admin_login("care@clinic.example", "letmein", &creds, Duration::ZERO)
                .unwrap();
        let journal = Journal::default();
        let result = CallOrchestrator::new(
            expired,
            Arc::new(TestStore::new(journal.clone())),
            Arc::new(MockFactory::new(journal)),
            CallConfig::default(),
        );
        assert!(matches!(result, Err(CallError::Auth(AuthError::Expired))));
    }
}
