use crate::error::RelayError;
use crate::signaling::payload::SignalPayload;
use crate::store::{CallFilter, CallPatch, CallSession, CallStatus, CallStore, NewCall, Role};
use crate::utils::room_id;
use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Событие по строке звонка, уже отфильтрованное для слушателя
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Signal(SignalPayload),
    Ended,
}

/// Подписка на одну строку. Drop отписывает.
pub struct RelaySubscription {
    events: mpsc::UnboundedReceiver<RelayEvent>,
    task: JoinHandle<()>,
}

impl RelaySubscription {
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        self.events.recv().await
    }
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Таблица звонков как почтовый ящик сигнализации, от лица одной роли
pub struct RelayAdapter {
    store: Arc<dyn CallStore>,
    role: Role,
    // записи одной стороны не перекрываются
    write_lock: Mutex<()>,
}

impl RelayAdapter {
    pub fn new(store: Arc<dyn CallStore>, role: Role) -> Self {
        Self {
            store,
            role,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn create_call_row(&self) -> Result<CallSession, RelayError> {
        let _guard = self.write_lock.lock().await;
        let row = self
            .store
            .insert_call(NewCall {
                room_id: room_id(self.role, Utc::now()),
                started_by: self.role,
                status: CallStatus::Waiting,
            })
            .await?;
        info!("Call row {} created by {}", row.room_id, self.role);
        Ok(row)
    }

    pub async fn list_open_calls(&self) -> Result<Vec<CallSession>, RelayError> {
        Ok(self
            .store
            .select_calls(CallFilter {
                exclude_status: Some(CallStatus::Ended),
                newest_first: true,
            })
            .await?)
    }

    pub async fn fetch_call(&self, call_id: &str) -> Result<Option<CallSession>, RelayError> {
        Ok(self.store.fetch_call(call_id).await?)
    }

    pub async fn publish_signal(
        &self,
        call_id: &str,
        payload: &SignalPayload,
    ) -> Result<(), RelayError> {
        let value = payload.to_value().map_err(|e| {
            RelayError(crate::error::StoreError::Backend(format!(
                "cannot encode {} payload: {e}",
                payload.kind()
            )))
        })?;
        let _guard = self.write_lock.lock().await;
        self.store.update_signaling_data(call_id, value).await?;
        debug!("{} published {} on {call_id}", self.role, payload.kind());
        Ok(())
    }

    pub async fn mark_active(&self, call_id: &str) -> Result<(), RelayError> {
        let _guard = self.write_lock.lock().await;
        self.store
            .update_call(
                call_id,
                CallPatch {
                    status: Some(CallStatus::Active),
                    started_at: Some(Utc::now()),
                    ended_at: None,
                },
            )
            .await?;
        Ok(())
    }

    pub async fn mark_ended(&self, call_id: &str) -> Result<(), RelayError> {
        let _guard = self.write_lock.lock().await;
        self.store
            .update_call(
                call_id,
                CallPatch {
                    status: Some(CallStatus::Ended),
                    started_at: None,
                    ended_at: Some(Utc::now()),
                },
            )
            .await?;
        info!("Call {call_id} marked ended by {}", self.role);
        Ok(())
    }

    /// Слушает изменения строки `call`.
    ///
    /// Сигнал отдаётся только если `signalingData` отличается от последнего
    /// увиденного значения; свои сообщения и битые payload отбрасываются.
    pub fn subscribe(&self, call: &CallSession) -> RelaySubscription {
        let mut changes = self.store.subscribe();
        let (tx, events) = mpsc::unbounded_channel();
        let role = self.role;
        let call_id = call.id.clone();
        let room = call.room_id.clone();
        let mut last_seen = call.signaling_data.clone();

        let task = tokio::spawn(async move {
            loop {
                let change = match changes.recv().await {
                    Ok(change) => change,
                    Err(RecvError::Lagged(n)) => {
                        warn!("Relay for {room} lagged, {n} row changes skipped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let row = change.new;
                if row.room_id != room || row.id != call_id {
                    continue;
                }

                if row.signaling_data != last_seen {
                    last_seen = row.signaling_data.clone();
                    if let Some(value) = &row.signaling_data {
                        match SignalPayload::parse(value) {
                            Ok(payload) if payload.author(row.started_by) == role => {
                                debug!("Skipping own {} on {room}", payload.kind());
                            }
                            Ok(payload) => {
                                if tx.send(RelayEvent::Signal(payload)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("Dropping signaling payload on {room}: {e}"),
                        }
                    }
                }

                if row.status == CallStatus::Ended {
                    debug!("Row {room} turned ended");
                    let _ = tx.send(RelayEvent::Ended);
                    break;
                }
            }
        });

        RelaySubscription { events, task }
    }
}
