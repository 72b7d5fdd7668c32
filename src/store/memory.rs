use crate::error::StoreError;
use crate::store::{
    CallFilter, CallPatch, CallSession, CallStore, ChangeEvent, NewCall, RowChange,
};
use crate::utils::random_id;
use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use std::sync::Mutex;
use tokio::sync::broadcast;

const CHANGE_BUFFER: usize = 256;

/// Таблица звонков в памяти процесса, с уведомлениями как у настоящей
pub struct MemoryStore {
    rows: Mutex<Vec<CallSession>>,
    changes: broadcast::Sender<RowChange>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            rows: Mutex::new(Vec::new()),
            changes,
        }
    }

    fn publish(&self, change: RowChange) {
        // нет подписчиков, это не ошибка
        let _ = self.changes.send(change);
    }

    fn with_row<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut CallSession) -> T,
    ) -> Result<(T, CallSession, CallSession), StoreError> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| StoreError::Backend("store lock poisoned".into()))?;
        let row = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_owned()))?;
        let old = row.clone();
        let out = f(row);
        row.updated_at = Utc::now();
        Ok((out, old, row.clone()))
    }
}

#[async_trait]
impl CallStore for MemoryStore {
    async fn insert_call(&self, new: NewCall) -> Result<CallSession, StoreError> {
        let now = Utc::now();
        let row = CallSession {
            id: random_id(),
            room_id: new.room_id,
            started_by: new.started_by,
            status: new.status,
            signaling_data: None,
            started_at: None,
            ended_at: None,
            created_at: now,
            updated_at: now,
        };
        self.rows
            .lock()
            .map_err(|_| StoreError::Backend("store lock poisoned".into()))?
            .push(row.clone());
        debug!("Inserted call row {} ({})", row.id, row.room_id);
        self.publish(RowChange {
            event: ChangeEvent::Insert,
            new: row.clone(),
            old: None,
        });
        Ok(row)
    }

    async fn update_call(&self, id: &str, patch: CallPatch) -> Result<CallSession, StoreError> {
        let ((), old, new) = self.with_row(id, |row| {
            if let Some(status) = patch.status {
                row.status = status;
            }
            if row.started_at.is_none() {
                row.started_at = patch.started_at;
            }
            if patch.ended_at.is_some() {
                row.ended_at = patch.ended_at;
            }
        })?;
        self.publish(RowChange {
            event: ChangeEvent::Update,
            new: new.clone(),
            old: Some(old),
        });
        Ok(new)
    }

    async fn update_signaling_data(
        &self,
        id: &str,
        data: serde_json::Value,
    ) -> Result<(), StoreError> {
        let ((), old, new) = self.with_row(id, |row| {
            row.signaling_data = Some(data);
        })?;
        self.publish(RowChange {
            event: ChangeEvent::Update,
            new,
            old: Some(old),
        });
        Ok(())
    }

    async fn fetch_call(&self, id: &str) -> Result<Option<CallSession>, StoreError> {
        let rows = self
            .rows
            .lock()
            .map_err(|_| StoreError::Backend("store lock poisoned".into()))?;
        Ok(rows.iter().find(|r| r.id == id).cloned())
    }

    async fn select_calls(&self, filter: CallFilter) -> Result<Vec<CallSession>, StoreError> {
        let rows = self
            .rows
            .lock()
            .map_err(|_| StoreError::Backend("store lock poisoned".into()))?;
        let mut out: Vec<CallSession> = rows
            .iter()
            .filter(|r| filter.exclude_status != Some(r.status))
            .cloned()
            .collect();
        if filter.newest_first {
            // при равном времени создания новее та, что вставлена позже
            out.reverse();
            out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        }
        Ok(out)
    }

    fn subscribe(&self) -> broadcast::Receiver<RowChange> {
        self.changes.subscribe()
    }
}
