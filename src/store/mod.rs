//! Общая таблица звонков как непрозрачное хранилище строк.

pub mod memory;

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub use memory::MemoryStore;

/// Кто начал звонок
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Patient,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Patient => "patient",
            Self::Admin => "admin",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::Patient => Self::Admin,
            Self::Admin => Self::Patient,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Waiting,
    Active,
    Ended,
}

/// Строка таблицы звонков
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub id: String,
    pub room_id: String,
    pub started_by: Role,
    pub status: CallStatus,
    /// Последнее сигнальное сообщение; перезаписывается на каждом шаге
    #[serde(default)]
    pub signaling_data: Option<serde_json::Value>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CallSession {
    pub fn is_open(&self) -> bool {
        self.status != CallStatus::Ended
    }
}

#[derive(Debug, Clone)]
pub struct NewCall {
    pub room_id: String,
    pub started_by: Role,
    pub status: CallStatus,
}

/// Частичное обновление строки. `started_at` пишется только один раз.
#[derive(Debug, Clone, Default)]
pub struct CallPatch {
    pub status: Option<CallStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct CallFilter {
    pub exclude_status: Option<CallStatus>,
    pub newest_first: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    Insert,
    Update,
}

/// Уведомление об изменении строки
#[derive(Debug, Clone)]
pub struct RowChange {
    pub event: ChangeEvent,
    pub new: CallSession,
    pub old: Option<CallSession>,
}

/// Минимальный набор операций над таблицей звонков
#[async_trait]
pub trait CallStore: Send + Sync {
    async fn insert_call(&self, new: NewCall) -> Result<CallSession, StoreError>;

    async fn update_call(&self, id: &str, patch: CallPatch) -> Result<CallSession, StoreError>;

    /// Отдельная процедура для записи `signalingData`
    async fn update_signaling_data(
        &self,
        id: &str,
        data: serde_json::Value,
    ) -> Result<(), StoreError>;

    async fn fetch_call(&self, id: &str) -> Result<Option<CallSession>, StoreError>;

    async fn select_calls(&self, filter: CallFilter) -> Result<Vec<CallSession>, StoreError>;

    /// Все вставки и обновления таблицы
    fn subscribe(&self) -> broadcast::Receiver<RowChange>;
}
