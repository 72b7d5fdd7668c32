use crate::call::state::{CallSnapshot, StatusLabel};
use crate::config::Labels;
use crate::peer::media::{LocalStream, RemoteStream};
use crate::store::Role;
use serde::Serialize;

/// Всё, что нужно экрану звонка
#[derive(Debug, Clone)]
pub struct CallView {
    pub local_stream: Option<LocalStream>,
    pub remote_stream: Option<RemoteStream>,
    pub video_enabled: bool,
    pub audio_enabled: bool,
    pub call_status: StatusLabel,
    pub error: Option<String>,
    pub local_label: String,
    pub remote_label: String,
}

impl CallView {
    pub fn from_snapshot(snapshot: &CallSnapshot, role: Role, labels: &Labels) -> Self {
        let (local_label, remote_label) = side_labels(role, labels);
        Self {
            local_stream: snapshot.local_stream.clone(),
            remote_stream: snapshot.remote_stream.clone(),
            video_enabled: snapshot.video_enabled,
            audio_enabled: snapshot.audio_enabled,
            call_status: snapshot.phase.status_label(),
            error: snapshot.last_error.clone(),
            local_label: local_label.to_owned(),
            remote_label: remote_label.to_owned(),
        }
    }
}

pub fn side_labels(role: Role, labels: &Labels) -> (&str, &str) {
    match role {
        Role::Patient => (labels.patient_local.as_str(), labels.patient_remote.as_str()),
        Role::Admin => (labels.admin_local.as_str(), labels.admin_remote.as_str()),
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Error,
}

/// Короткое уведомление (toast)
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub description: String,
    pub level: NoticeLevel,
}

impl Notice {
    pub fn info(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            level: NoticeLevel::Info,
        }
    }

    pub fn error(description: impl Into<String>) -> Self {
        Self {
            title: "Error".into(),
            description: description.into(),
            level: NoticeLevel::Error,
        }
    }
}
