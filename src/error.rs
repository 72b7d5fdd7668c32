//! Ошибки ядра звонка.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Причина отказа устройства захвата
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaAccessReason {
    PermissionDenied,
    DeviceNotFound,
    DeviceBusy,
    Unsupported,
}

impl MediaAccessReason {
    /// Имя отказа платформы (в стиле DOM exception) в причину
    pub fn from_platform(name: &str) -> Self {
        match name {
            "NotAllowedError" | "PermissionDeniedError" | "SecurityError" => {
                Self::PermissionDenied
            }
            "NotFoundError" | "DevicesNotFoundError" | "OverconstrainedError" => {
                Self::DeviceNotFound
            }
            "NotReadableError" | "TrackStartError" | "AbortError" => Self::DeviceBusy,
            _ => Self::Unsupported,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission-denied",
            Self::DeviceNotFound => "device-not-found",
            Self::DeviceBusy => "device-busy",
            Self::Unsupported => "unsupported",
        }
    }

    /// Подсказка для пользователя
    pub fn hint(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "allow camera and microphone access, then try again",
            Self::DeviceNotFound => "connect a camera and microphone, then try again",
            Self::DeviceBusy => "close other applications using the camera, then try again",
            Self::Unsupported => "this device cannot capture audio and video",
        }
    }
}

impl std::fmt::Display for MediaAccessReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("media access failed ({reason}): {}", .reason.hint())]
pub struct MediaAccessError {
    pub reason: MediaAccessReason,
}

impl MediaAccessError {
    pub fn new(reason: MediaAccessReason) -> Self {
        Self { reason }
    }
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error(transparent)]
    MediaAccess(#[from] MediaAccessError),

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("invalid ice server config: {0}")]
    InvalidIceServer(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("row not found: {0}")]
    NotFound(String),

    #[error("backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("relay error: {0}")]
pub struct RelayError(#[from] pub StoreError);

#[derive(Debug, Error)]
pub enum SignalParseError {
    #[error("malformed signaling payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("empty session description")]
    EmptySdp,

    #[error("empty ice candidate")]
    EmptyCandidate,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("session expired")]
    Expired,

    #[error("access denied: {0} session required")]
    Forbidden(&'static str),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("operation not allowed: {0}")]
    InvalidState(String),
}

impl From<MediaAccessError> for CallError {
    fn from(e: MediaAccessError) -> Self {
        CallError::Transport(TransportError::MediaAccess(e))
    }
}

impl From<StoreError> for CallError {
    fn from(e: StoreError) -> Self {
        CallError::Relay(RelayError(e))
    }
}
