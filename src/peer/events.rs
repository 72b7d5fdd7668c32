use crate::error::TransportError;
use crate::peer::media::RemoteStream;
use crate::peer::types::IceCandidate;
use std::sync::Mutex;

pub type RemoteStreamHandler = Box<dyn Fn(RemoteStream) + Send + Sync>;
pub type CandidateHandler = Box<dyn Fn(IceCandidate) + Send + Sync>;
pub type ErrorHandler = Box<dyn Fn(TransportError) + Send + Sync>;

/// Списки подписчиков на события транспорта.
///
/// Подписчики не перезаписывают друг друга; вызываются в порядке регистрации.
/// Обработчики не должны блокироваться: всё тяжёлое уходит в канал.
#[derive(Default)]
pub struct Observers {
    remote_stream: Mutex<Vec<RemoteStreamHandler>>,
    local_candidate: Mutex<Vec<CandidateHandler>>,
    error: Mutex<Vec<ErrorHandler>>,
}

impl Observers {
    pub fn on_remote_stream(&self, handler: RemoteStreamHandler) {
        if let Ok(mut list) = self.remote_stream.lock() {
            list.push(handler);
        }
    }

    pub fn on_local_candidate(&self, handler: CandidateHandler) {
        if let Ok(mut list) = self.local_candidate.lock() {
            list.push(handler);
        }
    }

    pub fn on_error(&self, handler: ErrorHandler) {
        if let Ok(mut list) = self.error.lock() {
            list.push(handler);
        }
    }

    pub fn emit_remote_stream(&self, stream: &RemoteStream) {
        if let Ok(list) = self.remote_stream.lock() {
            for handler in list.iter() {
                handler(stream.clone());
            }
        }
    }

    pub fn emit_local_candidate(&self, candidate: &IceCandidate) {
        if let Ok(list) = self.local_candidate.lock() {
            for handler in list.iter() {
                handler(candidate.clone());
            }
        }
    }

    pub fn emit_error(&self, err: &TransportError) {
        if let Ok(list) = self.error.lock() {
            for handler in list.iter() {
                handler(err.clone());
            }
        }
    }

    /// Сбрасывает всех подписчиков
    pub fn clear(&self) {
        if let Ok(mut list) = self.remote_stream.lock() {
            list.clear();
        }
        if let Ok(mut list) = self.local_candidate.lock() {
            list.clear();
        }
        if let Ok(mut list) = self.error.lock() {
            list.clear();
        }
    }

    pub fn is_empty(&self) -> bool {
        let count = |n: Option<usize>| n.unwrap_or(0);
        count(self.remote_stream.lock().ok().map(|l| l.len()))
            + count(self.local_candidate.lock().ok().map(|l| l.len()))
            + count(self.error.lock().ok().map(|l| l.len()))
            == 0
    }
}
