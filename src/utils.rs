use crate::peer::types::IceServerConfig;
use crate::store::Role;
use chrono::{DateTime, Utc};
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Идентификатор комнаты: роль + момент создания
pub fn room_id(role: Role, at: DateTime<Utc>) -> String {
    format!("{}-call-{}", role.as_str(), at.timestamp_millis())
}

// Добавляет схему протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &IceServerConfig) -> String {
    if config.url.starts_with("turn:") || config.url.starts_with("stun:") {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}
