// Конфигурация приложения
// Логирование можно отключить только в режиме разработки

use crate::peer::types::IceServerConfig;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

// Дополнительные настройки для режима разработки
#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    // В продакшене логирование включается только через RUST_LOG
    pub const ENABLE_LOGGING: bool = false;
}

/// Публичные STUN серверы по умолчанию
pub const DEFAULT_STUN_URLS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Пауза перед созданием offer, чтобы peer connection успел достроиться
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Время жизни сессии администратора
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(8 * 60 * 60);

/// Длительность демонстрационного звонка
pub const DEFAULT_DEMO_DURATION: Duration = Duration::from_secs(10);

/// Предпочтения захвата видео
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub max_frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 1280,
            ideal_height: 720,
            max_frame_rate: 30,
        }
    }
}

/// Предпочтения захвата звука
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

/// Подписи видео-окон для каждой стороны
#[derive(Debug, Clone)]
pub struct Labels {
    pub patient_local: String,
    pub patient_remote: String,
    pub admin_local: String,
    pub admin_remote: String,
}

impl Default for Labels {
    fn default() -> Self {
        Self {
            patient_local: "You".into(),
            patient_remote: "Care Team".into(),
            admin_local: "You (Care Team)".into(),
            admin_remote: "Patient".into(),
        }
    }
}

/// Настройки одного участника звонка
#[derive(Debug, Clone)]
pub struct CallConfig {
    pub settle_delay: Duration,
    /// `None`: публичные STUN-серверы по умолчанию
    pub ice_servers: Option<Vec<IceServerConfig>>,
    pub video: VideoConstraints,
    pub audio: AudioConstraints,
    pub labels: Labels,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            ice_servers: None,
            video: VideoConstraints::default(),
            audio: AudioConstraints::default(),
            labels: Labels::default(),
        }
    }
}

impl CallConfig {
    /// Читает переопределения из переменных окружения
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_u64("CARECALL_SETTLE_DELAY_MS") {
            config.settle_delay = Duration::from_millis(ms);
        }

        if let Ok(raw) = std::env::var("CARECALL_ICE_SERVERS") {
            let servers: Vec<IceServerConfig> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .enumerate()
                .map(|(i, url)| IceServerConfig::stun(format!("env-{i}"), url))
                .collect();
            if !servers.is_empty() {
                config.ice_servers = Some(servers);
            }
        }

        config
    }
}

/// Учётные данные консоли администратора
#[derive(Clone)]
pub struct AdminCredentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl AdminCredentials {
    /// `None`, если хотя бы одна переменная не задана
    pub fn from_env() -> Option<Self> {
        let email = std::env::var("CARECALL_ADMIN_EMAIL").ok()?;
        let password = std::env::var("CARECALL_ADMIN_PASSWORD").ok()?;
        Some(Self { email, password })
    }
}

pub fn session_ttl_from_env() -> Duration {
    env_u64("CARECALL_SESSION_TTL_SECS")
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_SESSION_TTL)
}

pub fn demo_duration_from_env() -> Duration {
    env_u64("CARECALL_DEMO_SECS")
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_DEMO_DURATION)
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok()
}
