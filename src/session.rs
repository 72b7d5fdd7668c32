use crate::config::AdminCredentials;
use crate::error::AuthError;
use crate::store::Role;
use chrono::{DateTime, Utc};
use log::{info, warn};
use std::time::Duration;

/// Кто сидит за этим экземпляром и до какого момента
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    role: Role,
    issued_at: DateTime<Utc>,
    /// `None` у пациента: сессия бессрочная
    expires_at: Option<DateTime<Utc>>,
}

impl SessionContext {
    pub fn patient() -> Self {
        Self {
            role: Role::Patient,
            issued_at: Utc::now(),
            expires_at: None,
        }
    }

    /// Вход в консоль администратора
    pub fn admin_login(
        email: &str,
        password: &str,
        credentials: &AdminCredentials,
        ttl: Duration,
    ) -> Result<Self, AuthError> {
        let email_ok = email.trim().eq_ignore_ascii_case(credentials.email.trim());
        if !email_ok || password != credentials.password {
            warn!("Admin login rejected for {}", email.trim());
            return Err(AuthError::InvalidCredentials);
        }
        let issued_at = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| issued_at.checked_add_signed(ttl));
        info!("Admin session issued for {}", credentials.email);
        Ok(Self {
            role: Role::Admin,
            issued_at,
            expires_at,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Проверка защищённого маршрута
    pub fn guard(&self, required: Role, now: DateTime<Utc>) -> Result<(), AuthError> {
        if self.expires_at.is_some_and(|at| now >= at) {
            return Err(AuthError::Expired);
        }
        if self.role != required {
            return Err(AuthError::Forbidden(required.as_str()));
        }
        Ok(())
    }
}
