// src/session.rs - Live sessions, token revocation and auth events
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

use crate::error::ApiResult;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuthEvent {
    SignedIn { user_id: String },
    SignedOut { user_id: String },
    ProfileUpdated { user_id: String },
    PasswordChanged { user_id: String },
}

impl AuthEvent {
    pub fn user_id(&self) -> &str {
        match self {
            AuthEvent::SignedIn { user_id }
            | AuthEvent::SignedOut { user_id }
            | AuthEvent::ProfileUpdated { user_id }
            | AuthEvent::PasswordChanged { user_id } => user_id,
        }
    }
}

#[derive(Debug, Clone)]
struct SessionEntry {
    user_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct StoredSession {
    jti: String,
    user_id: String,
    expires_at: DateTime<Utc>,
    revoked_at: Option<DateTime<Utc>>,
}

/// Single source of truth for who is signed in.
///
/// Tokens are stateless JWTs; the hub only remembers their ids so that a
/// sign-out can invalidate a token before it expires. Every change is written
/// to `auth_sessions` first, and `restore` rebuilds the in-memory view after a
/// restart.
pub struct SessionHub {
    pool: SqlitePool,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    revoked: RwLock<HashMap<String, DateTime<Utc>>>,
    events: broadcast::Sender<AuthEvent>,
}

impl SessionHub {
    pub fn new(pool: SqlitePool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pool,
            sessions: RwLock::new(HashMap::new()),
            revoked: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Loads unexpired sessions and revocations from the database.
    pub async fn restore(&self) -> ApiResult<usize> {
        let rows = sqlx::query_as::<_, StoredSession>(
            "SELECT jti, user_id, expires_at, revoked_at FROM auth_sessions"
        )
            .fetch_all(&self.pool)
            .await?;

        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let mut revoked = self.revoked.write().await;
        let mut restored = 0;
        for row in rows.into_iter().filter(|row| row.expires_at > now) {
            if row.revoked_at.is_some() {
                revoked.insert(row.jti, row.expires_at);
            } else {
                sessions.insert(
                    row.jti,
                    SessionEntry {
                        user_id: row.user_id,
                        expires_at: row.expires_at,
                    },
                );
            }
            restored += 1;
        }
        Ok(restored)
    }

    pub async fn register_session(
        &self,
        token_id: &str,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> ApiResult<()> {
        sqlx::query(
            "INSERT INTO auth_sessions (jti, user_id, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(jti) DO NOTHING"
        )
            .bind(token_id)
            .bind(user_id)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;

        self.sessions.write().await.insert(
            token_id.to_string(),
            SessionEntry {
                user_id: user_id.to_string(),
                expires_at,
            },
        );
        self.publish(AuthEvent::SignedIn { user_id: user_id.to_string() });
        Ok(())
    }

    /// Revokes one token. Returns false when it was already revoked.
    pub async fn revoke(
        &self,
        token_id: &str,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> ApiResult<bool> {
        sqlx::query(
            "INSERT INTO auth_sessions (jti, user_id, expires_at, revoked_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(jti) DO UPDATE SET revoked_at = COALESCE(auth_sessions.revoked_at, excluded.revoked_at)"
        )
            .bind(token_id)
            .bind(user_id)
            .bind(expires_at)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        let entry = self.sessions.write().await.remove(token_id);
        let newly_revoked = self
            .revoked
            .write()
            .await
            .insert(token_id.to_string(), expires_at)
            .is_none();

        if let Some(entry) = entry {
            self.publish(AuthEvent::SignedOut { user_id: entry.user_id });
        }
        Ok(newly_revoked)
    }

    /// Revokes every live session of a user, e.g. after a password change.
    pub async fn revoke_user(&self, user_id: &str) -> ApiResult<usize> {
        let result = sqlx::query(
            "UPDATE auth_sessions SET revoked_at = ? WHERE user_id = ? AND revoked_at IS NULL"
        )
            .bind(Utc::now())
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        let removed: Vec<(String, SessionEntry)> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, entry)| entry.user_id == user_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let mut revoked = self.revoked.write().await;
        for (id, entry) in &removed {
            revoked.insert(id.clone(), entry.expires_at);
        }
        Ok(result.rows_affected() as usize)
    }

    pub async fn is_revoked(&self, token_id: &str) -> bool {
        self.revoked.read().await.contains_key(token_id)
    }

    pub async fn active_sessions(&self) -> usize {
        let now = Utc::now();
        self.sessions
            .read()
            .await
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    pub fn publish(&self, event: AuthEvent) {
        // No receivers is fine; the event is simply dropped.
        let _ = self.events.send(event);
    }

    /// Drops sessions and revocations whose tokens can no longer verify.
    pub async fn purge_expired(&self) -> ApiResult<usize> {
        let now = Utc::now();
        sqlx::query("DELETE FROM auth_sessions WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;

        let mut purged = 0;
        {
            let mut sessions = self.sessions.write().await;
            let before = sessions.len();
            sessions.retain(|_, entry| entry.expires_at > now);
            purged += before - sessions.len();
        }
        {
            let mut revoked = self.revoked.write().await;
            let before = revoked.len();
            revoked.retain(|_, expires_at| *expires_at > now);
            purged += before - revoked.len();
        }

        Ok(purged)
    }
}

/// Logs auth events until the hub is dropped.
pub async fn log_auth_events(mut receiver: broadcast::Receiver<AuthEvent>) {
    loop {
        match receiver.recv().await {
            Ok(event) => match &event {
                AuthEvent::SignedIn { user_id } => log::info!("Session started for user {}", user_id),
                AuthEvent::SignedOut { user_id } => log::info!("Session ended for user {}", user_id),
                AuthEvent::ProfileUpdated { user_id } => log::debug!("Profile updated for user {}", user_id),
                AuthEvent::PasswordChanged { user_id } => log::info!("Password changed for user {}", user_id),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("Auth event logger lagged, skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
