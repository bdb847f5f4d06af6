//! Session storage for the login flow.
//!
//! The verified [`UserRecord`] must survive two browser round-trips: the
//! provider redirect and the role-selection step. The store is owned by the
//! host application; this module only defines the `get`/`set`/`clear`
//! contract and an in-memory implementation.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::UserRecord;

/// Result type for session store operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur during session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Key/value storage of login state, keyed by session id.
///
/// Implementations must be thread-safe and must not assume they are the
/// only writer.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Get the user stored for a session.
    async fn get(&self, id: Uuid) -> SessionResult<Option<UserRecord>>;

    /// Store (or replace) the user for a session.
    async fn set(&self, id: Uuid, user: UserRecord) -> SessionResult<()>;

    /// Forget a session.
    async fn clear(&self, id: Uuid) -> SessionResult<()>;

    /// Remember that a login was started for this browser.
    async fn store_login_state(&self, state: LoginState) -> SessionResult<()>;

    /// Consume the login state. A state can be taken at most once.
    async fn take_login_state(&self, id: Uuid) -> SessionResult<Option<LoginState>>;

    /// Drop expired entries.
    async fn cleanup(&self) -> SessionResult<()> {
        Ok(())
    }
}

pub type SharedSessionStore = Arc<dyn SessionStore>;

/// Server-side record of a login started at `/login`.
///
/// The callback must present the same id, so an assertion is only accepted
/// by the browser that started the flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginState {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl LoginState {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    pub fn is_older_than(&self, max_age: chrono::Duration) -> bool {
        Utc::now() - self.created_at > max_age
    }
}

impl Default for LoginState {
    fn default() -> Self {
        Self::new()
    }
}

struct StoredUser {
    user: UserRecord,
    expires_at: DateTime<Utc>,
}

impl StoredUser {
    fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// In-memory session store.
///
/// Suitable for development and single-node deployments.
/// Sessions are lost on restart and not shared across nodes.
pub struct MemorySessionStore {
    ttl: chrono::Duration,
    sessions: RwLock<HashMap<Uuid, StoredUser>>,
    login_states: RwLock<HashMap<Uuid, LoginState>>,
}

impl MemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            sessions: RwLock::new(HashMap::new()),
            login_states: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, id: Uuid) -> SessionResult<Option<UserRecord>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(&id)
            .filter(|s| !s.is_expired())
            .map(|s| s.user.clone()))
    }

    async fn set(&self, id: Uuid, user: UserRecord) -> SessionResult<()> {
        let expires_at = Utc::now()
            .checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut sessions = self.sessions.write().await;
        sessions.insert(id, StoredUser { user, expires_at });
        Ok(())
    }

    async fn clear(&self, id: Uuid) -> SessionResult<()> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(&id);
        Ok(())
    }

    async fn store_login_state(&self, state: LoginState) -> SessionResult<()> {
        let mut states = self.login_states.write().await;
        states.insert(state.id, state);
        Ok(())
    }

    async fn take_login_state(&self, id: Uuid) -> SessionResult<Option<LoginState>> {
        let mut states = self.login_states.write().await;
        Ok(states.remove(&id))
    }

    async fn cleanup(&self) -> SessionResult<()> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired());
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::debug!(removed, "Removed expired login sessions");
        }
        drop(sessions);

        let ttl = self.ttl;
        self.login_states
            .write()
            .await
            .retain(|_, state| !state.is_older_than(ttl));
        Ok(())
    }
}
