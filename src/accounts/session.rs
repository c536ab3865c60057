use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::db::models::SessionUser;

/// Token byte length before hex encoding (32 bytes = 64 hex chars).
const TOKEN_BYTES: usize = 32;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
struct Session {
    user: SessionUser,
    expires_at: DateTime<Utc>,
}

/// Process-local sessions keyed by opaque token. Nothing survives a restart.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            clock,
        }
    }

    pub async fn create(&self, user: SessionUser) -> String {
        let token = new_token();
        let session = Session {
            user,
            // Saturate rather than panic if the TTL runs past chrono's range.
            expires_at: self
                .clock
                .now()
                .checked_add_signed(self.ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        self.sessions.lock().await.insert(token.clone(), session);
        token
    }

    /// The identity behind `token`, if the session exists and hasn't expired.
    /// Expired entries are dropped on the way out.
    pub async fn get(&self, token: &str) -> Option<SessionUser> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get(token)?;

        if session.expires_at <= self.clock.now() {
            sessions.remove(token);
            return None;
        }

        Some(session.user.clone())
    }

    pub async fn remove(&self, token: &str) -> bool {
        self.sessions.lock().await.remove(token).is_some()
    }

    /// Drops every expired session, returning how many went.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.expires_at > now);
        before - sessions.len()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

fn new_token() -> String {
    hex::encode(rand::random::<[u8; TOKEN_BYTES]>())
}
