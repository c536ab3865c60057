use std::sync::Arc;

use crate::accounts::password::Hasher;
use crate::accounts::session::SessionStore;
use crate::db::models::SessionUser;
use crate::db::store::UserStore;
use crate::error::AppError;

/// Credential checks and the session lifecycle. Reads the user store but
/// never writes it.
#[derive(Clone)]
pub struct AuthService {
    store: Arc<UserStore>,
    sessions: SessionStore,
    hasher: Hasher,
}

impl AuthService {
    pub fn new(store: Arc<UserStore>, sessions: SessionStore, hasher: Hasher) -> Self {
        Self {
            store,
            sessions,
            hasher,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Returns the new session token along with the identity it is bound to.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(String, SessionUser), AppError> {
        let users = self.store.load().await?;
        let Some(record) = users.iter().find(|u| u.username == username) else {
            tracing::info!(username, "Login rejected: unknown user");
            return Err(AppError::InvalidCredentials);
        };

        let matches = match self.hasher.verify(password, &record.password_hash).await {
            Ok(matches) => matches,
            Err(e) => {
                tracing::warn!(username, "Stored password hash is unusable: {e}");
                false
            }
        };
        if !matches {
            tracing::info!(username, "Login rejected: wrong password");
            return Err(AppError::InvalidCredentials);
        }

        let user = SessionUser::from(record);
        let token = self.sessions.create(user.clone()).await;
        tracing::info!(user_id = user.id, username, role = %user.role, "Login succeeded");

        Ok((token, user))
    }

    pub async fn logout(&self, token: &str) {
        if self.sessions.remove(token).await {
            tracing::info!("Session ended");
        }
    }

    pub async fn current_session(&self, token: &str) -> Option<SessionUser> {
        self.sessions.get(token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::session::testing::ManualClock;
    use crate::db::models::Role;
    use chrono::Duration;
    use tempfile::TempDir;

    async fn seeded() -> (TempDir, AuthService) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(UserStore::new(dir.path().join("users.json")));
        let hasher = Hasher::fast();
        store.init(&hasher, "admin123").await.unwrap();
        let sessions = SessionStore::new(Duration::hours(24), ManualClock::new());
        (dir, AuthService::new(store, sessions, hasher))
    }

    #[tokio::test]
    async fn test_login_then_current_session() {
        let (_dir, auth) = seeded().await;
        let (token, user) = auth.login("admin", "admin123").await.unwrap();

        assert_eq!(user.id, 1);
        assert_eq!(user.username, "admin");
        assert_eq!(user.role, Role::Admin);
        assert_eq!(auth.current_session(&token).await, Some(user.clone()));

        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("password").is_none());
    }

    #[tokio::test]
    async fn test_wrong_password_and_unknown_user() {
        let (_dir, auth) = seeded().await;

        let err = auth.login("admin", "nope").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidCredentials));

        let err = auth.login("ghost", "admin123").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidCredentials));

        // Lookup is an exact match.
        let err = auth.login("Admin", "admin123").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidCredentials));

        assert_eq!(auth.sessions().len().await, 0);
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let (_dir, auth) = seeded().await;
        let (token, _) = auth.login("admin", "admin123").await.unwrap();

        auth.logout(&token).await;
        auth.logout(&token).await;
        assert!(auth.current_session(&token).await.is_none());
    }

    #[tokio::test]
    async fn test_unusable_hash_is_invalid_credentials() {
        let (_dir, auth) = seeded().await;
        let mut users = auth.store.load().await.unwrap();
        users[0].password_hash = "$2b$10$legacybcrypthashvalue".to_string();
        auth.store.save(&users).await.unwrap();

        let err = auth.login("admin", "admin123").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_login_surfaces_storage_failure() {
        let (_dir, auth) = seeded().await;
        std::fs::write(auth.store.path(), "garbage").unwrap();

        let err = auth.login("admin", "admin123").await.unwrap_err();
        assert!(matches!(err, AppError::StorageUnavailable(_)));
    }
}
