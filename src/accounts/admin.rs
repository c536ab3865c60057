use serde::Deserialize;
use std::sync::Arc;

use crate::accounts::password::Hasher;
use crate::accounts::session::Clock;
use crate::db::models::{PublicUser, Role, SessionUser, UserRecord};
use crate::db::store::{UserStore, next_id};
use crate::error::AppError;

#[derive(Debug, Default, Deserialize)]
pub struct NewUser {
    pub username: Option<String>,
    pub password: Option<String>,
    pub role: Option<String>,
}

/// A partial update: absent (or empty) fields keep their stored value.
#[derive(Debug, Default, Deserialize)]
pub struct UserChanges {
    pub username: Option<String>,
    pub password: Option<String>,
    pub role: Option<String>,
}

/// User management on behalf of an admin session.
///
/// Every operation checks the caller's role before the store is touched.
/// Username uniqueness is checked on create only; a rename may collide
/// with an existing account.
#[derive(Clone)]
pub struct UserAdmin {
    store: Arc<UserStore>,
    hasher: Hasher,
    clock: Arc<dyn Clock>,
}

impl UserAdmin {
    pub fn new(store: Arc<UserStore>, hasher: Hasher, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            hasher,
            clock,
        }
    }

    pub async fn list_users(&self, caller: Option<&SessionUser>) -> Result<Vec<PublicUser>, AppError> {
        require_admin(caller)?;

        let users = self.store.load().await?;
        Ok(users.iter().map(PublicUser::from).collect())
    }

    pub async fn create_user(
        &self,
        caller: Option<&SessionUser>,
        request: NewUser,
    ) -> Result<PublicUser, AppError> {
        let admin = require_admin(caller)?;

        let (Some(username), Some(password)) =
            (supplied(request.username), supplied(request.password))
        else {
            return Err(AppError::BadRequest(
                "Username and password required".to_string(),
            ));
        };
        let role = parse_role(request.role)?.unwrap_or(Role::User);

        let password_hash = self.hasher.hash(&password).await?;
        let created_at = self.clock.now();

        let user = self
            .store
            .update(|users| {
                if users.iter().any(|u| u.username == username) {
                    return Err(AppError::Conflict("Username already exists".to_string()));
                }

                let record = UserRecord {
                    id: next_id(users),
                    username,
                    password_hash,
                    role,
                    created_at,
                };
                let public = PublicUser::from(&record);
                users.push(record);
                Ok(public)
            })
            .await?;

        tracing::info!(
            by = %admin.username,
            user_id = user.id,
            username = %user.username,
            role = %user.role,
            "User created"
        );
        Ok(user)
    }

    pub async fn update_user(
        &self,
        caller: Option<&SessionUser>,
        id: u64,
        changes: UserChanges,
    ) -> Result<PublicUser, AppError> {
        let admin = require_admin(caller)?;

        let username = supplied(changes.username);
        let role = parse_role(changes.role)?;
        let password_hash = match supplied(changes.password) {
            Some(password) => {
                // Don't spend a hash on an id that isn't there.
                if !self.store.load().await?.iter().any(|u| u.id == id) {
                    return Err(AppError::NotFound);
                }
                Some(self.hasher.hash(&password).await?)
            }
            None => None,
        };

        let user = self
            .store
            .update(|users| -> Result<PublicUser, AppError> {
                let record = users
                    .iter_mut()
                    .find(|u| u.id == id)
                    .ok_or(AppError::NotFound)?;

                if let Some(username) = username {
                    record.username = username;
                }
                if let Some(password_hash) = password_hash {
                    record.password_hash = password_hash;
                }
                if let Some(role) = role {
                    record.role = role;
                }

                Ok(PublicUser::from(&*record))
            })
            .await?;

        tracing::info!(by = %admin.username, user_id = id, "User updated");
        Ok(user)
    }

    /// Removing an id that doesn't exist still succeeds. Returns whether a
    /// record was actually removed.
    pub async fn delete_user(&self, caller: Option<&SessionUser>, id: u64) -> Result<bool, AppError> {
        let admin = require_admin(caller)?;

        let removed = self
            .store
            .update(|users| {
                let before = users.len();
                users.retain(|u| u.id != id);
                Ok::<_, AppError>(users.len() < before)
            })
            .await?;

        if removed {
            tracing::info!(by = %admin.username, user_id = id, "User deleted");
        }
        Ok(removed)
    }
}

pub fn require_admin(caller: Option<&SessionUser>) -> Result<&SessionUser, AppError> {
    match caller {
        Some(user) if user.is_admin() => Ok(user),
        _ => Err(AppError::Forbidden),
    }
}

fn supplied(field: Option<String>) -> Option<String> {
    field.filter(|value| !value.is_empty())
}

fn parse_role(role: Option<String>) -> Result<Option<Role>, AppError> {
    match supplied(role) {
        Some(role) => role
            .parse()
            .map(Some)
            .map_err(|_| AppError::BadRequest(format!("Invalid role: {role}"))),
        None => Ok(None),
    }
}
