use chrono::Utc;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

use crate::accounts::password::Hasher;
use crate::db::models::{Role, StoreDocument, UserRecord};
use crate::error::StoreError;

pub const DEFAULT_ADMIN_USERNAME: &str = "admin";

#[derive(Serialize)]
struct DocumentRef<'a> {
    users: &'a [UserRecord],
}

/// The user collection, persisted as one JSON document and always read and
/// written whole.
///
/// Every write goes through `writer`, so a load/modify/save cycle run via
/// [`UserStore::update`] cannot interleave with another writer in this
/// process. Other processes writing the same file are not coordinated.
pub struct UserStore {
    path: PathBuf,
    writer: Mutex<()>,
}

impl UserStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Seeds the default admin account if no document exists yet.
    /// Returns whether seeding happened.
    pub async fn init(&self, hasher: &Hasher, default_password: &str) -> Result<bool, StoreError> {
        let _guard = self.writer.lock().await;

        let exists = fs::try_exists(&self.path)
            .await
            .map_err(|source| StoreError::Read {
                path: self.path.clone(),
                source,
            })?;
        if exists {
            return Ok(false);
        }

        let admin = UserRecord {
            id: 1,
            username: DEFAULT_ADMIN_USERNAME.to_string(),
            password_hash: hasher.hash(default_password).await?,
            role: Role::Admin,
            created_at: Utc::now(),
        };
        self.write_document(&[admin]).await?;
        tracing::info!(path = %self.path.display(), "Seeded user store with default admin");

        Ok(true)
    }

    /// Current records, or an empty list when the document does not exist.
    pub async fn load(&self) -> Result<Vec<UserRecord>, StoreError> {
        let data = match fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let document: StoreDocument =
            serde_json::from_str(&data).map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            })?;

        Ok(document.users)
    }

    /// Replaces the whole document.
    pub async fn save(&self, users: &[UserRecord]) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        self.write_document(users).await
    }

    /// Runs `apply` against the current records and persists the result, all
    /// while holding the writer lock. Nothing is written if `apply` fails.
    pub async fn update<T, E, F>(&self, apply: F) -> Result<T, E>
    where
        F: FnOnce(&mut Vec<UserRecord>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let _guard = self.writer.lock().await;

        let mut users = self.load().await?;
        let out = apply(&mut users)?;
        self.write_document(&users).await?;

        Ok(out)
    }

    // Write to a sibling temp file and rename over the target, so readers see
    // either the old or the new document and never a partial one.
    async fn write_document(&self, users: &[UserRecord]) -> Result<(), StoreError> {
        let body = serde_json::to_string_pretty(&DocumentRef { users })
            .map_err(StoreError::Serialize)?;

        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await.map_err(write_err)?;
        }

        let mut tmp_name = self.path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = self.path.with_file_name(tmp_name);

        fs::write(&tmp_path, body).await.map_err(write_err)?;
        fs::rename(&tmp_path, &self.path).await.map_err(write_err)?;

        Ok(())
    }
}

/// One past the highest id in use, or 1 for an empty store. Ids freed by
/// deletions are never handed out again.
pub fn next_id(users: &[UserRecord]) -> u64 {
    users.iter().map(|u| u.id).max().map_or(1, |max| max + 1)
}
