//! Backup records of previously deployed images.
//!
//! The store is written by the update engine every time it replaces an image;
//! this crate only reads it to find a rollback target.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub image_name: String,
    pub image_tag: String,
    pub created_at: DateTime<Utc>,
}

impl BackupRecord {
    /// Image reference the container is recreated from.
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image_name, self.image_tag)
    }
}

#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Backups recorded for `container_name`, newest first.
    async fn backups_for(&self, container_name: &str) -> Result<Vec<BackupRecord>, StoreError>;
}

/// Backups kept in a JSON document keyed by container name.
///
/// ```json
/// { "web": [{ "imageName": "nginx", "imageTag": "1.25", "createdAt": "2024-05-01T10:00:00Z" }] }
/// ```
///
/// The file is re-read on every query because another process appends to it.
#[derive(Debug, Clone)]
pub struct FileBackupStore {
    path: PathBuf,
}

impl FileBackupStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<HashMap<String, Vec<BackupRecord>>, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(HashMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("Backup store {:?} does not exist yet", self.path);
                Ok(HashMap::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BackupStore for FileBackupStore {
    async fn backups_for(&self, container_name: &str) -> Result<Vec<BackupRecord>, StoreError> {
        let mut records = self
            .load()
            .await?
            .remove(container_name)
            .unwrap_or_default();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}
