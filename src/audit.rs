use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditAction {
    Rollback,
    SelfUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Error,
}

impl AsRef<str> for AuditStatus {
    fn as_ref(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// One outcome fact. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub container_name: String,
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    pub status: AuditStatus,
    pub details: Option<String>,
}

impl AuditRecord {
    pub fn new(action: AuditAction, container_name: &str, status: AuditStatus) -> Self {
        Self {
            id: Uuid::now_v7(),
            timestamp: Utc::now(),
            action,
            container_name: container_name.to_string(),
            from_version: None,
            to_version: None,
            status,
            details: None,
        }
    }

    pub fn versions(mut self, from: Option<String>, to: Option<String>) -> Self {
        self.from_version = from;
        self.to_version = to;
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<(), StoreError>;
}

/// Audit log as JSON lines, one record per line.
#[derive(Debug)]
pub struct JsonlAuditLog {
    path: PathBuf,
    // Serializes appends so concurrent monitors never interleave lines.
    write_lock: Mutex<()>,
}

impl JsonlAuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl AuditSink for JsonlAuditLog {
    async fn record(&self, record: AuditRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
