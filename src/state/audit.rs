use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Result, VerificationError};

use super::identity::UserIdentity;

/// One staff command execution, recorded before the command runs and
/// completed after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub identity: UserIdentity,
    pub command: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: serde_json::Map<String, serde_json::Value>,
    pub requested: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
}

/// Append-only log of staff command executions.
#[derive(Debug, Serialize, Deserialize)]
pub struct AuditLog {
    pub entries: Vec<AuditEntry>,

    #[serde(skip)]
    path: String,
}

impl AuditLog {
    /// Fresh log backed by `path`, for recovery from an unreadable file.
    pub fn empty(path: &str) -> Self {
        Self {
            entries: Vec::new(),
            path: path.to_string(),
        }
    }

    pub async fn load(path: &str) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let mut log: AuditLog = serde_json::from_str(&content).map_err(|e| {
                    VerificationError::ConfigParse {
                        path: path.to_string(),
                        source: e,
                    }
                })?;
                log.path = path.to_string();
                Ok(log)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self {
                entries: Vec::new(),
                path: path.to_string(),
            }),
            Err(e) => Err(VerificationError::StateLoad {
                path: path.to_string(),
                source: e,
            }),
        }
    }

    async fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        let temp_path = format!("{}.tmp", self.path);
        tokio::fs::write(&temp_path, &content)
            .await
            .map_err(|e| VerificationError::StateSave {
                path: self.path.clone(),
                source: e,
            })?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| VerificationError::StateSave {
                path: self.path.clone(),
                source: e,
            })?;
        Ok(())
    }

    /// Record a command invocation; returns the entry id for completion.
    pub async fn record(
        &mut self,
        identity: UserIdentity,
        command: &str,
        options: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Uuid> {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            identity,
            command: command.to_string(),
            options,
            requested: Utc::now(),
            completed: None,
        };
        let id = entry.id;
        self.entries.push(entry);
        self.save().await?;
        Ok(id)
    }

    pub async fn complete(&mut self, id: &Uuid) -> Result<()> {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == *id) {
            entry.completed = Some(Utc::now());
        }
        self.save().await
    }

    pub fn recent(&self, count: usize) -> Vec<&AuditEntry> {
        let start = self.entries.len().saturating_sub(count);
        self.entries[start..].iter().collect()
    }
}

/// Shared audit log type
pub type SharedAuditLog = Arc<tokio::sync::RwLock<AuditLog>>;

pub fn create_shared_audit_log(log: AuditLog) -> SharedAuditLog {
    Arc::new(tokio::sync::RwLock::new(log))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> String {
        std::env::temp_dir()
            .join(format!("warden-audit-{}.json", Uuid::new_v4()))
            .to_string_lossy()
            .into_owned()
    }

    #[tokio::test]
    async fn test_record_and_complete() {
        let path = temp_path();
        let mut log = AuditLog::load(&path).await.unwrap();

        let mut options = serde_json::Map::new();
        options.insert("target".to_string(), serde_json::json!("42"));
        let id = log
            .record(UserIdentity::new(1, 7), "trust assign", options)
            .await
            .unwrap();
        assert!(log.entries[0].completed.is_none());

        log.complete(&id).await.unwrap();
        assert!(log.entries[0].completed.is_some());

        let reloaded = AuditLog::load(&path).await.unwrap();
        assert_eq!(reloaded.entries.len(), 1);
        assert_eq!(reloaded.entries[0].command, "trust assign");

        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn test_recent_returns_tail() {
        let path = temp_path();
        let mut log = AuditLog::load(&path).await.unwrap();
        for i in 0..5 {
            log.record(
                UserIdentity::new(1, i),
                "reviewer add",
                serde_json::Map::new(),
            )
            .await
            .unwrap();
        }

        let recent = log.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].identity.user_id, 3);

        tokio::fs::remove_file(&path).await.ok();
    }
}
