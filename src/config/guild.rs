use serde::{Deserialize, Serialize};

use crate::error::{Result, VerificationError};

/// Per-guild verification settings, maintained by operators in the data
/// directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuildConfig {
    pub guild_id: u64,

    /// Role granted to verified members
    pub trusted_role_id: u64,

    /// Individual users treated as staff in addition to reviewers
    #[serde(default)]
    pub additional_staff: Vec<u64>,

    /// Roles whose holders are treated as staff
    #[serde(default)]
    pub additional_staff_roles: Vec<u64>,
}

impl GuildConfig {
    /// Staff check against the explicit user list and the caller's role ids.
    pub fn is_staff(&self, user_id: u64, role_ids: &[u64]) -> bool {
        self.additional_staff.contains(&user_id)
            || role_ids
                .iter()
                .any(|r| self.additional_staff_roles.contains(r))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GuildConfigFile {
    #[serde(default)]
    guilds: Vec<GuildConfig>,
}

/// Reads guild configuration from `<data_path>/guilds.json`.
///
/// Every lookup re-reads the file so operations always see current role ids;
/// nothing is cached between operations.
#[derive(Debug, Clone)]
pub struct GuildDirectory {
    path: String,
}

impl GuildDirectory {
    pub fn new(data_path: &str) -> Self {
        Self {
            path: format!("{}/guilds.json", data_path),
        }
    }

    async fn read_all(&self) -> Result<Vec<GuildConfig>> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            VerificationError::ConfigLoad {
                path: self.path.clone(),
                source: e,
            }
        })?;
        let file: GuildConfigFile =
            serde_json::from_str(&content).map_err(|e| VerificationError::ConfigParse {
                path: self.path.clone(),
                source: e,
            })?;
        Ok(file.guilds)
    }

    /// Current configuration for one guild.
    pub async fn snapshot(&self, guild_id: u64) -> Result<GuildConfig> {
        self.read_all()
            .await?
            .into_iter()
            .find(|c| c.guild_id == guild_id)
            .ok_or(VerificationError::GuildNotConfigured { guild_id })
    }

    pub async fn configured_guilds(&self) -> Result<Vec<GuildConfig>> {
        self.read_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_config(dir: &str, json: &str) {
        tokio::fs::create_dir_all(dir).await.unwrap();
        tokio::fs::write(format!("{}/guilds.json", dir), json)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_reads_fresh_values() {
        let dir = std::env::temp_dir()
            .join(format!("warden-guilds-{}", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .into_owned();
        write_config(
            &dir,
            r#"{"guilds": [{"guild_id": 1, "trusted_role_id": 100}]}"#,
        )
        .await;

        let directory = GuildDirectory::new(&dir);
        assert_eq!(directory.snapshot(1).await.unwrap().trusted_role_id, 100);

        // Operator edits the file; the next snapshot sees it
        write_config(
            &dir,
            r#"{"guilds": [{"guild_id": 1, "trusted_role_id": 200}]}"#,
        )
        .await;
        assert_eq!(directory.snapshot(1).await.unwrap().trusted_role_id, 200);

        let err = directory.snapshot(9).await.unwrap_err();
        assert!(matches!(
            err,
            VerificationError::GuildNotConfigured { guild_id: 9 }
        ));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[test]
    fn test_is_staff() {
        let config = GuildConfig {
            guild_id: 1,
            trusted_role_id: 100,
            additional_staff: vec![7],
            additional_staff_roles: vec![55],
        };

        assert!(config.is_staff(7, &[]));
        assert!(config.is_staff(8, &[55, 56]));
        assert!(!config.is_staff(8, &[56]));
    }
}
