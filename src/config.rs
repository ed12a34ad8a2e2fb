use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::metrics::MaterializationPolicy;
use crate::migration::DEFAULT_BATCH_SIZE;
use crate::schema::RegistryOptions;
use crate::storage::SqliteOptions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridbConfig {
    pub database: Option<String>,
    pub sqlite: SqliteOptions,
    pub policy: MaterializationPolicy,
    pub migration: MigrationConfig,
    pub schema: RegistryOptions,
}

impl Default for HybridbConfig {
    fn default() -> Self {
        Self {
            database: None,
            sqlite: SqliteOptions::default(),
            policy: MaterializationPolicy::default(),
            migration: MigrationConfig::default(),
            schema: RegistryOptions::default(),
        }
    }
}

impl HybridbConfig {
    /// Database path, falling back to the default location
    pub fn database_path(&self) -> PathBuf {
        self.database
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(default_database_path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub default_batch_size: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            default_batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("hybridb.toml")
}

pub fn default_database_path() -> PathBuf {
    default_database_path_in(Path::new("."))
}

pub fn default_database_path_in(base: &Path) -> PathBuf {
    base.join(".hybridb").join("hybridb.db")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<HybridbConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: HybridbConfig = toml::from_str(&contents)?;
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &HybridbConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use --force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn ensure_db_dir(db_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_config(Some(&dir.path().join("hybridb.toml"))).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hybridb.toml");
        std::fs::write(
            &path,
            "database = \"data/app.db\"\n\n[policy]\nexecution_time_threshold_ms = 250.0\n",
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap().unwrap();
        assert_eq!(config.database_path(), PathBuf::from("data/app.db"));
        assert_eq!(config.policy.execution_time_threshold_ms, 250.0);
        assert_eq!(config.policy.row_count_threshold, 1000);
        assert_eq!(config.migration.default_batch_size, DEFAULT_BATCH_SIZE);
        assert!(config.sqlite.foreign_keys);
    }

    #[test]
    fn test_write_refuses_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hybridb.toml");
        let config = HybridbConfig::default();

        write_config(&path, &config, false).unwrap();
        assert!(write_config(&path, &config, false).is_err());
        write_config(&path, &config, true).unwrap();

        let loaded = load_config(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_ensure_db_dir_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("nested").join("hybridb.db");
        ensure_db_dir(&db).unwrap();
        assert!(db.parent().unwrap().exists());
    }
}
