//! Queue configuration.
//!
//! Values are layered: built-in defaults, then `OUTBOX_*` environment
//! variables, then the `outbox_preferences` row persisted in the database.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::PathBuf;
use thiserror::Error;

use crate::sync::RetryPolicy;

pub const DEFAULT_DB_NAME: &str = "sync-queue-db";
pub const DEFAULT_STORE_NAME: &str = "operations";
pub const PREFERENCES_KEY: &str = "outbox_preferences";
pub const APP_DIR_NAME: &str = "offline-outbox";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid preferences: {0}")]
    Preferences(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Where and how the persistent queue store is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// Database name; the file is `{data_dir}/{name}.db`.
    pub name: String,
    /// Primary collection holding queued operations.
    pub store_name: String,
    pub version: u32,
    /// Additional collections created alongside the primary one.
    pub extra_stores: Vec<String>,
    /// `None` keeps the database in memory (nothing survives a restart).
    pub data_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_DB_NAME.to_string(),
            store_name: DEFAULT_STORE_NAME.to_string(),
            version: 1,
            extra_stores: Vec::new(),
            data_dir: None,
        }
    }
}

impl StoreConfig {
    pub fn in_memory(store_name: impl Into<String>) -> Self {
        Self {
            store_name: store_name.into(),
            ..Self::default()
        }
    }

    /// Fall back to the per-user data directory when no directory is set.
    pub fn or_user_data_dir(mut self) -> Self {
        if self.data_dir.is_none() {
            self.data_dir = dirs::data_local_dir().map(|dir| dir.join(APP_DIR_NAME));
        }
        self
    }

    pub fn db_path(&self) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.db", self.name)))
    }

    /// Primary store first, then extras, without duplicates.
    pub fn all_stores(&self) -> Vec<String> {
        let mut stores = vec![self.store_name.clone()];
        for extra in &self.extra_stores {
            if !stores.contains(extra) {
                stores.push(extra.clone());
            }
        }
        stores
    }
}

/// Fixed identifiers stamped into outgoing sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientIdentity {
    pub origin: String,
    pub updated_by: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            origin: "pwa".to_string(),
            updated_by: "pwa-client".to_string(),
        }
    }
}

/// What a flush pass does after a record fails and is rescheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Leave the remaining due records for the next flush.
    #[default]
    StopPass,
    /// Keep attempting later due records in the same pass.
    Continue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    pub store: StoreConfig,
    pub retry: RetryPolicy,
    pub identity: ClientIdentity,
    /// Arm flush timers automatically after enqueue and after each pass.
    pub auto_flush: bool,
    pub failure_mode: FailureMode,
    /// Seal persisted headers with the keychain master key.
    pub encrypt_headers: bool,
    /// Base URL relative endpoints are resolved against.
    pub api_base: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            retry: RetryPolicy::default(),
            identity: ClientIdentity::default(),
            auto_flush: true,
            failure_mode: FailureMode::default(),
            encrypt_headers: false,
            api_base: None,
        }
    }
}

/// Overrides persisted under [`PREFERENCES_KEY`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuePreferences {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub failure_mode: Option<FailureMode>,
}

impl QueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("OUTBOX_DB_PATH") {
            self.store.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(store) = lookup("OUTBOX_STORE") {
            self.store.store_name = store;
        }
        if let Some(base) = lookup("OUTBOX_API_BASE") {
            self.api_base = Some(base);
        }
        if let Some(value) = lookup("OUTBOX_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_env("OUTBOX_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = lookup("OUTBOX_BASE_DELAY_MS") {
            self.retry.base_delay_ms = parse_env("OUTBOX_BASE_DELAY_MS", &value)?;
        }
        if let Some(value) = lookup("OUTBOX_ENCRYPT_HEADERS") {
            self.encrypt_headers = matches!(value.as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    pub fn apply_preferences(&mut self, prefs: &QueuePreferences) {
        if let Some(max_attempts) = prefs.max_attempts {
            self.retry.max_attempts = max_attempts.max(1);
        }
        if let Some(base) = prefs.base_delay_ms {
            self.retry.base_delay_ms = base;
        }
        if let Some(max) = prefs.max_delay_ms {
            self.retry.max_delay_ms = max;
        }
        if let Some(mode) = prefs.failure_mode {
            self.failure_mode = mode;
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

pub async fn load_preferences(pool: &SqlitePool) -> Result<Option<QueuePreferences>, ConfigError> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM preferences WHERE key = ?")
        .bind(PREFERENCES_KEY)
        .fetch_optional(pool)
        .await?;

    match row {
        Some((json,)) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

pub async fn save_preferences(
    pool: &SqlitePool,
    prefs: &QueuePreferences,
) -> Result<(), ConfigError> {
    let json = serde_json::to_string(prefs)?;
    sqlx::query("INSERT OR REPLACE INTO preferences (key, value) VALUES (?, ?)")
        .bind(PREFERENCES_KEY)
        .bind(json)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_retry_contract() {
        let config = QueueConfig::default();
        assert_eq!(config.retry.base_delay_ms, 2000);
        assert_eq!(config.retry.max_delay_ms, 300_000);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.store.name, "sync-queue-db");
        assert_eq!(config.identity.origin, "pwa");
        assert_eq!(config.failure_mode, FailureMode::StopPass);
        assert!(config.auto_flush);
    }

    #[test]
    fn test_apply_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("OUTBOX_DB_PATH", "/tmp/outbox"),
            ("OUTBOX_STORE", "mutations"),
            ("OUTBOX_MAX_ATTEMPTS", "8"),
            ("OUTBOX_ENCRYPT_HEADERS", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = QueueConfig::default();
        config
            .apply_env(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.store.store_name, "mutations");
        assert_eq!(config.retry.max_attempts, 8);
        assert!(config.encrypt_headers);
        assert_eq!(
            config.store.db_path(),
            Some(PathBuf::from("/tmp/outbox/sync-queue-db.db"))
        );
    }

    #[test]
    fn test_apply_env_rejects_garbage() {
        let mut config = QueueConfig::default();
        let err = config
            .apply_env(|k| (k == "OUTBOX_BASE_DELAY_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid value for OUTBOX_BASE_DELAY_MS: soon");
    }

    #[test]
    fn test_user_data_dir_does_not_override_explicit_dir() {
        let explicit = StoreConfig {
            data_dir: Some(PathBuf::from("/tmp/outbox")),
            ..StoreConfig::default()
        }
        .or_user_data_dir();
        assert_eq!(explicit.data_dir, Some(PathBuf::from("/tmp/outbox")));

        let resolved = StoreConfig::default().or_user_data_dir();
        if let Some(dir) = resolved.data_dir {
            assert!(dir.ends_with(APP_DIR_NAME));
        }
    }

    #[test]
    fn test_all_stores_dedupes() {
        let config = StoreConfig {
            extra_stores: vec!["drafts".into(), "operations".into(), "drafts".into()],
            ..StoreConfig::default()
        };
        assert_eq!(config.all_stores(), vec!["operations", "drafts"]);
    }

    #[test]
    fn test_preferences_deserialize_camel_case() {
        let json = r#"{"maxAttempts":3,"failureMode":"continue"}"#;
        let prefs: QueuePreferences = serde_json::from_str(json).unwrap();
        let mut config = QueueConfig::default();
        config.apply_preferences(&prefs);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.failure_mode, FailureMode::Continue);
        assert_eq!(config.retry.base_delay_ms, 2000);
    }

    #[tokio::test]
    async fn test_preferences_roundtrip_through_database() {
        let db = Database::in_memory().await.unwrap();
        assert!(load_preferences(db.pool()).await.unwrap().is_none());

        let prefs = QueuePreferences {
            max_attempts: Some(7),
            ..QueuePreferences::default()
        };
        save_preferences(db.pool(), &prefs).await.unwrap();

        let loaded = load_preferences(db.pool()).await.unwrap();
        assert_eq!(loaded, Some(prefs));
    }
}
