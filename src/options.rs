use serde::{Deserialize, Serialize};

use crate::durable::error::{invalid_argument, StorageResult};
use crate::util::BackoffConfig;

pub const DEFAULT_PREFIX: &str = "storefront";
pub const DEFAULT_SCHEMA_VERSION: &str = "1.0";
pub const DEFAULT_BACKUP_CAPACITY: usize = 10;

/// Settings shared by every persisted store of a tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncOptions {
    /// Namespace for live envelopes, stored under `"<prefix>-<store id>"`.
    pub prefix: String,
    /// Version tag stamped on written envelopes and targeted by migrations.
    pub schema_version: String,
    /// Bare key mirroring the auth token.
    pub token_key: String,
    /// Bare key holding the backup ring.
    pub backup_key: String,
    pub backup_capacity: usize,
    /// Envelopes older than this are restored as absent.
    pub max_state_age_millis: Option<i64>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }
}

impl SyncOptions {
    /// Defaults with every key derived from `prefix`.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            token_key: format!("{prefix}_auth_token"),
            backup_key: format!("{prefix}_backups"),
            prefix,
            schema_version: DEFAULT_SCHEMA_VERSION.to_string(),
            backup_capacity: DEFAULT_BACKUP_CAPACITY,
            max_state_age_millis: None,
        }
    }

    pub fn envelope_key(&self, store_id: &str) -> String {
        format!("{}-{}", self.prefix, store_id)
    }

    /// Checks that the bare keys stay outside the envelope namespace and that the ring can hold at
    /// least one backup.
    pub fn validate(&self) -> StorageResult<()> {
        if self.prefix.is_empty() {
            return Err(invalid_argument("prefix must not be empty"));
        }
        let namespace = format!("{}-", self.prefix);
        for (name, key) in [("tokenKey", &self.token_key), ("backupKey", &self.backup_key)] {
            if key.is_empty() {
                return Err(invalid_argument(format!("{name} must not be empty")));
            }
            if key.starts_with(&namespace) {
                return Err(invalid_argument(format!(
                    "{name} '{key}' collides with the '{namespace}' envelope namespace"
                )));
            }
        }
        if self.token_key == self.backup_key {
            return Err(invalid_argument("tokenKey and backupKey must differ"));
        }
        if self.backup_capacity == 0 {
            return Err(invalid_argument("backupCapacity must be at least 1"));
        }
        Ok(())
    }
}

pub type ReconnectOptions = BackoffConfig;

/// Realtime endpoint plus its reconnection policy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealtimeOptions {
    pub url: String,
    pub reconnect: ReconnectOptions,
}

impl RealtimeOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectOptions::default(),
        }
    }
}
