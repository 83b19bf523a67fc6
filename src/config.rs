//! Job configuration: TOML settings plus environment secrets.
//!
//! The settings file selects what to back up and which transforms to apply;
//! secrets (passwords, paths, endpoints) come from the environment and are
//! captured exactly once into an immutable `Secrets` value. The core never
//! reads the environment after job construction.

use crate::error::Error;
use crate::schema::FeatureSet;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    #[serde(default)]
    pub compression: CompressionSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub integrity: IntegritySettings,
    pub storage: StorageSettings,
    #[serde(default)]
    pub restore: RestoreSettings,
    #[serde(default)]
    pub limits: LimitSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    pub db_name: String,

    /// One artifact per object category instead of a single concatenated dump.
    #[serde(default)]
    pub multiple_files: bool,

    #[serde(default)]
    pub features: FeatureSet,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompressionSettings {
    #[serde(default)]
    pub compression: bool,

    #[serde(default)]
    pub compression_type: Option<CompressionType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    Zip,
    Tar,
}

impl CompressionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionType::Zip => "zip",
            CompressionType::Tar => "tar",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecuritySettings {
    #[serde(default)]
    pub encryption: bool,

    /// `keystore` or `kms`.
    #[serde(rename = "type", default)]
    pub kind: Option<SecurityKind>,

    #[serde(default)]
    pub provider: Option<ProviderKind>,

    /// RSA modulus size for the local vault.
    #[serde(default)]
    pub key_size: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityKind {
    Keystore,
    Kms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Local,
    Gcp,
    Aws,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IntegritySettings {
    #[serde(default)]
    pub integrity_check: bool,

    #[serde(default)]
    pub integrity_type: Option<IntegrityType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityType {
    Hmac,
    Checksum,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    pub storage_type: StorageKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Aws,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RestoreSettings {
    /// Storage prefix of the backup to restore (the directory holding
    /// `manifest.json`).
    #[serde(default)]
    pub backup_path: Option<String>,

    /// Record and skip failing statements instead of aborting on the first
    /// fatal one.
    #[serde(default)]
    pub best_effort: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitSettings {
    #[serde(default = "default_kms_timeout")]
    pub kms_timeout_secs: u64,

    #[serde(default = "default_storage_timeout")]
    pub storage_timeout_secs: u64,

    /// Parallel per-artifact pipelines in multiple-files mode.
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,

    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            kms_timeout_secs: default_kms_timeout(),
            storage_timeout_secs: default_storage_timeout(),
            fan_out: default_fan_out(),
            heartbeat_secs: default_heartbeat(),
        }
    }
}

fn default_port() -> u16 {
    3306
}

fn default_kms_timeout() -> u64 {
    30
}

fn default_storage_timeout() -> u64 {
    300
}

fn default_fan_out() -> usize {
    4
}

fn default_heartbeat() -> u64 {
    10
}

const VALID_KEY_SIZES: [u32; 3] = [2048, 3072, 4096];
pub const DEFAULT_KEY_SIZE: u32 = 4096;

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigInvalid(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut settings: Settings = toml::from_str(&content)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {}", path.display(), e)))?;
        settings.apply_defaults();
        Ok(settings)
    }

    fn apply_defaults(&mut self) {
        if self.compression.compression && self.compression.compression_type.is_none() {
            tracing::warn!("compression type not set, defaulting to zip");
            self.compression.compression_type = Some(CompressionType::Zip);
        }
        if self.integrity.integrity_check && self.integrity.integrity_type.is_none() {
            self.integrity.integrity_type = Some(IntegrityType::Checksum);
        }
        if self.security.encryption {
            if self.security.kind.is_none() {
                self.security.kind = Some(SecurityKind::Keystore);
            }
            if self.security.provider.is_none() {
                self.security.provider = Some(ProviderKind::Local);
            }
            if self.security.key_size.is_none() {
                self.security.key_size = Some(DEFAULT_KEY_SIZE);
            }
        }
    }

    /// Checks shared by backup and restore.
    fn validate_common(&self, secrets: &Secrets) -> Result<()> {
        if self.database.host.is_empty() || self.database.user.is_empty() {
            return Err(Error::ConfigInvalid(
                "database host and user are required".into(),
            ));
        }
        if self.database.db_name.is_empty() {
            return Err(Error::ConfigInvalid("database db_name is required".into()));
        }
        if secrets.db_password.is_empty() {
            return Err(Error::ConfigInvalid("DB_PASSWORD is not set".into()));
        }

        if self.security.encryption {
            if let Some(size) = self.security.key_size {
                if !VALID_KEY_SIZES.contains(&size) {
                    return Err(Error::ConfigInvalid(format!(
                        "key_size {} is not one of 2048, 3072, 4096",
                        size
                    )));
                }
            }
            match self.security.provider {
                Some(ProviderKind::Local) => {
                    if secrets.private_key_password.is_none() {
                        return Err(Error::ConfigInvalid(
                            "PRIVATE_KEY_PASSWORD is required for the local key provider".into(),
                        ));
                    }
                    if secrets.local_key_store_path.is_none() {
                        return Err(Error::ConfigInvalid(
                            "LOCAL_KEY_STORE_PATH is required for the local key provider".into(),
                        ));
                    }
                }
                Some(ProviderKind::Gcp) | Some(ProviderKind::Aws) => {
                    if secrets.keystore_url.is_none() {
                        return Err(Error::ConfigInvalid(
                            "KEYSTORE_URL is required for cloud key providers".into(),
                        ));
                    }
                }
                None => {
                    return Err(Error::ConfigInvalid(
                        "security.provider is required when encryption is enabled".into(),
                    ));
                }
            }
        }

        if self.integrity.integrity_check
            && self.integrity.integrity_type == Some(IntegrityType::Hmac)
            && secrets.integrity_password.is_none()
        {
            return Err(Error::ConfigInvalid(
                "INTEGRITY_PASSWORD is required for hmac integrity".into(),
            ));
        }

        match self.storage.storage_type {
            StorageKind::Local => {
                if secrets.local_path.is_none() {
                    return Err(Error::ConfigInvalid(
                        "LOCAL_PATH is required for local storage".into(),
                    ));
                }
            }
            StorageKind::Aws => {
                if secrets.s3_bucket.is_none() {
                    return Err(Error::ConfigInvalid(
                        "AWS_S3_BUCKET is required for S3 storage".into(),
                    ));
                }
            }
        }

        Ok(())
    }

    pub fn validate_backup(&self, secrets: &Secrets) -> Result<()> {
        self.validate_common(secrets)?;
        if self.database.features.none_enabled() {
            return Err(Error::ConfigInvalid(
                "at least one object category must be enabled".into(),
            ));
        }
        Ok(())
    }

    pub fn validate_restore(&self, secrets: &Secrets) -> Result<()> {
        self.validate_common(secrets)?;
        if self.restore.backup_path.as_deref().unwrap_or("").is_empty() {
            return Err(Error::ConfigInvalid(
                "restore.backup_path is required".into(),
            ));
        }
        Ok(())
    }

    pub fn kms_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.kms_timeout_secs)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.storage_timeout_secs)
    }
}

/// Environment contract with the caller, captured once.
#[derive(Clone)]
pub struct Secrets {
    pub db_password: String,
    pub logging_path: Option<PathBuf>,
    pub private_key_password: Option<String>,
    pub local_key_store_path: Option<PathBuf>,
    pub integrity_password: Option<String>,
    pub local_path: Option<PathBuf>,
    pub s3_bucket: Option<String>,
    pub s3_prefix: Option<String>,
    pub keystore_url: Option<String>,
    pub keystore_token: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self {
            db_password: std::env::var("DB_PASSWORD").unwrap_or_default(),
            logging_path: std::env::var("LOGGING_PATH").ok().map(PathBuf::from),
            private_key_password: std::env::var("PRIVATE_KEY_PASSWORD").ok(),
            local_key_store_path: std::env::var("LOCAL_KEY_STORE_PATH").ok().map(PathBuf::from),
            integrity_password: std::env::var("INTEGRITY_PASSWORD").ok(),
            local_path: std::env::var("LOCAL_PATH").ok().map(PathBuf::from),
            s3_bucket: std::env::var("AWS_S3_BUCKET").ok(),
            s3_prefix: std::env::var("AWS_S3_PREFIX").ok(),
            keystore_url: std::env::var("KEYSTORE_URL").ok(),
            keystore_token: std::env::var("KEYSTORE_TOKEN").ok(),
        }
    }
}

// Secrets must never leak through logs.
impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("db_password", &"[REDACTED]")
            .field("logging_path", &self.logging_path)
            .field("local_key_store_path", &self.local_key_store_path)
            .field("local_path", &self.local_path)
            .field("s3_bucket", &self.s3_bucket)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets() -> Secrets {
        Secrets {
            db_password: "pw".into(),
            logging_path: None,
            private_key_password: Some("kp".into()),
            local_key_store_path: Some(PathBuf::from("/tmp/vault")),
            integrity_password: Some("ip".into()),
            local_path: Some(PathBuf::from("/tmp/store")),
            s3_bucket: None,
            s3_prefix: None,
            keystore_url: None,
            keystore_token: None,
        }
    }

    fn parse(toml_str: &str) -> Settings {
        let mut s: Settings = toml::from_str(toml_str).unwrap();
        s.apply_defaults();
        s
    }

    const MINIMAL: &str = r#"
        [database]
        host = "localhost"
        user = "root"
        db_name = "shop"

        [storage]
        storage_type = "local"
    "#;

    #[test]
    fn minimal_config_defaults() {
        let s = parse(MINIMAL);
        assert_eq!(s.database.port, 3306);
        assert!(!s.database.multiple_files);
        assert!(s.database.features.tables);
        assert!(s.database.features.data);
        assert!(!s.database.features.views);
        assert!(!s.compression.compression);
        assert!(!s.security.encryption);
        assert_eq!(s.limits.fan_out, 4);
        s.validate_backup(&secrets()).unwrap();
    }

    #[test]
    fn compression_without_type_defaults_to_zip() {
        let s = parse(
            r#"
            [database]
            host = "localhost"
            user = "root"
            db_name = "shop"

            [compression]
            compression = true

            [storage]
            storage_type = "local"
        "#,
        );
        assert_eq!(s.compression.compression_type, Some(CompressionType::Zip));
    }

    #[test]
    fn encryption_without_compression_is_legal() {
        let s = parse(
            r#"
            [database]
            host = "localhost"
            user = "root"
            db_name = "shop"

            [security]
            encryption = true
            type = "keystore"
            provider = "local"
            key_size = 4096

            [storage]
            storage_type = "local"
        "#,
        );
        assert!(s.security.encryption);
        assert!(!s.compression.compression);
        s.validate_backup(&secrets()).unwrap();
    }

    #[test]
    fn bad_key_size_is_rejected() {
        let s = parse(
            r#"
            [database]
            host = "localhost"
            user = "root"
            db_name = "shop"

            [security]
            encryption = true
            provider = "local"
            key_size = 1024

            [storage]
            storage_type = "local"
        "#,
        );
        let err = s.validate_backup(&secrets()).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn missing_db_password_is_rejected() {
        let s = parse(MINIMAL);
        let mut sec = secrets();
        sec.db_password = String::new();
        assert!(matches!(
            s.validate_backup(&sec),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn restore_requires_backup_path() {
        let s = parse(MINIMAL);
        assert!(matches!(
            s.validate_restore(&secrets()),
            Err(Error::ConfigInvalid(_))
        ));

        let s = parse(
            r#"
            [database]
            host = "localhost"
            user = "root"
            db_name = "shop"

            [storage]
            storage_type = "local"

            [restore]
            backup_path = "shop_20250101_120000"
        "#,
        );
        s.validate_restore(&secrets()).unwrap();
    }

    #[test]
    fn hmac_integrity_requires_password() {
        let s = parse(
            r#"
            [database]
            host = "localhost"
            user = "root"
            db_name = "shop"

            [integrity]
            integrity_check = true
            integrity_type = "hmac"

            [storage]
            storage_type = "local"
        "#,
        );
        let mut sec = secrets();
        sec.integrity_password = None;
        assert!(matches!(
            s.validate_backup(&sec),
            Err(Error::ConfigInvalid(_))
        ));
    }
}
