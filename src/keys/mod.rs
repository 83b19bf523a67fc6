//! Key providers: suppliers of wrap/unwrap operations for the symmetric
//! data key, possibly delegating to a remote service.

pub mod cloud;
pub mod local_vault;

use crate::config::{ProviderKind, SecurityKind, SecuritySettings, DEFAULT_KEY_SIZE};
use crate::error::Error;
use crate::{Result, Secrets};
use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the symmetric data key in bytes.
pub const DATA_KEY_SIZE: usize = 32;

/// A symmetric data key. Zeroized on drop, redacted in `Debug`, never
/// serialized.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    bytes: [u8; DATA_KEY_SIZE],
}

impl DataKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; DATA_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != DATA_KEY_SIZE {
            return Err(Error::KeyAlgorithmUnsupported(format!(
                "data key must be {} bytes, got {}",
                DATA_KEY_SIZE,
                bytes.len()
            )));
        }
        let mut key = [0u8; DATA_KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    pub fn as_bytes(&self) -> &[u8; DATA_KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey").field("bytes", &"[REDACTED]").finish()
    }
}

/// Asymmetric parameters advertised by a provider.
#[derive(Debug, Clone)]
pub struct KeyParams {
    pub algorithm: String,
    pub key_size: u32,
}

/// Capability interface over the asymmetric half of the hybrid scheme.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Stable name recorded in the manifest transform chain.
    fn name(&self) -> &str;

    fn public_params(&self) -> KeyParams;

    /// Encrypt a data key under the provider's public or service key.
    async fn wrap(&self, data_key: &DataKey) -> Result<Vec<u8>>;

    /// Recover a data key from its wrapped form.
    async fn unwrap_key(&self, wrapped: &[u8]) -> Result<DataKey>;

    /// Mint a fresh data key together with its wrapped form. KMS providers
    /// override this so the plaintext key is produced by the service.
    async fn generate_data_key(&self) -> Result<(DataKey, Vec<u8>)> {
        let key = DataKey::generate();
        let wrapped = self.wrap(&key).await?;
        Ok((key, wrapped))
    }
}

/// Provider calls are retried on `ProviderUnavailable` up to 3 times with
/// exponential backoff capped at 8 seconds.
pub const PROVIDER_RETRIES: u32 = 3;
pub const PROVIDER_BACKOFF_CAP: Duration = Duration::from_secs(8);

/// Build the provider selected by the security settings.
pub fn build_provider(
    security: &SecuritySettings,
    secrets: &Secrets,
    timeout: Duration,
) -> Result<Arc<dyn KeyProvider>> {
    let provider = security.provider.ok_or_else(|| {
        Error::ConfigInvalid("security.provider is required when encryption is enabled".into())
    })?;
    match provider {
        ProviderKind::Local => {
            let dir = secrets.local_key_store_path.clone().ok_or_else(|| {
                Error::ConfigInvalid("LOCAL_KEY_STORE_PATH is not set".into())
            })?;
            let password = secrets.private_key_password.clone().ok_or_else(|| {
                Error::ConfigInvalid("PRIVATE_KEY_PASSWORD is not set".into())
            })?;
            let key_size = security.key_size.unwrap_or(DEFAULT_KEY_SIZE);
            Ok(Arc::new(local_vault::LocalVault::new(dir, password, key_size)))
        }
        ProviderKind::Gcp | ProviderKind::Aws => {
            let url = secrets
                .keystore_url
                .clone()
                .ok_or_else(|| Error::ConfigInvalid("KEYSTORE_URL is not set".into()))?;
            let token = secrets.keystore_token.clone();
            let remote = cloud::RemoteKeys::new(provider, url, token, timeout)?;
            match security.kind.unwrap_or(SecurityKind::Keystore) {
                SecurityKind::Keystore => Ok(Arc::new(cloud::CloudKeystore::new(remote))),
                SecurityKind::Kms => Ok(Arc::new(cloud::CloudKms::new(remote))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_key_rejects_wrong_length() {
        assert!(DataKey::from_bytes(&[0u8; 16]).is_err());
        assert!(DataKey::from_bytes(&[0u8; 32]).is_ok());
    }

    #[test]
    fn data_key_debug_is_redacted() {
        let key = DataKey::generate();
        assert!(!format!("{:?}", key).contains(&hex::encode(key.as_bytes())));
    }
}
