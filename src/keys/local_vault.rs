//! Local file vault: a versioned RSA key pair on disk.
//!
//! Layout inside the vault directory:
//!   public_key_v<N>.pem   SPKI PEM public key
//!   private_key_v<N>.key  PKCS#8 DER, AES-256-GCM encrypted under a key
//!                         derived from the caller-supplied password
//!                         (salt, then nonce, then ciphertext)
//!
//! The newest version is always used. On first use with no existing pair a
//! fresh RSA key is generated and stored.

use super::{DataKey, KeyParams, KeyProvider};
use crate::error::Error;
use crate::Result;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::path::{Path, PathBuf};

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const HKDF_INFO: &[u8] = b"backydb-vault-key-v1";

pub struct LocalVault {
    dir: PathBuf,
    password: String,
    key_size: u32,
}

impl LocalVault {
    pub fn new(dir: PathBuf, password: String, key_size: u32) -> Self {
        Self {
            dir,
            password,
            key_size,
        }
    }

    /// Newest key version present in the vault, by the `vN` suffix.
    fn latest_version(&self) -> Result<Option<u32>> {
        if !self.dir.exists() {
            return Ok(None);
        }
        let mut latest = None;
        for entry in std::fs::read_dir(&self.dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if let Some(v) = name
                .strip_prefix("public_key_v")
                .and_then(|rest| rest.strip_suffix(".pem"))
                .and_then(|v| v.parse::<u32>().ok())
            {
                latest = Some(latest.map_or(v, |cur: u32| cur.max(v)));
            }
        }
        Ok(latest)
    }

    fn public_key_path(&self, version: u32) -> PathBuf {
        self.dir.join(format!("public_key_v{}.pem", version))
    }

    fn private_key_path(&self, version: u32) -> PathBuf {
        self.dir.join(format!("private_key_v{}.key", version))
    }

    /// Generate and store a fresh pair, returning its version.
    async fn generate_pair(&self, version: u32) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let bits = self.key_size as usize;
        let password = self.password.clone();
        // RSA keygen is CPU-bound; keep it off the runtime workers.
        let (private_pem_blob, public_pem) = tokio::task::spawn_blocking(move || {
            let private_key = RsaPrivateKey::new(&mut OsRng, bits)
                .map_err(|e| Error::Internal(anyhow::anyhow!("RSA key generation: {}", e)))?;
            let public_key = RsaPublicKey::from(&private_key);

            let der = private_key
                .to_pkcs8_der()
                .map_err(|e| Error::Internal(anyhow::anyhow!("private key encoding: {}", e)))?;
            let sealed = seal_private_key(der.as_bytes(), password.as_bytes())?;

            let public_pem = public_key
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| Error::Internal(anyhow::anyhow!("public key encoding: {}", e)))?;
            Ok::<_, Error>((sealed, public_pem))
        })
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!("keygen task: {}", e)))??;

        write_atomic(&self.private_key_path(version), &private_pem_blob)?;
        write_atomic(&self.public_key_path(version), public_pem.as_bytes())?;
        tracing::info!(version, dir = %self.dir.display(), "generated RSA key pair");
        Ok(())
    }

    /// Version to use, generating a pair on first use.
    async fn ensure_pair(&self) -> Result<u32> {
        if let Some(version) = self.latest_version()? {
            return Ok(version);
        }
        self.generate_pair(1).await?;
        Ok(1)
    }

    fn load_public_key(&self, version: u32) -> Result<RsaPublicKey> {
        let path = self.public_key_path(version);
        let pem = std::fs::read_to_string(&path)
            .map_err(|_| Error::KeyNotFound(format!("no public key at {}", path.display())))?;
        RsaPublicKey::from_public_key_pem(&pem)
            .map_err(|e| Error::KeyAlgorithmUnsupported(format!("public key parse: {}", e)))
    }

    fn load_private_key(&self, version: u32) -> Result<RsaPrivateKey> {
        let path = self.private_key_path(version);
        let blob = std::fs::read(&path)
            .map_err(|_| Error::KeyNotFound(format!("no private key at {}", path.display())))?;
        let der = open_private_key(&blob, self.password.as_bytes())?;
        RsaPrivateKey::from_pkcs8_der(&der)
            .map_err(|e| Error::KeyAlgorithmUnsupported(format!("private key parse: {}", e)))
    }
}

#[async_trait]
impl KeyProvider for LocalVault {
    fn name(&self) -> &str {
        "local"
    }

    fn public_params(&self) -> KeyParams {
        KeyParams {
            algorithm: "RSA-OAEP-SHA256".to_string(),
            key_size: self.key_size,
        }
    }

    async fn wrap(&self, data_key: &DataKey) -> Result<Vec<u8>> {
        let version = self.ensure_pair().await?;
        let public_key = self.load_public_key(version)?;
        public_key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), data_key.as_bytes())
            .map_err(|e| Error::Internal(anyhow::anyhow!("RSA-OAEP wrap: {}", e)))
    }

    async fn unwrap_key(&self, wrapped: &[u8]) -> Result<DataKey> {
        let version = self
            .latest_version()?
            .ok_or_else(|| Error::KeyNotFound(format!("empty vault at {}", self.dir.display())))?;
        let private_key = self.load_private_key(version)?;
        let plain = private_key
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|_| {
                Error::KeyNotFound(format!(
                    "vault key v{} cannot unwrap this data key",
                    version
                ))
            })?;
        DataKey::from_bytes(&plain)
    }
}

/// Encrypt PKCS#8 DER bytes under a password: salt, then nonce, then
/// ciphertext.
fn seal_private_key(der: &[u8], password: &[u8]) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&derive_key(password, &salt)?));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), der)
        .map_err(|e| Error::Internal(anyhow::anyhow!("private key encryption: {}", e)))?;

    let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

fn open_private_key(blob: &[u8], password: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < SALT_LEN + NONCE_LEN {
        return Err(Error::KeyAccessDenied("private key file is truncated".into()));
    }
    let (salt, rest) = blob.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&derive_key(password, salt)?));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::KeyAccessDenied("wrong private key password".into()))
}

/// HKDF-SHA256 over the password. The password is expected to carry real
/// entropy; it never leaves the process.
fn derive_key(password: &[u8], salt: &[u8]) -> Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(salt), password);
    let mut key = [0u8; 32];
    hk.expand(HKDF_INFO, &mut key)
        .map_err(|_| Error::Internal(anyhow::anyhow!("HKDF expand failed")))?;
    Ok(key)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("partial");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // 2048-bit keys keep test keygen fast; production defaults to 4096.
    fn vault(dir: &TempDir, password: &str) -> LocalVault {
        LocalVault::new(dir.path().to_path_buf(), password.to_string(), 2048)
    }

    #[tokio::test]
    async fn wrap_then_unwrap_round_trips() {
        let dir = TempDir::new().unwrap();
        let vault = vault(&dir, "hunter2");
        let key = DataKey::generate();
        let wrapped = vault.wrap(&key).await.unwrap();
        assert_ne!(wrapped.as_slice(), key.as_bytes().as_slice());
        let recovered = vault.unwrap_key(&wrapped).await.unwrap();
        assert_eq!(recovered.as_bytes(), key.as_bytes());
    }

    #[tokio::test]
    async fn first_wrap_creates_a_versioned_pair() {
        let dir = TempDir::new().unwrap();
        let vault = vault(&dir, "hunter2");
        vault.wrap(&DataKey::generate()).await.unwrap();
        assert!(dir.path().join("public_key_v1.pem").exists());
        assert!(dir.path().join("private_key_v1.key").exists());
    }

    #[tokio::test]
    async fn wrong_password_is_access_denied() {
        let dir = TempDir::new().unwrap();
        let good = vault(&dir, "hunter2");
        let key = DataKey::generate();
        let wrapped = good.wrap(&key).await.unwrap();

        let bad = vault(&dir, "letmein");
        let err = bad.unwrap_key(&wrapped).await.unwrap_err();
        assert!(matches!(err, Error::KeyAccessDenied(_)));
    }

    #[tokio::test]
    async fn unwrap_on_empty_vault_is_key_not_found() {
        let dir = TempDir::new().unwrap();
        let vault = vault(&dir, "hunter2");
        let err = vault.unwrap_key(&[0u8; 256]).await.unwrap_err();
        assert!(matches!(err, Error::KeyNotFound(_)));
    }

    #[tokio::test]
    async fn foreign_wrapped_key_is_key_not_found() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let vault_a = vault(&dir_a, "hunter2");
        let vault_b = vault(&dir_b, "hunter2");

        let wrapped = vault_a.wrap(&DataKey::generate()).await.unwrap();
        // Force vault B to have its own pair.
        vault_b.wrap(&DataKey::generate()).await.unwrap();

        let err = vault_b.unwrap_key(&wrapped).await.unwrap_err();
        assert!(matches!(err, Error::KeyNotFound(_)));
    }

    #[tokio::test]
    async fn newest_version_wins() {
        let dir = TempDir::new().unwrap();
        let vault = vault(&dir, "hunter2");
        vault.generate_pair(1).await.unwrap();
        vault.generate_pair(3).await.unwrap();
        assert_eq!(vault.latest_version().unwrap(), Some(3));
    }
}
