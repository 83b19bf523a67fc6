//! Hybrid encryption envelope.
//!
//! Layout (bit-exact):
//! ```text
//! offset 0   : 4 bytes  magic "BKY1"
//! offset 4   : 1 byte   version (currently 1)
//! offset 5   : 1 byte   alg_id (1 = AES-256-GCM + RSA-OAEP-SHA256)
//! offset 6   : 12 bytes nonce
//! offset 18  : 4 bytes  wrapped_len (big-endian u32)
//! offset 22  : wrapped_len bytes wrapped data key
//! offset ... : ciphertext || 16-byte GCM tag
//! ```
//!
//! One fresh data key and nonce per artifact. A single GCM tag covers the
//! whole stream; the 64 KiB chunking used while moving bytes through the
//! pipeline is an encoding detail and is not authenticated separately.

use crate::error::Error;
use crate::keys::{DataKey, KeyProvider};
use crate::Result;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

pub const MAGIC: [u8; 4] = *b"BKY1";
pub const FORMAT_VERSION: u8 = 1;
pub const ALG_AES256_GCM_RSA_OAEP: u8 = 1;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const HEADER_LEN: usize = 4 + 1 + 1 + NONCE_LEN + 4;

/// Parsed view over an envelope blob.
pub struct EnvelopeParts<'a> {
    pub nonce: &'a [u8],
    pub wrapped: &'a [u8],
    pub ciphertext: &'a [u8],
}

/// Encrypt an artifact under a fresh data key wrapped by the provider.
pub async fn seal(plaintext: &[u8], provider: &dyn KeyProvider) -> Result<Vec<u8>> {
    let (data_key, wrapped) = provider.generate_data_key().await?;
    seal_with(&data_key, &wrapped, plaintext)
}

/// Encrypt with an already-wrapped data key.
pub fn seal_with(data_key: &DataKey, wrapped: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    if wrapped.len() > u32::MAX as usize {
        return Err(Error::KeyAlgorithmUnsupported(
            "wrapped key does not fit the envelope header".into(),
        ));
    }

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(data_key.as_bytes()));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| Error::Internal(anyhow::anyhow!("AEAD encrypt: {}", e)))?;

    let mut blob = Vec::with_capacity(HEADER_LEN + wrapped.len() + ciphertext.len());
    blob.extend_from_slice(&MAGIC);
    blob.push(FORMAT_VERSION);
    blob.push(ALG_AES256_GCM_RSA_OAEP);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&(wrapped.len() as u32).to_be_bytes());
    blob.extend_from_slice(&wrapped);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Validate the header and slice an envelope into its parts. Any header
/// anomaly is an `IntegrityFailure`.
pub fn parse(blob: &[u8]) -> Result<EnvelopeParts<'_>> {
    if blob.len() < HEADER_LEN + TAG_LEN {
        return Err(Error::IntegrityFailure("envelope is truncated".into()));
    }
    if blob[..4] != MAGIC {
        return Err(Error::IntegrityFailure("bad envelope magic".into()));
    }
    if blob[4] != FORMAT_VERSION {
        return Err(Error::IntegrityFailure(format!(
            "unsupported envelope version {}",
            blob[4]
        )));
    }
    if blob[5] != ALG_AES256_GCM_RSA_OAEP {
        return Err(Error::IntegrityFailure(format!(
            "unsupported envelope algorithm {}",
            blob[5]
        )));
    }

    let nonce = &blob[6..6 + NONCE_LEN];
    let wrapped_len = u32::from_be_bytes([blob[18], blob[19], blob[20], blob[21]]) as usize;
    let body = &blob[HEADER_LEN..];
    if wrapped_len + TAG_LEN > body.len() {
        return Err(Error::IntegrityFailure(
            "wrapped key length exceeds envelope".into(),
        ));
    }
    let (wrapped, ciphertext) = body.split_at(wrapped_len);
    Ok(EnvelopeParts {
        nonce,
        wrapped,
        ciphertext,
    })
}

/// Decrypt an envelope. Any header anomaly or tag mismatch fails with
/// `IntegrityFailure` and yields no plaintext bytes.
pub async fn open(blob: &[u8], provider: &dyn KeyProvider) -> Result<Vec<u8>> {
    let parts = parse(blob)?;
    let data_key = provider.unwrap_key(parts.wrapped).await?;
    decrypt_with(&data_key, parts.nonce, parts.ciphertext)
}

/// AEAD-decrypt the body of a parsed envelope.
pub fn decrypt_with(data_key: &DataKey, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(data_key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::IntegrityFailure("AEAD tag mismatch".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyParams;
    use async_trait::async_trait;

    /// Deterministic stand-in for an asymmetric provider: wrap XORs the key
    /// with a fixed pad, so any bit flip in the wrapped region silently
    /// yields a different (wrong) data key.
    struct XorProvider;

    const PAD: u8 = 0x5A;

    #[async_trait]
    impl KeyProvider for XorProvider {
        fn name(&self) -> &str {
            "test"
        }

        fn public_params(&self) -> KeyParams {
            KeyParams {
                algorithm: "XOR".into(),
                key_size: 256,
            }
        }

        async fn wrap(&self, data_key: &DataKey) -> crate::Result<Vec<u8>> {
            Ok(data_key.as_bytes().iter().map(|b| b ^ PAD).collect())
        }

        async fn unwrap_key(&self, wrapped: &[u8]) -> crate::Result<DataKey> {
            let bytes: Vec<u8> = wrapped.iter().map(|b| b ^ PAD).collect();
            DataKey::from_bytes(&bytes)
        }
    }

    #[tokio::test]
    async fn round_trip_recovers_plaintext() {
        let plaintext = b"-- Create employees table\nCREATE TABLE employees (id INT);\n";
        let blob = seal(plaintext, &XorProvider).await.unwrap();
        assert_eq!(&blob[..4], b"BKY1");
        assert_eq!(blob[4], 1);
        assert_eq!(blob[5], 1);
        let out = open(&blob, &XorProvider).await.unwrap();
        assert_eq!(out, plaintext);
    }

    #[tokio::test]
    async fn round_trip_of_empty_and_multi_chunk_payloads() {
        for len in [0usize, 1, 64 * 1024, 64 * 1024 * 3 + 17] {
            let plaintext = vec![0xABu8; len];
            let blob = seal(&plaintext, &XorProvider).await.unwrap();
            let out = open(&blob, &XorProvider).await.unwrap();
            assert_eq!(out, plaintext, "payload of {} bytes", len);
        }
    }

    #[tokio::test]
    async fn every_flipped_bit_is_tamper_evident() {
        let plaintext = b"INSERT INTO a VALUES (1);";
        let blob = seal(plaintext, &XorProvider).await.unwrap();

        // Header, nonce, wrapped key, ciphertext and tag: flip one bit in
        // each region and expect an integrity failure with no plaintext.
        let wrapped_len = u32::from_be_bytes(blob[18..22].try_into().unwrap()) as usize;
        let regions = [
            0,                              // magic
            4,                              // version
            5,                              // alg_id
            6,                              // nonce
            HEADER_LEN,                     // wrapped key
            HEADER_LEN + wrapped_len,       // ciphertext
            blob.len() - 1,                 // tag
        ];
        for &offset in &regions {
            let mut tampered = blob.clone();
            tampered[offset] ^= 0x01;
            let err = open(&tampered, &XorProvider).await.unwrap_err();
            assert!(
                matches!(err, Error::IntegrityFailure(_)),
                "offset {} gave {:?}",
                offset,
                err
            );
        }
    }

    #[tokio::test]
    async fn truncated_envelope_is_rejected() {
        let blob = seal(b"x", &XorProvider).await.unwrap();
        for len in [0, 4, HEADER_LEN, blob.len() - 1] {
            let err = open(&blob[..len], &XorProvider).await.unwrap_err();
            assert!(matches!(err, Error::IntegrityFailure(_)), "len {}", len);
        }
    }

    #[tokio::test]
    async fn fresh_nonce_and_key_per_seal() {
        let blob_a = seal(b"same plaintext", &XorProvider).await.unwrap();
        let blob_b = seal(b"same plaintext", &XorProvider).await.unwrap();
        assert_ne!(blob_a[6..18], blob_b[6..18], "nonces must differ");
        assert_ne!(blob_a, blob_b);
    }
}
