//! Integrity tagging of backups.
//!
//! `hmac`: HMAC-SHA256 keyed by a caller-supplied secret over the canonical
//! manifest (tag field blanked) followed by every output's bytes in
//! manifest order. `checksum`: SHA-256 per output, bound together by a
//! SHA-256 over the concatenated per-output digests.

use crate::config::IntegrityType;
use crate::error::Error;
use crate::manifest::Manifest;
use crate::Result;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const HASH_CHUNK: usize = 64 * 1024;

/// Hex SHA-256 of a byte stream, consumed in chunks.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    for chunk in bytes.chunks(HASH_CHUNK) {
        hasher.update(chunk);
    }
    hex::encode(hasher.finalize())
}

/// Compute the integrity tag for a manifest whose `integrity.kind` is set.
/// `outputs` must be in manifest order.
pub fn compute_tag<B: AsRef<[u8]>>(
    manifest: &Manifest,
    outputs: &[(String, B)],
    secret: Option<&[u8]>,
) -> Result<String> {
    let kind = manifest
        .integrity
        .as_ref()
        .map(|i| i.kind)
        .ok_or_else(|| Error::ConfigInvalid("manifest has no integrity section".into()))?;

    match kind {
        IntegrityType::Hmac => {
            let secret = secret.ok_or_else(|| {
                Error::ConfigInvalid("INTEGRITY_PASSWORD is required for hmac integrity".into())
            })?;
            let mut mac = HmacSha256::new_from_slice(secret)
                .map_err(|e| Error::Internal(anyhow::anyhow!("hmac key: {}", e)))?;
            mac.update(manifest.canonical_json_unsigned()?.as_bytes());
            for (_, data) in outputs {
                for chunk in data.as_ref().chunks(HASH_CHUNK) {
                    mac.update(chunk);
                }
            }
            Ok(hex::encode(mac.finalize().into_bytes()))
        }
        IntegrityType::Checksum => {
            let mut binder = Sha256::new();
            for (_, data) in outputs {
                let mut hasher = Sha256::new();
                for chunk in data.as_ref().chunks(HASH_CHUNK) {
                    hasher.update(chunk);
                }
                binder.update(hasher.finalize());
            }
            Ok(hex::encode(binder.finalize()))
        }
    }
}

/// Recompute and compare the tag. Runs before any decryption on restore;
/// a mismatch aborts the whole pipeline.
pub fn verify_tag<B: AsRef<[u8]>>(
    manifest: &Manifest,
    outputs: &[(String, B)],
    secret: Option<&[u8]>,
) -> Result<()> {
    let Some(integrity) = &manifest.integrity else {
        return Ok(());
    };
    let expected = compute_tag(manifest, outputs, secret)?;
    if expected != integrity.value {
        return Err(Error::IntegrityFailure(format!(
            "{:?} tag mismatch",
            integrity.kind
        )));
    }
    Ok(())
}

/// Per-output verification against the manifest `outputs` entries.
pub fn verify_output_hashes<B: AsRef<[u8]>>(
    manifest: &Manifest,
    outputs: &[(String, B)],
) -> Result<()> {
    for entry in &manifest.outputs {
        let data = outputs
            .iter()
            .find(|(name, _)| name == &entry.name)
            .map(|(_, data)| data)
            .ok_or_else(|| Error::StorageNotFound(entry.name.clone()))?;
        if sha256_hex(data.as_ref()) != entry.sha256 {
            return Err(Error::IntegrityFailure(format!(
                "output {} does not match its recorded hash",
                entry.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressionType;
    use crate::manifest::{ArtifactEntry, IntegrityEntry, OutputEntry, Transform};
    use crate::schema::{EngineInfo, FeatureSet};
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn manifest(kind: IntegrityType, outputs: &[(String, Vec<u8>)]) -> Manifest {
        Manifest {
            backup_id: Uuid::nil(),
            created_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            tool_version: "0.1.0".into(),
            engine: EngineInfo {
                kind: "mysql".into(),
                version: "8.0.36".into(),
            },
            features: FeatureSet::default(),
            multiple_files: false,
            transforms: vec![Transform::Compress {
                kind: CompressionType::Tar,
            }],
            artifacts: vec![ArtifactEntry {
                name: "dump.sql".into(),
                sha256: "00".repeat(32),
                size: 3,
            }],
            outputs: outputs
                .iter()
                .map(|(name, data)| OutputEntry {
                    name: name.clone(),
                    sha256: sha256_hex(data),
                    size: data.len() as u64,
                })
                .collect(),
            integrity: Some(IntegrityEntry {
                kind,
                value: String::new(),
            }),
        }
    }

    fn outputs() -> Vec<(String, Vec<u8>)> {
        vec![("dump.backy".to_string(), b"stored bytes".to_vec())]
    }

    #[test]
    fn hmac_tag_round_trips() {
        let outs = outputs();
        let mut m = manifest(IntegrityType::Hmac, &outs);
        m.integrity.as_mut().unwrap().value =
            compute_tag(&m, &outs, Some(b"secret")).unwrap();
        verify_tag(&m, &outs, Some(b"secret")).unwrap();
    }

    #[test]
    fn hmac_detects_flipped_output_byte() {
        let outs = outputs();
        let mut m = manifest(IntegrityType::Hmac, &outs);
        m.integrity.as_mut().unwrap().value =
            compute_tag(&m, &outs, Some(b"secret")).unwrap();

        let mut tampered = outs.clone();
        tampered[0].1[5] ^= 0x01;
        assert!(matches!(
            verify_tag(&m, &tampered, Some(b"secret")),
            Err(Error::IntegrityFailure(_))
        ));
    }

    #[test]
    fn hmac_covers_the_manifest_itself() {
        let outs = outputs();
        let mut m = manifest(IntegrityType::Hmac, &outs);
        m.integrity.as_mut().unwrap().value =
            compute_tag(&m, &outs, Some(b"secret")).unwrap();

        m.multiple_files = true;
        assert!(matches!(
            verify_tag(&m, &outs, Some(b"secret")),
            Err(Error::IntegrityFailure(_))
        ));
    }

    #[test]
    fn hmac_with_wrong_secret_fails() {
        let outs = outputs();
        let mut m = manifest(IntegrityType::Hmac, &outs);
        m.integrity.as_mut().unwrap().value =
            compute_tag(&m, &outs, Some(b"secret")).unwrap();
        assert!(matches!(
            verify_tag(&m, &outs, Some(b"other")),
            Err(Error::IntegrityFailure(_))
        ));
    }

    #[test]
    fn hmac_without_secret_is_config_error() {
        let outs = outputs();
        let m = manifest(IntegrityType::Hmac, &outs);
        assert!(matches!(
            compute_tag(&m, &outs, None),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn checksum_tag_round_trips_and_detects_tamper() {
        let outs = outputs();
        let mut m = manifest(IntegrityType::Checksum, &outs);
        m.integrity.as_mut().unwrap().value = compute_tag(&m, &outs, None).unwrap();
        verify_tag(&m, &outs, None).unwrap();

        let mut tampered = outs.clone();
        tampered[0].1[0] ^= 0x01;
        assert!(matches!(
            verify_tag(&m, &tampered, None),
            Err(Error::IntegrityFailure(_))
        ));
    }

    #[test]
    fn output_hashes_are_verified_individually() {
        let outs = outputs();
        let m = manifest(IntegrityType::Checksum, &outs);
        verify_output_hashes(&m, &outs).unwrap();

        let mut tampered = outs.clone();
        tampered[0].1[0] ^= 0x01;
        assert!(matches!(
            verify_output_hashes(&m, &tampered),
            Err(Error::IntegrityFailure(_))
        ));

        let missing: Vec<(String, Vec<u8>)> = Vec::new();
        assert!(matches!(
            verify_output_hashes(&m, &missing),
            Err(Error::StorageNotFound(_))
        ));
    }

    #[test]
    fn manifest_without_integrity_verifies_trivially() {
        let outs = outputs();
        let mut m = manifest(IntegrityType::Checksum, &outs);
        m.integrity = None;
        verify_tag(&m, &outs, None).unwrap();
    }
}
