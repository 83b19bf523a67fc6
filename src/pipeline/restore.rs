//! Restore orchestration.
//!
//! State machine: Validated → Fetching → IntegrityChecking → (Decrypting?)
//! → (Decompressing?) → Applying → Done. The integrity tag is recomputed
//! before any decryption; on mismatch no bytes reach the crypto layer and
//! nothing touches the database.

use crate::compress;
use crate::config::Settings;
use crate::envelope;
use crate::error::Error;
use crate::integrity::{self, sha256_hex};
use crate::keys::{self, PROVIDER_BACKOFF_CAP, PROVIDER_RETRIES};
use crate::manifest::{Manifest, Transform, MANIFEST_NAME};
use crate::pipeline::with_retries;
use crate::schema::mysql::MySqlAdapter;
use crate::schema::{ObjectCategory, SchemaAdapter};
use crate::storage::{self, STORAGE_BACKOFF_CAP, STORAGE_RETRIES};
use crate::{Result, Secrets};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug)]
pub struct RestoreOutcome {
    pub backup_id: Uuid,
    pub artifacts_applied: usize,
    pub statements_executed: usize,
    pub statements_skipped: usize,
}

pub async fn run_restore(
    settings: &Settings,
    secrets: &Secrets,
    cancel: &CancellationToken,
) -> Result<RestoreOutcome> {
    settings.validate_restore(secrets)?;
    let prefix = settings
        .restore
        .backup_path
        .clone()
        .ok_or_else(|| Error::ConfigInvalid("restore.backup_path is required".into()))?;
    tracing::info!(state = "Validated", prefix = %prefix, "restore job validated");

    let store = storage::build_storage(settings.storage.storage_type, secrets).await?;

    // The manifest is read first; its transform chain is authoritative.
    tracing::info!(state = "Fetching");
    let manifest_name = format!("{}/{}", prefix, MANIFEST_NAME);
    let manifest_bytes = with_retries(
        "fetch manifest",
        STORAGE_RETRIES,
        STORAGE_BACKOFF_CAP,
        || async { storage::read_all(store.as_ref(), &manifest_name).await },
    )
    .await?;
    let manifest_json = String::from_utf8(manifest_bytes)
        .map_err(|_| Error::ConfigInvalid("manifest is not UTF-8".into()))?;
    let manifest = Manifest::from_json(&manifest_json)?;
    tracing::info!(backup_id = %manifest.backup_id, outputs = manifest.outputs.len(), "manifest loaded");

    let mut blobs: Vec<(String, Vec<u8>)> = Vec::with_capacity(manifest.outputs.len());
    for entry in &manifest.outputs {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let name = format!("{}/{}", prefix, entry.name);
        let timeout = settings.storage_timeout();
        let data = with_retries(
            "fetch output",
            STORAGE_RETRIES,
            STORAGE_BACKOFF_CAP,
            || async {
                match tokio::time::timeout(timeout, storage::read_all(store.as_ref(), &name)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::StorageUnavailable(format!("get {} timed out", name))),
                }
            },
        )
        .await?;
        blobs.push((entry.name.clone(), data));
    }

    // Tag first; a tampered backup never reaches the crypto layer.
    tracing::info!(state = "IntegrityChecking");
    let secret = secrets.integrity_password.as_deref().map(str::as_bytes);
    integrity::verify_tag(&manifest, &blobs, secret)?;
    integrity::verify_output_hashes(&manifest, &blobs)?;

    // Reverse the transform chain.
    for transform in manifest.transforms.iter().rev() {
        match transform {
            Transform::Encrypt {
                alg_id,
                key_provider,
            } => {
                tracing::info!(state = "Decrypting", provider = %key_provider);
                if *alg_id != envelope::ALG_AES256_GCM_RSA_OAEP {
                    return Err(Error::KeyAlgorithmUnsupported(format!(
                        "unknown envelope algorithm {}",
                        alg_id
                    )));
                }
                let provider =
                    keys::build_provider(&settings.security, secrets, settings.kms_timeout())?;
                if provider.name() != key_provider {
                    tracing::warn!(
                        manifest_provider = %key_provider,
                        configured = provider.name(),
                        "key provider differs from the one recorded at backup time"
                    );
                }

                let mut decrypted = Vec::with_capacity(blobs.len());
                for (name, blob) in &blobs {
                    let parts = envelope::parse(blob)?;
                    let kms_timeout = settings.kms_timeout();
                    let data_key = with_retries(
                        "unwrap data key",
                        PROVIDER_RETRIES,
                        PROVIDER_BACKOFF_CAP,
                        || async {
                            match tokio::time::timeout(
                                kms_timeout,
                                provider.unwrap_key(parts.wrapped),
                            )
                            .await
                            {
                                Ok(result) => result,
                                Err(_) => Err(Error::ProviderUnavailable(
                                    "data key unwrap timed out".into(),
                                )),
                            }
                        },
                    )
                    .await?;
                    let plain = envelope::decrypt_with(&data_key, parts.nonce, parts.ciphertext)?;
                    decrypted.push((decrypted_name(name), plain));
                }
                blobs = decrypted;
            }
            Transform::Compress { kind } => {
                tracing::info!(state = "Decompressing", kind = kind.as_str());
                let (_, archive) = blobs.pop().ok_or_else(|| {
                    Error::CorruptArchive("manifest lists no archive output".into())
                })?;
                if !blobs.is_empty() {
                    return Err(Error::CorruptArchive(
                        "compressed backup must have exactly one output".into(),
                    ));
                }
                let kind = *kind;
                let members =
                    tokio::task::spawn_blocking(move || compress::extract(kind, &archive))
                        .await
                        .map_err(|e| Error::Internal(anyhow::anyhow!("extract task: {}", e)))??;
                blobs = members.into_iter().map(|m| (m.name, m.data)).collect();
            }
        }
    }

    // Artifacts must hash back to what the schema engine produced.
    for entry in &manifest.artifacts {
        let data = blobs
            .iter()
            .find(|(name, _)| name == &entry.name)
            .map(|(_, data)| data)
            .ok_or_else(|| {
                Error::IntegrityFailure(format!("artifact {} missing after transforms", entry.name))
            })?;
        if sha256_hex(data) != entry.sha256 {
            return Err(Error::IntegrityFailure(format!(
                "artifact {} does not match its recorded hash",
                entry.name
            )));
        }
    }

    tracing::info!(state = "Applying");
    let mut adapter = Box::new(
        MySqlAdapter::connect(&settings.database, &secrets.db_password).await?,
    );
    let live = adapter.engine().await?;
    if let (Some(manifest_major), Some(live_major)) = (manifest.engine.major(), live.major()) {
        if manifest.engine.kind == live.kind && manifest_major != live_major {
            return Err(Error::ConfigInvalid(format!(
                "backup was taken from {} {} but the target server is {}; \
                 restore across major versions is refused",
                manifest.engine.kind, manifest.engine.version, live.version
            )));
        }
    }

    // Tear down existing objects, then recreate in apply-rank order
    // regardless of the order artifacts arrived in.
    adapter.drop_all_objects().await?;
    blobs.sort_by_key(|(name, _)| {
        ObjectCategory::from_member_name(name)
            .map(|c| c.apply_rank())
            .unwrap_or(0)
    });

    let mut executed = 0;
    let mut skipped = 0;
    let artifacts_applied = blobs.len();
    for (name, data) in blobs {
        let script = String::from_utf8(data).map_err(|_| {
            Error::Internal(anyhow::anyhow!("artifact {} is not UTF-8", name))
        })?;
        let report = tokio::select! {
            result = adapter.apply_script(&script, settings.restore.best_effort) => result?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        tracing::info!(artifact = %name, executed = report.executed, skipped = report.skipped.len(), "artifact applied");
        executed += report.executed;
        skipped += report.skipped.len();
    }
    adapter.close().await?;

    tracing::info!(state = "Done", backup_id = %manifest.backup_id, "restore complete");
    Ok(RestoreOutcome {
        backup_id: manifest.backup_id,
        artifacts_applied,
        statements_executed: executed,
        statements_skipped: skipped,
    })
}

/// Name of a blob after its envelope is removed: `tables.backy` came from
/// `tables.sql`, and a compressed `dump.backy` becomes the archive the next
/// reverse transform unpacks.
fn decrypted_name(name: &str) -> String {
    match name.strip_suffix(".backy") {
        Some(stem) => format!("{}.sql", stem),
        None => name.to_string(),
    }
}
